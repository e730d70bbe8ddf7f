//! Low-cost liveness probe.
//!
//! Directly generalizes a heartbeat helper's interval-gated "GET, inspect,
//! maybe act" shape to a cheaper ping contract (no payload beyond
//! `insecure_id`, response is a single bool).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::exchange::MessageExchange;
use crate::identity::Identity;
use crate::transport::Transport;

/// Default interval between liveness pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically GETs `ping_url`, upgrading the next exchange to urgent when
/// the server reports pending inbound messages.
#[derive(Debug)]
pub struct Pinger {
    transport: Arc<dyn Transport>,
    identity: Arc<std::sync::Mutex<Identity>>,
    exchange: Arc<MessageExchange>,
    interval: Duration,
}

impl Pinger {
    /// Builds a pinger bound to the shared identity and exchange scheduler.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        identity: Arc<std::sync::Mutex<Identity>>,
        exchange: Arc<MessageExchange>,
    ) -> Self {
        Self {
            transport,
            identity,
            exchange,
            interval: DEFAULT_PING_INTERVAL,
        }
    }

    /// Overrides the default ping interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Performs a single ping tick. Not started until identity has an
    /// `insecure_id`; failures are silently retried on the next tick.
    pub async fn tick(&self) {
        let insecure_id = self.identity.lock().unwrap().insecure_id.clone();
        let Some(insecure_id) = insecure_id else {
            return;
        };
        match self.transport.ping(&insecure_id).await {
            Ok(response) => {
                let registered = self.identity.lock().unwrap().is_registered();
                if response.messages && registered {
                    self.exchange.schedule_exchange(true);
                }
            }
            Err(e) => {
                log::debug!("ping failed, will retry next tick: {e}");
            }
        }
    }

    /// Runs the periodic ping loop until `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
