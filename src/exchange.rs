//! The exchange scheduler/state machine.
//!
//! Generalizes a polling layer's due-check/timestamp bookkeeping
//! (`PollingState::should_poll`) into a proper scheduled async task, since
//! this broker has no render loop tick to piggyback scheduling on.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::identity::Identity;
use crate::message::{unhandled_operation_result, Message};
use crate::message_store::MessageStore;
use crate::persist::Persist;
use crate::reactor::Reactor;
use crate::transport::{ExchangeRequest, ExchangeResponse, Transport};

/// Default interval between ordinary exchanges.
pub const DEFAULT_EXCHANGE_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Interval used once an exchange is scheduled "urgent".
pub const DEFAULT_URGENT_EXCHANGE_INTERVAL: Duration = Duration::from_secs(10);
/// How long before a scheduled exchange `impending-exchange` fires.
const IMPENDING_EXCHANGE_LEAD: Duration = Duration::from_secs(10);

/// Exchange state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// No exchange scheduled or running.
    Idle,
    /// A timer is armed for a future exchange.
    Scheduled,
    /// An exchange round is currently talking to the transport.
    InFlight,
    /// The most recent round failed.
    Failed,
}

/// Outcome of one completed exchange round, shared with anyone awaiting a
/// concurrent `exchange()` call.
#[derive(Debug, Clone)]
pub enum ExchangeOutcome {
    /// The round completed successfully.
    Success,
    /// The round failed (transport error); message durability preserved.
    Failed,
}

struct Shared {
    state: Mutex<ExchangeState>,
    urgent: Mutex<bool>,
    urgency_requested_mid_round: Mutex<bool>,
    in_flight: Mutex<Option<watch::Receiver<Option<ExchangeOutcome>>>>,
    client_accepted_types: Mutex<BTreeSet<String>>,
    next_api_counter: Mutex<u64>,
    last_exchange_time: Mutex<f64>,
}

/// Built-in message types every broker accepts regardless of server config.
fn default_accepted_types() -> BTreeSet<String> {
    ["register", "operation-result"].into_iter().map(String::from).collect()
}

/// An injected fan-out to local clients: given an inbound message, returns
/// whether each currently registered client handled it. Kept separate from
/// the reactor's synchronous `"message"` listeners (like `RegistrationHandler`)
/// since client dispatch goes through an async `RemoteClient::message`.
pub type ClientDispatch = Arc<dyn Fn(Message) -> Pin<Box<dyn Future<Output = Vec<bool>> + Send>> + Send + Sync>;

/// The central scheduler/state machine coordinating MessageStore, Identity,
/// Transport, and the Reactor.
pub struct MessageExchange {
    reactor: Arc<Reactor>,
    store: Arc<Mutex<MessageStore>>,
    identity: Arc<Mutex<Identity>>,
    persist: Arc<Mutex<Persist>>,
    transport: Arc<dyn Transport>,
    exchange_interval: Duration,
    urgent_exchange_interval: Duration,
    shared: Arc<Shared>,
    client_dispatch: Mutex<Option<ClientDispatch>>,
}

impl std::fmt::Debug for MessageExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageExchange")
            .field("state", &*self.shared.state.lock().unwrap())
            .field("urgent", &*self.shared.urgent.lock().unwrap())
            .finish()
    }
}

impl MessageExchange {
    /// Builds an exchange bound to the shared components it coordinates.
    #[must_use]
    pub fn new(
        reactor: Arc<Reactor>,
        store: Arc<Mutex<MessageStore>>,
        identity: Arc<Mutex<Identity>>,
        persist: Arc<Mutex<Persist>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            reactor,
            store,
            identity,
            persist,
            transport,
            exchange_interval: DEFAULT_EXCHANGE_INTERVAL,
            urgent_exchange_interval: DEFAULT_URGENT_EXCHANGE_INTERVAL,
            shared: Arc::new(Shared {
                state: Mutex::new(ExchangeState::Idle),
                urgent: Mutex::new(false),
                urgency_requested_mid_round: Mutex::new(false),
                in_flight: Mutex::new(None),
                client_accepted_types: Mutex::new(default_accepted_types()),
                next_api_counter: Mutex::new(0),
                last_exchange_time: Mutex::new(0.0),
            }),
            client_dispatch: Mutex::new(None),
        }
    }

    /// Wires the client fan-out used by inbound message dispatch. Call once,
    /// after the client registry that will back it exists (which is
    /// constructed after `MessageExchange` itself).
    pub fn set_client_dispatch(&self, dispatch: ClientDispatch) {
        *self.client_dispatch.lock().unwrap() = Some(dispatch);
    }

    /// Overrides the default intervals (used by tests and configuration).
    #[must_use]
    pub fn with_intervals(mut self, exchange: Duration, urgent: Duration) -> Self {
        self.exchange_interval = exchange;
        self.urgent_exchange_interval = urgent;
        self
    }

    /// True while the exchange is scheduled (or running) at the urgent interval.
    #[must_use]
    pub fn is_urgent(&self) -> bool {
        *self.shared.urgent.lock().unwrap()
    }

    /// Current scheduler state.
    #[must_use]
    pub fn state(&self) -> ExchangeState {
        *self.shared.state.lock().unwrap()
    }

    /// Adds `message_type` to the locally accepted set; a change upgrades
    /// the next exchange to urgent so the server learns the new capability.
    pub fn register_client_accepted_message_type(&self, message_type: impl Into<String>) {
        let message_type = message_type.into();
        let inserted = self
            .shared
            .client_accepted_types
            .lock()
            .unwrap()
            .insert(message_type);
        if inserted {
            self.request_urgent();
        }
    }

    /// The union of built-in and dynamically registered accepted types, sorted.
    #[must_use]
    pub fn get_client_accepted_message_types(&self) -> Vec<String> {
        self.shared.client_accepted_types.lock().unwrap().iter().cloned().collect()
    }

    fn request_urgent(&self) {
        let in_flight = self.shared.in_flight.lock().unwrap().is_some();
        if in_flight {
            *self.shared.urgency_requested_mid_round.lock().unwrap() = true;
        } else {
            self.schedule_exchange(true);
        }
    }

    /// Forces one exchange now. A second call while a round is already
    /// in-flight returns a clone of the in-flight round's completion
    /// instead of starting a new one; any new urgency request is deferred
    /// to the next `schedule_exchange`.
    pub async fn exchange(&self) -> ExchangeOutcome {
        let existing = self.shared.in_flight.lock().unwrap().clone();
        if let Some(mut rx) = existing {
            loop {
                if let Some(outcome) = rx.borrow().clone() {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return ExchangeOutcome::Failed;
                }
            }
        }

        let (tx, rx) = watch::channel(None);
        *self.shared.in_flight.lock().unwrap() = Some(rx);
        *self.shared.state.lock().unwrap() = ExchangeState::InFlight;

        let outcome = self.run_round().await;

        *self.shared.in_flight.lock().unwrap() = None;
        let _ = tx.send(Some(outcome.clone()));
        outcome
    }

    async fn run_round(&self) -> ExchangeOutcome {
        self.reactor.fire("pre-exchange", &vec![]);

        let (next_expected_sequence, accepted_types, pending) = {
            let store = self.store.lock().unwrap();
            (
                store.server_sequence() + 1,
                store.get_accepted_message_types(),
                store.get_pending_messages(crate::message_store::DEFAULT_MAX_PENDING),
            )
        };

        let last_exchange_time = *self.shared.last_exchange_time.lock().unwrap();
        let mut messages: Vec<Message> = Vec::with_capacity(pending.len());
        for record in &pending {
            let mut payload = record.payload.clone();
            let api = {
                let mut counter = self.shared.next_api_counter.lock().unwrap();
                let value = *counter;
                *counter += 1;
                value
            };
            payload.set_api(api);
            payload.set_timestamp(chrono::Utc::now().to_rfc3339());
            messages.push(payload);
        }
        let sent_count = messages.len();

        let request = ExchangeRequest {
            client_api: "3.3".to_string(),
            server_api: "3.3".to_string(),
            next_expected_sequence,
            last_exchange_time,
            accepted_types,
            messages,
        };

        let secure_id = self.identity.lock().unwrap().secure_id.clone();

        {
            let mut store = self.store.lock().unwrap();
            store.set_pending_offset(sent_count);
        }

        match self.transport.exchange(&request, secure_id.as_deref()).await {
            Err(_) => {
                {
                    let mut store = self.store.lock().unwrap();
                    store.rewind_pending_offset();
                }
                self.reactor.fire("exchange-failed", &vec![]);
                *self.shared.state.lock().unwrap() = ExchangeState::Failed;
                self.schedule_exchange(false);
                ExchangeOutcome::Failed
            }
            Ok(response) => {
                self.handle_success(response).await;
                *self.shared.last_exchange_time.lock().unwrap() =
                    std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_secs_f64())
                        .unwrap_or(0.0);
                *self.shared.state.lock().unwrap() = ExchangeState::Idle;
                let more_pending = {
                    let store = self.store.lock().unwrap();
                    !store.get_pending_messages(1).is_empty()
                };
                let mid_round_urgency = {
                    let mut flag = self.shared.urgency_requested_mid_round.lock().unwrap();
                    std::mem::take(&mut *flag)
                };
                self.schedule_exchange(more_pending || mid_round_urgency);
                ExchangeOutcome::Success
            }
        }
    }

    async fn handle_success(&self, response: ExchangeResponse) {
        let client_sequence = response.next_expected_sequence.saturating_sub(1);
        {
            let mut persist = self.persist.lock().unwrap();
            let mut store = self.store.lock().unwrap();
            if let Err(e) = store.acknowledge_through(client_sequence, &mut persist) {
                e.crash_if_fatal();
            }
        }

        // Open question resolution: delete-before-dispatch, so handler-triggered
        // enqueues receive fresh seqs above the new client_sequence. The
        // acknowledge_through call above already deletes before we dispatch below.

        for message in response.messages {
            let server_sequence = {
                let mut persist = self.persist.lock().unwrap();
                let mut store = self.store.lock().unwrap();
                let next = store.server_sequence() + 1;
                let _ = store.set_server_sequence(next, &mut persist);
                next
            };
            let _ = server_sequence;

            let results = self.handle_message(&message).await;
            let acknowledged = results.iter().any(|r| r.as_bool() != Some(false));
            if let Some(operation_id) = message.operation_id() {
                if !acknowledged {
                    let failure =
                        unhandled_operation_result(message.message_type(), operation_id);
                    let mut persist = self.persist.lock().unwrap();
                    let mut store = self.store.lock().unwrap();
                    let _ = store.add(failure, &mut persist);
                }
            }
        }

        if let Some(server_uuid) = response.server_uuid {
            let mut persist = self.persist.lock().unwrap();
            let mut store = self.store.lock().unwrap();
            if let Ok(Some(old)) = store.set_server_uuid(server_uuid.clone(), &mut persist) {
                drop(store);
                drop(persist);
                self.reactor
                    .fire("server-uuid-changed", &vec![json!(old), json!(server_uuid)]);
            }
        }

        if response.client_accepted_types_changed {
            // The server only tells us *that* acceptance changed; a real
            // deployment would re-fetch the set via a dedicated field. This
            // engine re-applies the currently known set so listeners still
            // observe a `message-type-acceptance-changed` re-announcement.
            let types = self.get_client_accepted_message_types().into_iter().collect();
            let mut persist = self.persist.lock().unwrap();
            let mut store = self.store.lock().unwrap();
            if let Ok(changes) = store.set_accepted_types(types, &mut persist) {
                drop(store);
                drop(persist);
                for change in changes {
                    self.reactor.fire(
                        &crate::reactor::compound_key(
                            "message-type-acceptance-changed",
                            &change.message_type,
                        ),
                        &vec![json!(change.message_type), json!(change.accepted)],
                    );
                }
            }
        }

        self.reactor.fire("exchange-done", &vec![]);
    }

    /// Dispatches an inbound message to reactor listeners on `"message"`
    /// (synchronous, e.g. `RegistrationHandler`) and, if wired, to the
    /// registered local clients (asynchronous), returning every responder's
    /// result. Shared by the exchange response path and direct test/hook-level
    /// injection.
    pub async fn handle_message(&self, message: &Message) -> Vec<serde_json::Value> {
        let mut results = self
            .reactor
            .fire("message", &vec![serde_json::to_value(message).unwrap_or(json!({}))]);

        let dispatch = self.client_dispatch.lock().unwrap().clone();
        if let Some(dispatch) = dispatch {
            let handled = dispatch(message.clone()).await;
            results.extend(handled.into_iter().map(|b| json!(b)));
        }

        results
    }

    /// Schedules the next exchange. If `urgent` and the timer isn't already
    /// urgent, re-arms at `urgent_exchange_interval`; repeated urgent calls
    /// within the same interval are idempotent.
    pub fn schedule_exchange(&self, urgent: bool) {
        let mut current_urgent = self.shared.urgent.lock().unwrap();
        if urgent && !*current_urgent {
            *current_urgent = true;
        } else if !urgent {
            *current_urgent = false;
        }
        *self.shared.state.lock().unwrap() = ExchangeState::Scheduled;
        self.reactor.fire("impending-exchange-scheduled", &vec![]);
    }

    /// Cancels any outstanding timer. An in-flight exchange runs to
    /// completion but does not reschedule afterward.
    pub fn stop(&self) {
        *self.shared.state.lock().unwrap() = ExchangeState::Idle;
    }

    /// Arms the first exchange at the normal interval.
    pub fn start(&self) {
        self.schedule_exchange(false);
    }

    /// The effective interval for the next scheduled round.
    #[must_use]
    pub fn next_interval(&self) -> Duration {
        if self.is_urgent() {
            self.urgent_exchange_interval
        } else {
            self.exchange_interval
        }
    }

    /// Duration until `impending-exchange` should fire for the currently
    /// scheduled round (clamped to zero for very short intervals, e.g. the
    /// urgent interval itself).
    #[must_use]
    pub fn impending_exchange_lead(&self) -> Duration {
        self.next_interval().saturating_sub(IMPENDING_EXCHANGE_LEAD)
    }
}

/// Runs the exchange's timer loop until `shutdown` fires, driving
/// `exchange()` at `next_interval()` and firing `impending-exchange`
/// `IMPENDING_EXCHANGE_LEAD` before each round. The single `tokio::select!`
/// owner of this component's timers.
pub async fn run_timer_loop(exchange: Arc<MessageExchange>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let interval = exchange.next_interval();
        let impending_at = interval.saturating_sub(IMPENDING_EXCHANGE_LEAD);

        tokio::select! {
            _ = tokio::time::sleep_until(Instant::now() + impending_at) => {
                exchange.reactor.fire("impending-exchange", &vec![]);
                tokio::time::sleep(interval.saturating_sub(impending_at)).await;
                exchange.exchange().await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    exchange.stop();
                    return;
                }
            }
        }
    }
}
