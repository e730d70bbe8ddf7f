//! One-shot idempotent registration handshake.
//!
//! Directly generalizes `hub::registration::register_device` /
//! `register_hub_with_server`'s "build payload, send, log outcome" shape;
//! here the payload rides the durable message store instead of a direct
//! HTTP call, since registration is just another message type multiplexed
//! through the same exchange round as everything else.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::error::Result;
use crate::exchange::MessageExchange;
use crate::identity::Identity;
use crate::message::Message;
use crate::message_store::MessageStore;
use crate::persist::Persist;
use crate::reactor::Reactor;

/// An injected async probe for optional registration payload fields
/// (`vm-info`, `container-info`). `None` means the host has nothing to
/// report, which omits the field entirely rather than sending `null`.
pub type InfoProbe = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Option<Value>> + Send>> + Send + Sync>;

/// Why a `register()` completion was rejected.
#[derive(Debug, Clone)]
pub struct RegistrationFailed {
    /// The reason the server gave, if any.
    pub reason: Option<String>,
}

enum Waiting {
    None,
    Pending(Vec<oneshot::Sender<std::result::Result<(), RegistrationFailed>>>),
}

struct Inner {
    waiting: Mutex<Waiting>,
    attempted: Mutex<bool>,
}

/// Subscribes to `pre-exchange`/`message` and owns the registration handshake.
#[derive(Debug)]
pub struct RegistrationHandler {
    reactor: Arc<Reactor>,
    store: Arc<Mutex<MessageStore>>,
    identity: Arc<Mutex<Identity>>,
    persist: Arc<Mutex<Persist>>,
    exchange: Arc<MessageExchange>,
    vm_info_probe: Option<InfoProbe>,
    container_info_probe: Option<InfoProbe>,
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner").finish_non_exhaustive()
    }
}

impl RegistrationHandler {
    /// Builds the handler and wires its `pre-exchange`/`message` listeners
    /// into `reactor`. Call once per broker lifetime.
    #[must_use]
    pub fn install(
        reactor: Arc<Reactor>,
        store: Arc<Mutex<MessageStore>>,
        identity: Arc<Mutex<Identity>>,
        persist: Arc<Mutex<Persist>>,
        exchange: Arc<MessageExchange>,
    ) -> Arc<Self> {
        Self::install_with_probes(reactor, store, identity, persist, exchange, None, None)
    }

    /// Like `install`, but with `vm-info`/`container-info` probes wired in.
    /// Kept separate from `install` so the common no-probe path (and its
    /// existing tests) stays synchronous.
    #[must_use]
    pub fn install_with_probes(
        reactor: Arc<Reactor>,
        store: Arc<Mutex<MessageStore>>,
        identity: Arc<Mutex<Identity>>,
        persist: Arc<Mutex<Persist>>,
        exchange: Arc<MessageExchange>,
        vm_info_probe: Option<InfoProbe>,
        container_info_probe: Option<InfoProbe>,
    ) -> Arc<Self> {
        let handler = Arc::new(Self {
            reactor: reactor.clone(),
            store,
            identity,
            persist,
            exchange,
            vm_info_probe,
            container_info_probe,
            inner: Arc::new(Inner {
                waiting: Mutex::new(Waiting::None),
                attempted: Mutex::new(false),
            }),
        });

        let h = handler.clone();
        reactor.call_on("pre-exchange", move |_args| {
            h.on_pre_exchange();
            serde_json::Value::Null
        });

        let h = handler.clone();
        reactor.call_on("message", move |args| h.on_message(args));

        handler
    }

    fn base_register_message(identity: &Identity) -> Message {
        let mut register_msg = Message::new("register")
            .with_field("computer-title", identity.computer_title.clone().unwrap_or_default())
            .with_field("account-name", identity.account_name.clone().unwrap_or_default());
        if let Some(password) = &identity.registration_password {
            register_msg = register_msg.with_field("registration-password", password.clone());
        }
        if let Ok(hostname) = hostname::get().map(|h| h.to_string_lossy().into_owned()) {
            register_msg = register_msg.with_field("hostname", hostname);
        }
        register_msg
    }

    fn on_pre_exchange(&self) {
        let identity = self.identity.lock().unwrap().clone();
        if identity.is_registered() || !identity.ready_to_register() {
            return;
        }
        let mut attempted = self.inner.attempted.lock().unwrap();
        if *attempted {
            return;
        }
        *attempted = true;
        drop(attempted);

        let register_msg = Self::base_register_message(&identity);

        if self.vm_info_probe.is_none() && self.container_info_probe.is_none() {
            let mut persist = self.persist.lock().unwrap();
            let mut store = self.store.lock().unwrap();
            let _ = store.add(register_msg, &mut persist);
            drop(store);
            drop(persist);
            self.exchange.schedule_exchange(true);
            return;
        }

        let vm_probe = self.vm_info_probe.clone();
        let container_probe = self.container_info_probe.clone();
        let store = self.store.clone();
        let persist = self.persist.clone();
        let exchange = self.exchange.clone();
        tokio::spawn(async move {
            let mut register_msg = register_msg;
            if let Some(probe) = vm_probe {
                if let Some(v) = probe().await {
                    register_msg = register_msg.with_field("vm-info", v);
                }
            }
            if let Some(probe) = container_probe {
                if let Some(v) = probe().await {
                    register_msg = register_msg.with_field("container-info", v);
                }
            }
            {
                let mut persist = persist.lock().unwrap();
                let mut store = store.lock().unwrap();
                let _ = store.add(register_msg, &mut persist);
            }
            exchange.schedule_exchange(true);
        });
    }

    /// Dispatches an inbound `"message"` event: `set-id`/`registration`/
    /// `unknown-id` are this handler's concern, everything else is left for
    /// other listeners (or the unhandled-operation fallback) to pick up.
    fn on_message(&self, args: &crate::reactor::EventArgs) -> Value {
        let Some(message) = args.first() else {
            return json!(false);
        };
        match message.get("type").and_then(Value::as_str) {
            Some("set-id") => {
                let id = message.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                let insecure_id = message
                    .get("insecure-id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let _ = self.handle_set_id(id, insecure_id);
                json!(true)
            }
            Some("registration") => {
                let reason = message.get("info").and_then(Value::as_str).map(String::from);
                self.handle_registration_failure(reason);
                json!(true)
            }
            Some("unknown-id") => {
                let _ = self.handle_unknown_id();
                json!(true)
            }
            _ => json!(false),
        }
    }

    /// Handles `set-id`: the server accepted registration.
    pub fn handle_set_id(&self, id: String, insecure_id: String) -> Result<()> {
        let mut identity = self.identity.lock().unwrap().clone();
        identity.secure_id = Some(id);
        identity.insecure_id = Some(insecure_id);
        {
            let mut persist = self.persist.lock().unwrap();
            identity.save(&mut persist)?;
        }
        *self.identity.lock().unwrap() = identity;
        *self.inner.attempted.lock().unwrap() = false;

        self.reactor.fire("registration-done", &vec![]);
        self.resolve_waiters(Ok(()));
        Ok(())
    }

    /// Handles a registration failure message carrying a reason.
    pub fn handle_registration_failure(&self, reason: Option<String>) {
        self.reactor
            .fire("registration-failed", &vec![serde_json::json!(reason)]);
        self.resolve_waiters(Err(RegistrationFailed { reason }));
        *self.inner.attempted.lock().unwrap() = false;
    }

    /// Handles `unknown-id`: clear our secure-id and retry on the next exchange.
    pub fn handle_unknown_id(&self) -> Result<()> {
        let mut identity = self.identity.lock().unwrap().clone();
        identity.secure_id = None;
        {
            let mut persist = self.persist.lock().unwrap();
            identity.save(&mut persist)?;
        }
        *self.identity.lock().unwrap() = identity;
        *self.inner.attempted.lock().unwrap() = false;
        self.reactor.fire("resynchronize", &vec![]);
        Ok(())
    }

    fn resolve_waiters(&self, result: std::result::Result<(), RegistrationFailed>) {
        let mut waiting = self.inner.waiting.lock().unwrap();
        if let Waiting::Pending(senders) = std::mem::replace(&mut *waiting, Waiting::None) {
            for sender in senders {
                let _ = sender.send(result.clone());
            }
        }
    }

    /// Returns a handle resolved on the next `registration-done`, or
    /// rejected on `registration-failed`.
    pub fn register(&self) -> oneshot::Receiver<std::result::Result<(), RegistrationFailed>> {
        let (tx, rx) = oneshot::channel();
        let mut waiting = self.inner.waiting.lock().unwrap();
        match &mut *waiting {
            Waiting::None => *waiting = Waiting::Pending(vec![tx]),
            Waiting::Pending(senders) => senders.push(tx),
        }
        rx
    }
}
