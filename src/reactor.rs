//! In-process event bus used by every other component.
//!
//! Generalizes the unified `mpsc` channel plus closure-dispatch shape the
//! teacher's hub event system uses, but keyed by name (and optionally a
//! compound `(name, tag)` pair) instead of a single closed enum, since the
//! broker's event set is open-ended (`message-type-acceptance-changed` fires
//! once per type, for instance).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;

/// Arguments passed to a fired event; listeners get an owned slice of JSON values.
pub type EventArgs = Vec<Value>;

/// A listener's return value, collected by `fire()` into the outer result list.
pub type ListenerResult = Value;

type Listener = Box<dyn FnMut(&EventArgs) -> ListenerResult + Send>;

/// Opaque handle returned by `call_on`, needed to `cancel` a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

struct Entry {
    key: String,
    handle: ListenerHandle,
    listener: Listener,
}

/// Name-keyed event bus: `call_on(name, fn) -> handle`, `fire(name, args) ->
/// [fn-return]`, `cancel(handle)`. Listeners run synchronously, in
/// subscription order, before `fire` returns its result list.
#[derive(Default)]
pub struct Reactor {
    entries: Mutex<Vec<Entry>>,
    next_handle: AtomicU64,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.entries.lock().unwrap().len();
        f.debug_struct("Reactor").field("listener_count", &count).finish()
    }
}

/// Composes a compound event key, e.g. `("message-type-acceptance-changed", "test")`.
#[must_use]
pub fn compound_key(name: &str, tag: &str) -> String {
    format!("{name}\0{tag}")
}

impl Reactor {
    /// Builds an empty reactor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `listener` to `name`, returning a handle usable with `cancel`.
    pub fn call_on(
        &self,
        name: impl Into<String>,
        listener: impl FnMut(&EventArgs) -> ListenerResult + Send + 'static,
    ) -> ListenerHandle {
        let handle = ListenerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().unwrap().push(Entry {
            key: name.into(),
            handle,
            listener: Box::new(listener),
        });
        handle
    }

    /// Fires `name`, invoking every subscribed listener in subscription
    /// order and collecting their return values.
    pub fn fire(&self, name: &str, args: &EventArgs) -> Vec<ListenerResult> {
        let mut entries = self.entries.lock().unwrap();
        entries
            .iter_mut()
            .filter(|e| e.key == name)
            .map(|e| (e.listener)(args))
            .collect()
    }

    /// Unsubscribes a previously registered listener. No-op if already cancelled.
    pub fn cancel(&self, handle: ListenerHandle) {
        self.entries.lock().unwrap().retain(|e| e.handle != handle);
    }

    /// Number of currently subscribed listeners for `name`.
    #[must_use]
    pub fn listener_count(&self, name: &str) -> usize {
        self.entries.lock().unwrap().iter().filter(|e| e.key == name).count()
    }
}

/// A map of one-shot "resolve on first named event" waiters, backing
/// `BrokerServer::listen_events`. Kept separate from `Reactor` because a
/// one-shot waiter unsubscribes every other name it was also waiting on as
/// soon as any one of them fires.
#[derive(Debug, Default)]
pub struct OneShotWaiters {
    registered: Mutex<HashMap<u64, Vec<ListenerHandle>>>,
    next_id: AtomicU64,
}

impl OneShotWaiters {
    /// Builds an empty waiter table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to the first of `names` to fire, sending the winning name
    /// down `sender` and unsubscribing the rest. Cancellation of the sibling
    /// subscriptions happens on a spawned task, one tick after the winner
    /// fires, so it never tries to re-enter the reactor's lock from inside
    /// the listener callback that `fire()` is currently holding.
    pub fn listen_events(
        &self,
        reactor: std::sync::Arc<Reactor>,
        names: Vec<String>,
        sender: tokio::sync::oneshot::Sender<String>,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sender = std::sync::Arc::new(Mutex::new(Some(sender)));
        let handles = std::sync::Arc::new(Mutex::new(Vec::new()));
        for name in &names {
            let sender = sender.clone();
            let name_owned = name.clone();
            let reactor_for_cleanup = reactor.clone();
            let handles_for_cleanup = handles.clone();
            let handle = reactor.call_on(name.clone(), move |_args| {
                if let Some(tx) = sender.lock().unwrap().take() {
                    let _ = tx.send(name_owned.clone());
                    let reactor = reactor_for_cleanup.clone();
                    let siblings = handles_for_cleanup.lock().unwrap().clone();
                    tokio::spawn(async move {
                        for h in siblings {
                            reactor.cancel(h);
                        }
                    });
                }
                Value::Null
            });
            handles.lock().unwrap().push(handle);
        }
        self.registered.lock().unwrap().insert(id, handles.lock().unwrap().clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fire_invokes_listeners_in_subscription_order() {
        let reactor = Reactor::new();
        let order = std::sync::Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        reactor.call_on("evt", move |_| {
            o1.lock().unwrap().push(1);
            Value::Null
        });
        let o2 = order.clone();
        reactor.call_on("evt", move |_| {
            o2.lock().unwrap().push(2);
            Value::Null
        });
        reactor.fire("evt", &vec![]);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn fire_collects_return_values() {
        let reactor = Reactor::new();
        reactor.call_on("evt", |_| json!("a"));
        reactor.call_on("evt", |_| json!("b"));
        let results = reactor.fire("evt", &vec![]);
        assert_eq!(results, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn cancel_removes_listener() {
        let reactor = Reactor::new();
        let handle = reactor.call_on("evt", |_| Value::Null);
        reactor.cancel(handle);
        assert_eq!(reactor.listener_count("evt"), 0);
        assert!(reactor.fire("evt", &vec![]).is_empty());
    }

    #[test]
    fn compound_key_distinguishes_tags() {
        let reactor = Reactor::new();
        reactor.call_on(compound_key("message-type-acceptance-changed", "a"), |_| {
            json!("a-changed")
        });
        reactor.call_on(compound_key("message-type-acceptance-changed", "b"), |_| {
            json!("b-changed")
        });
        let results = reactor.fire(&compound_key("message-type-acceptance-changed", "a"), &vec![]);
        assert_eq!(results, vec![json!("a-changed")]);
    }

    #[tokio::test]
    async fn listen_events_resolves_with_first_firing_name() {
        let reactor = std::sync::Arc::new(Reactor::new());
        let waiters = OneShotWaiters::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        waiters.listen_events(reactor.clone(), vec!["a".to_string(), "b".to_string()], tx);
        reactor.fire("b", &vec![]);
        assert_eq!(rx.await.unwrap(), "b");
    }
}
