//! BrokerServer: the façade exposing operations to local clients and
//! fanning reactor events out to them.
//!
//! Grounded on `ClientRegistry`'s registry shape plus the dispatch-table
//! role a central hub struct plays elsewhere in this codebase: one struct
//! holding every collaborator, each public method a pure dispatch into one
//! of them.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::client::ClientRegistry;
use crate::config::Config;
use crate::error::Result;
use crate::exchange::{ClientDispatch, MessageExchange};
use crate::message::Message;
use crate::message_store::MessageStore;
use crate::persist::Persist;
use crate::reactor::{OneShotWaiters, Reactor};
use crate::registration::RegistrationHandler;

const BROADCAST_EVENTS: &[&str] = &[
    "resynchronize",
    "impending-exchange",
    "exchange-failed",
    "registration-done",
    "registration-failed",
    "broker-reconnect",
    "broker-started",
    "server-uuid-changed",
    "message-type-acceptance-changed",
    "package-data-changed",
];

/// The broker's single façade. Owns exactly one `Persist`, one
/// `MessageStore`, and one `MessageExchange`; everything else is passed in
/// by reference at construction rather than reached for as process-global
/// state.
pub struct BrokerServer {
    reactor: Arc<Reactor>,
    store: Arc<Mutex<MessageStore>>,
    persist: Arc<Mutex<Persist>>,
    exchange: Arc<MessageExchange>,
    registration: Arc<RegistrationHandler>,
    clients: AsyncMutex<ClientRegistry>,
    waiters: OneShotWaiters,
    config: Mutex<Config>,
}

impl std::fmt::Debug for BrokerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerServer").finish_non_exhaustive()
    }
}

impl BrokerServer {
    /// Assembles the façade over its already-constructed collaborators and
    /// subscribes it to the broadcast event names it forwards to clients.
    #[must_use]
    pub fn new(
        reactor: Arc<Reactor>,
        store: Arc<Mutex<MessageStore>>,
        persist: Arc<Mutex<Persist>>,
        exchange: Arc<MessageExchange>,
        registration: Arc<RegistrationHandler>,
        config: Config,
    ) -> Arc<Self> {
        let server = Arc::new(Self {
            reactor: reactor.clone(),
            store,
            persist,
            exchange,
            registration,
            clients: AsyncMutex::new(ClientRegistry::new()),
            waiters: OneShotWaiters::new(),
            config: Mutex::new(config),
        });

        for name in BROADCAST_EVENTS {
            let server = server.clone();
            reactor.call_on(*name, move |args| {
                let server = server.clone();
                let args = args.clone();
                let name = (*name).to_string();
                tokio::spawn(async move {
                    server.clients.lock().await.broadcast(&name, &args).await;
                });
                Value::Null
            });
        }

        let dispatch_server = server.clone();
        let dispatch: ClientDispatch = Arc::new(move |message: Message| {
            let server = dispatch_server.clone();
            Box::pin(async move {
                let value = serde_json::to_value(&message).unwrap_or(Value::Null);
                server.clients.lock().await.dispatch_message(&value).await
            })
        });
        server.exchange.set_client_dispatch(dispatch);

        server
    }

    /// `ping() -> true`.
    #[must_use]
    pub fn ping(&self) -> bool {
        true
    }

    /// Fires `broker-started`, telling every currently registered client to
    /// re-send its accepted-message-type registrations and re-identify.
    /// Call once startup has settled (after connectors have had a chance to
    /// register their clients).
    pub fn announce_started(&self) {
        self.reactor.fire("broker-started", &vec![]);
    }

    /// `send_message(msg, urgent) -> seq`.
    pub fn send_message(&self, message: Message, urgent: bool) -> Result<u64> {
        let seq = {
            let mut store = self.store.lock().unwrap();
            let mut persist = self.persist.lock().unwrap();
            store.add(message, &mut persist)?
        };
        if urgent {
            self.exchange.schedule_exchange(true);
        }
        Ok(seq)
    }

    /// `is_message_pending(seq) -> bool`.
    #[must_use]
    pub fn is_message_pending(&self, seq: u64) -> bool {
        self.store.lock().unwrap().is_message_pending(seq)
    }

    /// `register_client(name)`.
    pub async fn register_client(&self, name: &str) -> Result<()> {
        self.clients.lock().await.register_client(name).await
    }

    /// `get_clients()`.
    pub async fn get_clients(&self) -> Vec<String> {
        self.clients.lock().await.get_clients().into_iter().map(String::from).collect()
    }

    /// `get_client(name)`: the client's currently accepted message types, if registered.
    pub async fn get_client(&self, name: &str) -> Option<Vec<String>> {
        self.clients
            .lock()
            .await
            .get_client(name)
            .map(|registration| registration.accepted_types.iter().cloned().collect())
    }

    /// `get_connectors()`.
    pub async fn get_connectors(&self) -> Vec<String> {
        self.clients.lock().await.get_connectors().into_iter().map(String::from).collect()
    }

    /// `get_connector(name)`.
    pub async fn get_connector(&self, name: &str) -> bool {
        self.clients.lock().await.get_connector(name)
    }

    /// `stop_clients() -> completion`.
    pub async fn stop_clients(&self) -> std::result::Result<(), Vec<String>> {
        let results = self.clients.lock().await.stop_clients().await;
        let failed: Vec<String> = results
            .into_iter()
            .filter_map(|(name, r)| r.err().map(|_| name))
            .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(failed)
        }
    }

    /// `reload_configuration() -> completion`.
    pub async fn reload_configuration(&self) -> std::result::Result<(), Vec<String>> {
        self.stop_clients().await?;
        match Config::load() {
            Ok(new_config) => {
                *self.config.lock().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(vec![format!("failed to reload configuration: {e}")]),
        }
    }

    /// `register() -> completion`.
    pub fn register(&self) -> oneshot::Receiver<std::result::Result<(), crate::registration::RegistrationFailed>> {
        self.registration.register()
    }

    /// `get_accepted_message_types() -> [types]`.
    #[must_use]
    pub fn get_accepted_message_types(&self) -> Vec<String> {
        self.store.lock().unwrap().get_accepted_message_types()
    }

    /// `get_server_uuid() -> uuid or None`.
    #[must_use]
    pub fn get_server_uuid(&self) -> Option<String> {
        self.store.lock().unwrap().get_server_uuid().map(String::from)
    }

    /// `register_client_accepted_message_type(name, type)`: records the
    /// acceptance both on the client's own record and on the exchange's
    /// combined accepted-types set.
    pub async fn register_client_accepted_message_type(&self, name: &str, message_type: impl Into<String>) {
        let message_type = message_type.into();
        self.clients
            .lock()
            .await
            .register_client_accepted_message_type(name, message_type.clone());
        self.exchange.register_client_accepted_message_type(message_type);
    }

    /// `fire_event(name, *args)`.
    pub fn fire_event(&self, name: &str, args: &[Value]) -> Vec<Value> {
        self.reactor.fire(name, &args.to_vec())
    }

    /// `listen_events([names]) -> completion(name)`.
    pub fn listen_events(&self, names: Vec<String>) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.waiters.listen_events(self.reactor.clone(), names, tx);
        rx
    }

    /// `exit() -> completion`: fire `pre-exit`, stop clients ignoring
    /// failures, fire `post-exit` one tick later so in-flight callbacks
    /// drain, then tear down.
    pub async fn exit(&self) {
        self.reactor.fire("pre-exit", &vec![]);
        let _ = self.stop_clients().await;
        tokio::task::yield_now().await;
        self.reactor.fire("post-exit", &vec![]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::transport::fake::FakeTransport;
    use tempfile::tempdir;

    fn build(dir: &tempfile::TempDir) -> Arc<BrokerServer> {
        let persist = Arc::new(Mutex::new(Persist::load(dir.path().join("broker.json"))));
        let store = Arc::new(Mutex::new(MessageStore::load(&persist.lock().unwrap())));
        let identity = Arc::new(Mutex::new(Identity::default()));
        let reactor = Arc::new(Reactor::new());
        let transport = Arc::new(FakeTransport::new());
        let exchange = Arc::new(MessageExchange::new(
            reactor.clone(),
            store.clone(),
            identity.clone(),
            persist.clone(),
            transport,
        ));
        let registration = RegistrationHandler::install(
            reactor.clone(),
            store.clone(),
            identity.clone(),
            persist.clone(),
            exchange.clone(),
        );
        BrokerServer::new(reactor, store, persist, exchange, registration, Config::default())
    }

    #[tokio::test]
    async fn ping_is_always_true() {
        let dir = tempdir().unwrap();
        let server = build(&dir);
        assert!(server.ping());
    }

    #[tokio::test]
    async fn basic_send_scenario() {
        let dir = tempdir().unwrap();
        let server = build(&dir);
        server.register_client_accepted_message_type("test-client", "test").await;
        let seq = server.send_message(Message::new("test"), false).unwrap();
        assert!(server.is_message_pending(seq));
        assert!(!server.exchange.is_urgent());
    }

    #[tokio::test]
    async fn urgent_send_scenario() {
        let dir = tempdir().unwrap();
        let server = build(&dir);
        server.send_message(Message::new("test"), true).unwrap();
        assert!(server.exchange.is_urgent());
    }

    #[tokio::test]
    async fn unhandled_operation_scenario() {
        let dir = tempdir().unwrap();
        let server = build(&dir);
        let results = server.fire_event("message", &[serde_json::json!({"type": "foobar", "operation-id": 4})]);
        assert!(
            results.iter().all(|r| r.as_bool() == Some(false)),
            "no client registered and the registration handler doesn't recognize this type, so nothing acknowledges it"
        );
    }

    #[tokio::test]
    async fn listen_events_resolves_with_first_firing_name() {
        let dir = tempdir().unwrap();
        let server = build(&dir);
        let rx = server.listen_events(vec!["a".to_string(), "b".to_string()]);
        server.fire_event("a", &[]);
        assert_eq!(rx.await.unwrap(), "a");
    }

    #[tokio::test]
    async fn register_client_rejects_unknown_connector() {
        let dir = tempdir().unwrap();
        let server = build(&dir);
        assert!(server.register_client("missing").await.is_err());
    }

    struct EchoClient {
        seen: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait::async_trait]
    impl crate::client::RemoteClient for EchoClient {
        async fn message(&self, message: &Value) -> bool {
            self.seen.lock().unwrap().push(message.clone());
            true
        }

        async fn fire_event(&self, _name: &str, _args: &[Value]) -> Value {
            Value::Null
        }

        async fn exit(&self) -> Result<()> {
            Ok(())
        }
    }

    struct EchoConnector {
        seen: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait::async_trait]
    impl crate::client::Connector for EchoConnector {
        async fn connect(&self) -> Result<Box<dyn crate::client::RemoteClient>> {
            Ok(Box::new(EchoClient { seen: self.seen.clone() }))
        }
    }

    #[tokio::test]
    async fn register_client_accepted_message_type_updates_client_record() {
        let dir = tempdir().unwrap();
        let server = build(&dir);
        let seen = Arc::new(Mutex::new(Vec::new()));
        server
            .clients
            .lock()
            .await
            .add_connector("echo", Box::new(EchoConnector { seen }));
        server.register_client("echo").await.unwrap();
        server.register_client_accepted_message_type("echo", "package-data").await;
        assert_eq!(server.get_client("echo").await, Some(vec!["package-data".to_string()]));
    }

    #[tokio::test]
    async fn inbound_messages_are_fanned_out_to_registered_clients() {
        let dir = tempdir().unwrap();
        let server = build(&dir);
        let seen = Arc::new(Mutex::new(Vec::new()));
        server
            .clients
            .lock()
            .await
            .add_connector("echo", Box::new(EchoConnector { seen: seen.clone() }));
        server.register_client("echo").await.unwrap();

        let results = server.exchange.handle_message(&Message::new("package-data")).await;
        assert!(results.contains(&serde_json::json!(true)));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn announce_started_fires_broker_started() {
        let dir = tempdir().unwrap();
        let server = build(&dir);
        let fired = Arc::new(Mutex::new(false));
        let fired_clone = fired.clone();
        server.reactor.call_on("broker-started", move |_| {
            *fired_clone.lock().unwrap() = true;
            Value::Null
        });
        server.announce_started();
        assert!(*fired.lock().unwrap());
    }
}
