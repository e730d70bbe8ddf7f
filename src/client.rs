//! Polymorphic local clients.
//!
//! The `Box<dyn RemoteClient>` + `HashMap<String, _>` shape is grounded
//! directly on a `Box<dyn Client>` + `HashMap<ClientId, _>` registry
//! pattern, generalized from a closed `ClientId` enum (Tui/Browser) to an
//! open `String` name, since clients here are connectors looked up by a
//! configured name rather than a fixed set of UI surfaces.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Capability set exposed by anything the broker can register as a local
/// client: `{message(msg) -> bool, fire_event(name, args) -> Value, exit() -> Result<()>}`.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Delivers an inbound message; returns whether this client handled it.
    async fn message(&self, message: &Value) -> bool;

    /// Invokes a broadcast event remotely, returning the client's result.
    async fn fire_event(&self, name: &str, args: &[Value]) -> Value;

    /// Asks the client to shut down cleanly.
    async fn exit(&self) -> Result<()>;
}

/// Something that knows how to produce a connected `RemoteClient` for a
/// given registration request: the façade's `connectors_registry`.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects and returns a handle usable as a `RemoteClient`.
    async fn connect(&self) -> Result<Box<dyn RemoteClient>>;
}

/// In-memory record of a registered client.
pub struct ClientRegistration {
    /// The connector name this client was registered under.
    pub name: String,
    /// Message types this client has told the broker it accepts.
    pub accepted_types: BTreeSet<String>,
    /// The live remote handle.
    pub handle: Box<dyn RemoteClient>,
}

impl std::fmt::Debug for ClientRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistration")
            .field("name", &self.name)
            .field("accepted_types", &self.accepted_types)
            .finish_non_exhaustive()
    }
}

/// Registry of connected clients and the connectors that can produce them.
#[derive(Default)]
pub struct ClientRegistry {
    connectors: HashMap<String, Box<dyn Connector>>,
    clients: HashMap<String, ClientRegistration>,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("connector_count", &self.connectors.len())
            .field("client_count", &self.clients.len())
            .finish()
    }
}

impl ClientRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connector under `name`, available for later `register_client` calls.
    pub fn add_connector(&mut self, name: impl Into<String>, connector: Box<dyn Connector>) {
        self.connectors.insert(name.into(), connector);
    }

    /// Looks up `connectors_registry[name]`, connects, and records the result.
    pub async fn register_client(&mut self, name: &str) -> Result<()> {
        let connector = self
            .connectors
            .get(name)
            .ok_or_else(|| crate::error::BrokerError::NotFound(format!("unknown connector: {name}")))?;
        let handle = connector.connect().await?;
        self.clients.insert(
            name.to_string(),
            ClientRegistration {
                name: name.to_string(),
                accepted_types: BTreeSet::new(),
                handle,
            },
        );
        Ok(())
    }

    /// Registered client names.
    #[must_use]
    pub fn get_clients(&self) -> Vec<&str> {
        self.clients.keys().map(String::as_str).collect()
    }

    /// A single registered client by name.
    #[must_use]
    pub fn get_client(&self, name: &str) -> Option<&ClientRegistration> {
        self.clients.get(name)
    }

    /// Available connector names.
    #[must_use]
    pub fn get_connectors(&self) -> Vec<&str> {
        self.connectors.keys().map(String::as_str).collect()
    }

    /// True if a connector is registered under `name`.
    #[must_use]
    pub fn get_connector(&self, name: &str) -> bool {
        self.connectors.contains_key(name)
    }

    /// Calls `exit()` on every registered client, aggregating results.
    /// Errors are swallowed into the returned vector rather than propagated,
    /// since callers decide whether a failure is fatal (broker `exit()`
    /// swallows; `reload_configuration`/`stop_clients` surface them).
    pub async fn stop_clients(&self) -> Vec<(String, Result<()>)> {
        let mut results = Vec::new();
        for (name, registration) in &self.clients {
            results.push((name.clone(), registration.handle.exit().await));
        }
        results
    }

    /// Broadcasts `name(args)` to every registered client, aggregating
    /// their return values (outer = clients, inner = their single result).
    pub async fn broadcast(&self, name: &str, args: &[Value]) -> Vec<Value> {
        let mut results = Vec::with_capacity(self.clients.len());
        for registration in self.clients.values() {
            results.push(registration.handle.fire_event(name, args).await);
        }
        results
    }

    /// Delivers an inbound message to every registered client, aggregating
    /// whether each one handled it.
    pub async fn dispatch_message(&self, message: &Value) -> Vec<bool> {
        let mut results = Vec::with_capacity(self.clients.len());
        for registration in self.clients.values() {
            results.push(registration.handle.message(message).await);
        }
        results
    }

    /// Records that `name`'s client now accepts `message_type`.
    pub fn register_client_accepted_message_type(&mut self, name: &str, message_type: impl Into<String>) {
        if let Some(registration) = self.clients.get_mut(name) {
            registration.accepted_types.insert(message_type.into());
        }
    }

    /// True if no clients are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestClient {
        exit_ok: bool,
    }

    #[async_trait]
    impl RemoteClient for TestClient {
        async fn message(&self, _message: &Value) -> bool {
            true
        }

        async fn fire_event(&self, _name: &str, _args: &[Value]) -> Value {
            Value::Bool(true)
        }

        async fn exit(&self) -> Result<()> {
            if self.exit_ok {
                Ok(())
            } else {
                Err(crate::error::BrokerError::Transport("exit rejected".into()))
            }
        }
    }

    struct TestConnector {
        exit_ok: bool,
    }

    #[async_trait]
    impl Connector for TestConnector {
        async fn connect(&self) -> Result<Box<dyn RemoteClient>> {
            Ok(Box::new(TestClient { exit_ok: self.exit_ok }))
        }
    }

    #[tokio::test]
    async fn register_client_looks_up_connector_and_connects() {
        let mut registry = ClientRegistry::new();
        registry.add_connector("foo", Box::new(TestConnector { exit_ok: true }));
        registry.register_client("foo").await.unwrap();
        assert_eq!(registry.get_clients(), vec!["foo"]);
    }

    #[tokio::test]
    async fn register_client_fails_for_unknown_connector() {
        let mut registry = ClientRegistry::new();
        assert!(registry.register_client("missing").await.is_err());
    }

    #[tokio::test]
    async fn exit_with_failing_client_scenario() {
        let mut registry = ClientRegistry::new();
        registry.add_connector("foo", Box::new(TestConnector { exit_ok: false }));
        registry.add_connector("bar", Box::new(TestConnector { exit_ok: true }));
        registry.register_client("foo").await.unwrap();
        registry.register_client("bar").await.unwrap();

        let results = registry.stop_clients().await;
        assert_eq!(results.len(), 2);
        let foo_failed = results.iter().any(|(name, r)| name == "foo" && r.is_err());
        let bar_ok = results.iter().any(|(name, r)| name == "bar" && r.is_ok());
        assert!(foo_failed);
        assert!(bar_ok);
    }

    #[tokio::test]
    async fn broadcast_fans_out_and_aggregates() {
        let mut registry = ClientRegistry::new();
        registry.add_connector("foo", Box::new(TestConnector { exit_ok: true }));
        registry.register_client("foo").await.unwrap();
        let results = registry.broadcast("ping", &[]).await;
        assert_eq!(results, vec![Value::Bool(true)]);
    }

    #[tokio::test]
    async fn dispatch_message_fans_out_to_every_client() {
        let mut registry = ClientRegistry::new();
        registry.add_connector("foo", Box::new(TestConnector { exit_ok: true }));
        registry.register_client("foo").await.unwrap();
        let results = registry.dispatch_message(&Value::Null).await;
        assert_eq!(results, vec![true]);
    }

    #[test]
    fn register_client_accepted_message_type_updates_the_record() {
        let mut registry = ClientRegistry::new();
        registry.clients.insert(
            "foo".to_string(),
            ClientRegistration {
                name: "foo".to_string(),
                accepted_types: BTreeSet::new(),
                handle: Box::new(TestClient { exit_ok: true }),
            },
        );
        registry.register_client_accepted_message_type("foo", "package-data");
        assert_eq!(
            registry.get_client("foo").unwrap().accepted_types,
            BTreeSet::from(["package-data".to_string()])
        );
    }
}
