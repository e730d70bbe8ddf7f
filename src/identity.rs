//! Host identity: the tuple the server uses to recognize this broker.
//!
//! `secure_id` being present marks the host as registered; everything else
//! is supplied by configuration before the first registration attempt.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::persist::Persist;

/// `{computer-title, account-name, registration-password, secure-id, insecure-id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identity {
    /// Authenticated host identifier issued at successful registration.
    pub secure_id: Option<String>,
    /// Unauthenticated identifier issued alongside `secure_id`, used by the pinger.
    pub insecure_id: Option<String>,
    /// Human-readable name for this host, supplied by configuration.
    pub computer_title: Option<String>,
    /// Account this host registers under, supplied by configuration.
    pub account_name: Option<String>,
    /// Shared secret proving the right to register under `account_name`.
    pub registration_password: Option<String>,
}

impl Identity {
    /// Loads identity fields out of the shared `Persist` tree.
    pub fn load(persist: &Persist) -> Self {
        persist.get("identity").unwrap_or_default()
    }

    /// Writes this identity into the shared `Persist` tree and flushes it.
    pub fn save(&self, persist: &mut Persist) -> Result<()> {
        persist.set("identity", self)?;
        persist.save()
    }

    /// True once the server has issued a `secure_id` for this host.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.secure_id.is_some()
    }

    /// True once configuration has supplied enough to attempt registration.
    #[must_use]
    pub fn ready_to_register(&self) -> bool {
        self.computer_title.is_some() && self.account_name.is_some()
    }
}
