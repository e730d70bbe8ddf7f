//! Landscape-style broker daemon: a single-threaded, cooperatively
//! scheduled broker that multiplexes local clients onto one periodic
//! authenticated exchange with a remote server.

pub mod broker_server;
pub mod client;
pub mod config;
pub mod env;
pub mod error;
pub mod exchange;
pub mod identity;
pub mod message;
pub mod message_store;
pub mod persist;
pub mod pinger;
pub mod reactor;
pub mod registration;
pub mod transport;

pub use broker_server::BrokerServer;
pub use config::Config;
pub use error::{BrokerError, Result};
