//! Luna bus bindings: connections, call dispatch, cancellation, response
//! spreading and the service base concrete services build on.
//!
//! This module re-exports the main types for the CLI, integration tests
//! and fuzz targets.

pub mod bus;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod listener;
pub mod service;
pub mod spreader;

// Re-export commonly used types for convenience
pub use bus::{BusConnector, BusEvent, BusHandle, ClientIdentity, Token};
pub use config::Config;
pub use dispatcher::ServiceManager;
pub use listener::{Listener, ListenerBus, ListenerId};
pub use service::{Service, ServiceEvent};
