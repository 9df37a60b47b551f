//! Per-identity bus connections.
//!
//! One [`Connection`] exists per client identity (app id). Its native handle
//! is registered lazily on first use, attached to the host loop, and raised
//! to high dispatch priority. A failed registration leaves the handle empty;
//! the next use tries again.

use crate::bus::{
    BusConnector, BusHandle, ClientIdentity, ClientKind, EventSender, EventSource, Priority,
    RoleType,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A client identity's connection to the bus.
pub struct Connection {
    identity: ClientIdentity,
    connector: Arc<dyn BusConnector>,
    events: EventSender,
    handle: Option<Box<dyn BusHandle>>,
}

impl Connection {
    fn new(identity: ClientIdentity, connector: Arc<dyn BusConnector>, events: EventSender) -> Self {
        Self {
            identity,
            connector,
            events,
            handle: None,
        }
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn app_id(&self) -> &str {
        &self.identity.app_id
    }

    /// Whether a registered handle currently exists.
    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// Whether calls must be attributed to the app id instead of being
    /// placed under the connection's own registration.
    pub fn attributes_calls(&self) -> bool {
        self.identity.kind == ClientKind::Service
            && !self.identity.app_id.is_empty()
            && self.identity.role != RoleType::Regular
    }

    /// Registered handle, initialising the connection on first use.
    pub fn handle(&mut self) -> Option<&mut (dyn BusHandle + 'static)> {
        if self.handle.is_none() {
            self.init();
        }
        self.handle.as_deref_mut()
    }

    fn init(&mut self) -> bool {
        let app_id = self.identity.app_id.clone();

        let registered = match self.identity.kind {
            ClientKind::Application => {
                let name = format!("{}-{}", app_id, std::process::id());
                self.connector.register_application(&name, &app_id)
            }
            ClientKind::Service => self.connector.register(&app_id),
        };

        let mut handle = match registered {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to register {} on bus: {}", app_id, e);
                return false;
            }
        };

        let source = EventSource {
            identity: app_id.clone(),
            sender: self.events.clone(),
        };
        if let Err(e) = handle.attach(source) {
            warn!("Failed to attach {} to event loop: {}", app_id, e);
            discard(handle, &app_id);
            return false;
        }

        if let Err(e) = handle.set_priority(Priority::High) {
            warn!("Failed to raise bus priority for {}: {}", app_id, e);
            discard(handle, &app_id);
            return false;
        }

        info!(
            "Bus registration done for {} ({:?})",
            app_id, self.identity.kind
        );
        self.handle = Some(handle);
        true
    }

    /// Unregister the handle. No-op when already torn down.
    pub fn teardown(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.unregister() {
                warn!("Failed to unregister {} from bus: {}", self.identity.app_id, e);
            }
        }
    }

    /// Forget a handle whose transport died; the next use registers anew.
    pub(crate) fn reset(&mut self) {
        if self.handle.take().is_some() {
            debug!("Dropped dead bus handle for {}", self.identity.app_id);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn discard(mut handle: Box<dyn BusHandle>, app_id: &str) {
    if let Err(e) = handle.unregister() {
        debug!("Unregister after failed init of {}: {}", app_id, e);
    }
}

/// Process-wide table of connections, keyed by app id.
///
/// Owned by the process entry point and handed to the dispatcher.
pub struct ConnectionRegistry {
    connector: Arc<dyn BusConnector>,
    events: EventSender,
    connections: HashMap<String, Connection>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn BusConnector>, events: EventSender) -> Self {
        Self {
            connector,
            events,
            connections: HashMap::new(),
        }
    }

    /// Connection for `identity`, created on first request.
    ///
    /// The first caller for an app id fixes its kind and role; later callers
    /// share that connection.
    pub fn instance(&mut self, identity: &ClientIdentity) -> &mut Connection {
        if identity.app_id.is_empty() {
            warn!("Bus connection requested with an empty app id");
        }

        let connector = &self.connector;
        let events = &self.events;
        self.connections
            .entry(identity.app_id.clone())
            .or_insert_with(|| {
                info!(
                    "Bus connection created for {:?} ({:?})",
                    identity.app_id, identity.kind
                );
                Connection::new(identity.clone(), connector.clone(), events.clone())
            })
    }

    pub fn get(&mut self, app_id: &str) -> Option<&mut Connection> {
        self.connections.get_mut(app_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Tear down every connection in app id order.
    pub fn teardown_all(&mut self) {
        let mut app_ids: Vec<String> = self.connections.keys().cloned().collect();
        app_ids.sort();
        for app_id in app_ids {
            if let Some(connection) = self.connections.get_mut(&app_id) {
                connection.teardown();
            }
        }
    }
}
