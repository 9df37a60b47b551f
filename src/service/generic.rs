//! A listener with no specialised behaviour.

use super::{Service, ServiceEvent};
use crate::bus::ClientIdentity;
use crate::listener::Listener;
use std::sync::mpsc::Receiver;

/// Calls any service and reports replies through the default handlers.
pub struct GenericService {
    base: Service,
    interface: String,
}

impl GenericService {
    pub fn new(identity: ClientIdentity) -> (Self, Receiver<ServiceEvent>) {
        let (base, rx) = Service::new(identity);
        let service = Self {
            base,
            interface: String::new(),
        };
        (service, rx)
    }

    /// Service this listener addresses through [`Listener::service_uri`].
    pub fn with_interface(mut self, name: &str) -> Self {
        self.interface = name.to_string();
        self
    }
}

impl Listener for GenericService {
    fn service(&self) -> &Service {
        &self.base
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.base
    }

    fn interface_name(&self) -> &str {
        &self.interface
    }
}
