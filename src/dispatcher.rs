//! Call dispatcher and host event loop.
//!
//! [`ServiceManager`] owns the connection registry, the listener arena and
//! the response spreader, and drains the host loop channel every bus handle
//! forwards into. Listener handlers run with a [`Scope`], the
//! [`ListenerBus`] through which they place calls, cancel them and yield
//! back to the loop.
//!
//! While a listener's handler runs, the listener is checked out of its slot.
//! Events that arrive for it in the meantime (through a nested yield) are
//! deferred and delivered right after the handler returns.

use crate::bus::{
    hub_error, BusConnector, BusError, BusEvent, BusHandle, BusMessage, ClientIdentity,
    EventReceiver, EventSender, InboundRequest, MessageKind, RequestId, SpreadResponse, Token,
};
use crate::connection::ConnectionRegistry;
use crate::listener::{CallInfo, Listener, ListenerBus, ListenerId, ListenerRegistry};
use crate::service::{self, ServiceEvent};
use crate::spreader::ResponseSpreader;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Host loop: routes bus events to listeners.
pub struct ServiceManager {
    connections: ConnectionRegistry,
    listeners: ListenerRegistry,
    /// Hosted categories, by (app id, category).
    categories: HashMap<(String, String), ListenerId>,
    /// Hosted methods, by (app id, method).
    hosted: HashMap<(String, String), ListenerId>,
    spreader: ResponseSpreader,
    events: EventReceiver,
    sender: EventSender,
    deferred: VecDeque<(ListenerId, BusEvent)>,
    loop_iterations: u64,
}

impl ServiceManager {
    pub fn new(connector: Arc<dyn BusConnector>, spread_delay: Duration) -> Self {
        let (sender, events) = crate::bus::event_channel();
        Self {
            connections: ConnectionRegistry::new(connector, sender.clone()),
            listeners: ListenerRegistry::new(),
            categories: HashMap::new(),
            hosted: HashMap::new(),
            spreader: ResponseSpreader::new(sender.clone(), spread_delay),
            events,
            sender,
            deferred: VecDeque::new(),
            loop_iterations: 0,
        }
    }

    pub fn connections(&mut self) -> &mut ConnectionRegistry {
        &mut self.connections
    }

    /// Sender side of the host loop channel.
    pub fn event_sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Number of loop passes so far.
    pub fn loop_iterations(&self) -> u64 {
        self.loop_iterations
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Live tokens of `id`, grouped by connection.
    pub fn live_tokens(&self, id: ListenerId) -> Vec<Token> {
        self.listeners.live_tokens(id)
    }

    /// Spread replies queued or in flight for `id`.
    pub fn pending_spread(&self, id: ListenerId) -> usize {
        self.spreader.pending_for(id.context())
    }

    /// Give `listener` a slot and let it place its initial calls.
    pub fn attach(&mut self, listener: Box<dyn Listener>) -> ListenerId {
        let id = self.listeners.insert(listener);
        debug!("Listener attached: {:?}", id);
        self.run_handler(id, |listener, bus| listener.attached(bus));
        id
    }

    /// Remove `id`, cancelling every live call it still has.
    pub fn detach(&mut self, id: ListenerId) -> Option<Box<dyn Listener>> {
        let (listener, calls) = self.listeners.remove(id)?;
        for (token, info) in calls {
            self.native_cancel(&info.identity, token);
        }
        self.spreader.remove_listener(id.context());
        self.categories.retain(|_, owner| *owner != id);
        self.hosted.retain(|_, owner| *owner != id);
        self.deferred.retain(|(target, _)| *target != id);
        debug!("Listener detached: {:?}", id);
        listener
    }

    pub fn listener<T: Listener + 'static>(&self, id: ListenerId) -> Option<&T> {
        self.listeners.get(id)?.downcast_ref()
    }

    /// Run `f` on listener `id` as its concrete type.
    pub fn with_listener<T, R>(
        &mut self,
        id: ListenerId,
        f: impl FnOnce(&mut T, &mut dyn ListenerBus) -> R,
    ) -> Option<R>
    where
        T: Listener + 'static,
    {
        let mut result = None;
        self.run_handler(id, |listener, bus| {
            if let Some(listener) = listener.downcast_mut::<T>() {
                result = Some(f(listener, bus));
            }
        });
        result
    }

    /// A scope without a listener: calls placed here are fire-and-forget.
    pub fn scope(&mut self) -> Scope<'_> {
        Scope {
            manager: self,
            current: None,
        }
    }

    /// One loop pass: handle everything queued right now.
    pub fn process_events(&mut self) -> usize {
        self.loop_iterations += 1;
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.dispatch(event);
            handled += 1;
        }
        handled
    }

    /// Block up to `timeout` for the first event, then drain the rest.
    pub fn wait_events(&mut self, timeout: Duration) -> usize {
        match self.events.recv_timeout(timeout) {
            Ok(event) => {
                self.dispatch(event);
                1 + self.process_events()
            }
            Err(_) => {
                self.loop_iterations += 1;
                0
            }
        }
    }

    /// Detach every listener, stop the spreader and tear down connections.
    pub fn shutdown(&mut self) {
        for id in self.listeners.ids() {
            self.detach(id);
        }
        self.deferred.clear();
        self.spreader.shutdown();
        self.connections.teardown_all();
    }

    fn run_handler(
        &mut self,
        id: ListenerId,
        f: impl FnOnce(&mut (dyn Listener + 'static), &mut dyn ListenerBus),
    ) -> bool {
        let Some(mut listener) = self.listeners.checkout(id) else {
            return false;
        };
        {
            let mut scope = Scope {
                manager: self,
                current: Some(id),
            };
            f(listener.as_mut(), &mut scope);
        }
        if self.listeners.checkin(id, listener).is_some() {
            debug!("Listener {:?} detached itself while handling an event", id);
            return true;
        }
        self.flush_deferred(id);
        true
    }

    fn flush_deferred(&mut self, id: ListenerId) {
        while let Some(position) = self.deferred.iter().position(|(target, _)| *target == id) {
            let Some((_, event)) = self.deferred.remove(position) else {
                break;
            };
            self.deliver(id, event);
            if self.listeners.is_checked_out(id) {
                break;
            }
        }
    }

    fn dispatch(&mut self, event: BusEvent) {
        if let BusEvent::Disconnected { identity } = event {
            self.on_disconnected(&identity);
            return;
        }

        let Some(target) = self.target_of(&event) else {
            self.drop_unroutable(event);
            return;
        };

        let busy = self.listeners.is_checked_out(target)
            || self.deferred.iter().any(|(pending, _)| *pending == target);
        if busy {
            self.deferred.push_back((target, event));
        } else {
            self.deliver(target, event);
        }
    }

    fn target_of(&self, event: &BusEvent) -> Option<ListenerId> {
        match event {
            BusEvent::Reply { context, .. } => Some(ListenerId::from_context(*context)),
            BusEvent::Spread(response) => Some(ListenerId::from_context(response.listener)),
            BusEvent::Request { identity, request } => self
                .categories
                .get(&(identity.clone(), request.category.clone()))
                .copied(),
            BusEvent::SubscriptionCancelled { identity, method } => {
                self.hosted.get(&(identity.clone(), method.clone())).copied()
            }
            BusEvent::Disconnected { .. } => None,
        }
    }

    fn drop_unroutable(&mut self, event: BusEvent) {
        match event {
            BusEvent::Request { identity, request } => {
                warn!(
                    "No listener hosts {}{} on {}",
                    request.category, request.method, identity
                );
                self.reply_unknown(&identity, &request);
            }
            BusEvent::SubscriptionCancelled { identity, method } => {
                debug!("Subscription cancelled for unhosted method {} on {}", method, identity);
            }
            other => warn!("Dropping unroutable event: {:?}", other),
        }
    }

    fn reply_unknown(&mut self, identity: &str, request: &InboundRequest) {
        let reply =
            service::error_reply(service::ERROR_CODE_UNKNOWN_METHOD, service::ERROR_TEXT_UNKNOWN_METHOD);
        let Some(connection) = self.connections.get(identity) else {
            return;
        };
        if let Some(handle) = connection.handle() {
            if let Err(e) = handle.reply(request.id, &reply) {
                warn!("Failed to reply to {} on {}: {}", request.method, identity, e);
            }
        }
    }

    fn deliver(&mut self, target: ListenerId, event: BusEvent) {
        match event {
            BusEvent::Reply {
                identity, message, ..
            } => self.route_reply(target, &identity, message),
            BusEvent::Spread(response) => self.deliver_spread(target, response),
            BusEvent::Request { request, .. } => {
                self.run_handler(target, |listener, bus| {
                    service::handle_request(listener, bus, &request)
                });
            }
            BusEvent::SubscriptionCancelled { method, .. } => {
                if let Some(listener) = self.listeners.get(target) {
                    listener
                        .service()
                        .emit(ServiceEvent::SubscriptionAboutToCancel(method));
                }
            }
            BusEvent::Disconnected { identity } => self.on_disconnected(&identity),
        }
    }

    fn route_reply(&mut self, target: ListenerId, identity: &str, message: BusMessage) {
        let Some(info) = self.listeners.call(target, identity, message.token).cloned() else {
            warn!(
                "Dropping reply for token {} on {}: listener gone or call cancelled",
                message.token, identity
            );
            return;
        };

        // A hub error ends a single-reply call; subscriptions outlive all but
        // our own disconnect.
        let finished = match &message.kind {
            MessageKind::Reply => !info.subscription,
            MessageKind::Timeout => true,
            MessageKind::HubError(error) => {
                !info.subscription || error == hub_error::DISCONNECTED
            }
        };
        if finished {
            self.listeners.remove_call(target, identity, message.token);
        }

        let BusMessage {
            token,
            payload,
            kind,
        } = message;
        match kind {
            MessageKind::Reply | MessageKind::Timeout => {
                let spread = self
                    .listeners
                    .get(target)
                    .is_some_and(|listener| listener.service().spread_events());
                if spread {
                    self.spreader.enqueue(SpreadResponse {
                        listener: target.context(),
                        method: info.method,
                        payload,
                        token,
                    });
                } else {
                    self.run_handler(target, |listener, bus| {
                        listener.service_response(bus, &info.method, &payload, token)
                    });
                }
            }
            MessageKind::HubError(error) => {
                self.run_handler(target, |listener, bus| {
                    listener.hub_error(bus, &info.method, &error, &payload, token)
                });
            }
        }
    }

    fn deliver_spread(&mut self, target: ListenerId, response: SpreadResponse) {
        let SpreadResponse {
            listener: context,
            method,
            payload,
            token,
        } = response;
        let delivered = self.run_handler(target, |listener, bus| {
            listener.service_response(bus, &method, &payload, token)
        });
        if !delivered {
            debug!("Spread response for gone listener dropped: {}", method);
        }
        self.spreader.acknowledge(context);
    }

    fn on_disconnected(&mut self, identity: &str) {
        warn!("Bus connection for {} lost", identity);
        if let Some(connection) = self.connections.get(identity) {
            connection.reset();
        }

        let before = self.categories.len();
        self.categories.retain(|(app_id, _), _| app_id != identity);
        self.hosted.retain(|(app_id, _), _| app_id != identity);
        if self.categories.len() != before {
            warn!("Hosted methods on {} must be registered again", identity);
        }

        for (id, token, _) in self.listeners.calls_on(identity) {
            let message = BusMessage {
                token,
                payload: "{}".to_string(),
                kind: MessageKind::HubError(hub_error::DISCONNECTED.to_string()),
            };
            self.dispatch(BusEvent::Reply {
                identity: identity.to_string(),
                context: id.context(),
                message,
            });
        }
    }

    fn native_cancel(&mut self, identity: &str, token: Token) {
        let Some(connection) = self.connections.get(identity) else {
            return;
        };
        if !connection.is_connected() {
            return;
        }
        if let Some(handle) = connection.handle() {
            if let Err(e) = handle.cancel(token) {
                warn!("Failed to cancel token {} on {}: {}", token, identity, e);
            }
        }
    }
}

impl Drop for ServiceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bus access for one handler invocation.
pub struct Scope<'a> {
    manager: &'a mut ServiceManager,
    current: Option<ListenerId>,
}

impl Scope<'_> {
    /// Run `f` on the connection's handle, logging failures.
    fn with_handle<R>(
        &mut self,
        identity: &ClientIdentity,
        what: &str,
        f: impl FnOnce(&mut (dyn BusHandle + 'static)) -> Result<R, BusError>,
    ) -> Option<R> {
        let connection = self.manager.connections.instance(identity);
        let Some(handle) = connection.handle() else {
            warn!("Bus not ready for {:?}, {} skipped", identity.app_id, what);
            return None;
        };
        match f(handle) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!("{} failed on {:?}: {}", what, identity.app_id, e);
                None
            }
        }
    }
}

impl ListenerBus for Scope<'_> {
    fn call(
        &mut self,
        identity: &ClientIdentity,
        service: &str,
        method: &str,
        payload: &str,
        session: Option<&str>,
    ) -> Token {
        let subscription = service::is_subscription(payload);
        let uri = format!("{}{}", service, method);
        let context = self.current.map(ListenerId::context);

        let connection = self.manager.connections.instance(identity);
        let attributed = connection.attributes_calls();
        let app_id = connection.app_id().to_string();
        let Some(handle) = connection.handle() else {
            warn!(
                "Bus not ready for {:?}, call to {} {} failed",
                app_id, service, method
            );
            return Token::INVALID;
        };

        let result = match (subscription, attributed) {
            (true, false) => handle.call(&uri, payload, session, context),
            (false, false) => handle.call_one_reply(&uri, payload, session, context),
            (true, true) => handle.call_from_application(&uri, payload, session, &app_id, context),
            (false, true) => {
                handle.call_from_application_one_reply(&uri, payload, session, &app_id, context)
            }
        };

        let token = match result {
            Ok(token) if token.is_valid() => token,
            Ok(_) => {
                warn!("Call by {:?} to {} {} got no token", app_id, service, method);
                return Token::INVALID;
            }
            Err(e) => {
                warn!(
                    "Call by {:?} to {} {} failed: {}",
                    app_id, service, method, e
                );
                return Token::INVALID;
            }
        };

        if let Some(id) = self.current {
            self.manager.listeners.add_call(
                id,
                token,
                CallInfo {
                    method: method.to_string(),
                    subscription,
                    identity: app_id,
                },
            );
        }
        token
    }

    fn set_timeout(&mut self, identity: &ClientIdentity, token: Token, timeout: Duration) -> bool {
        self.with_handle(identity, "set_timeout", |handle| {
            handle.set_timeout(token, timeout)
        })
        .is_some()
    }

    fn cancel(&mut self, identity: &ClientIdentity, token: Token) {
        let Some(id) = self.current else {
            return;
        };
        match self.manager.listeners.remove_call(id, &identity.app_id, token) {
            Some(info) => self.manager.native_cancel(&info.identity, token),
            None => debug!("Cancel of token {} that is not live", token),
        }
    }

    fn cancel_all(&mut self) {
        let Some(id) = self.current else {
            return;
        };
        for (token, info) in self.manager.listeners.take_calls(id) {
            self.manager.native_cancel(&info.identity, token);
        }
    }

    fn yield_now(&mut self) {
        self.manager.process_events();
    }

    fn register_methods(
        &mut self,
        identity: &ClientIdentity,
        category: &str,
        methods: &[String],
    ) -> bool {
        let Some(id) = self.current else {
            warn!("Methods can only be hosted by a listener");
            return false;
        };
        let registered = self
            .with_handle(identity, "register_category", |handle| {
                handle.register_category(category, methods)
            })
            .is_some();
        if registered {
            let app_id = identity.app_id.clone();
            self.manager
                .categories
                .insert((app_id.clone(), category.to_string()), id);
            for method in methods {
                self.manager.hosted.insert((app_id.clone(), method.clone()), id);
            }
            info!("Hosting {} on {}{}", methods.join(","), app_id, category);
        }
        registered
    }

    fn reply(&mut self, identity: &ClientIdentity, request: RequestId, payload: &str) -> bool {
        self.with_handle(identity, "reply", |handle| handle.reply(request, payload))
            .is_some()
    }

    fn subscription_add(
        &mut self,
        identity: &ClientIdentity,
        method: &str,
        request: RequestId,
    ) -> bool {
        self.with_handle(identity, "subscription_add", |handle| {
            handle.subscription_add(method, request)
        })
        .is_some()
    }

    fn subscription_reply(&mut self, identity: &ClientIdentity, method: &str, payload: &str) -> bool {
        self.with_handle(identity, "subscription_reply", |handle| {
            handle.subscription_reply(method, payload)
        })
        .is_some()
    }

    fn subscribers_count(&mut self, identity: &ClientIdentity, method: &str) -> usize {
        self.with_handle(identity, "subscribers_count", |handle| {
            Ok(handle.subscribers_count(method))
        })
        .unwrap_or(0)
    }
}
