//! Listener registry.
//!
//! Listeners live in a generational arena. A [`ListenerId`] is packed into the
//! [`CallContext`] handed to the bus with every call, so a reply that races a
//! listener's removal fails the generation check instead of reaching a dead
//! object. Each slot also carries the listener's live-call map, keyed by the
//! carrying connection and token since every connection numbers its own
//! tokens.

use crate::bus::{CallContext, ClientIdentity, RequestId, Token};
use crate::service::Service;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

/// Default attempt count for [`ListenerBus::call_with_retry`].
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;

/// Generation-checked handle to a listener slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId {
    index: u32,
    generation: u32,
}

impl ListenerId {
    pub fn context(self) -> CallContext {
        CallContext((u64::from(self.generation) << 32) | u64::from(self.index))
    }

    pub fn from_context(context: CallContext) -> Self {
        Self {
            index: context.0 as u32,
            generation: (context.0 >> 32) as u32,
        }
    }
}

/// One live call made by a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    /// Bus-relative method path, e.g. `/launch`.
    pub method: String,
    /// Standing subscription rather than a single reply.
    pub subscription: bool,
    /// App id of the connection that carried the call.
    pub identity: String,
}

/// Lets the dispatcher hand a listener back as its concrete type.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Receiver of routed bus events.
///
/// Every listener is built on a [`Service`] base; the provided methods give
/// the base behaviour and concrete services override what they need.
pub trait Listener: AsAny + Send {
    fn service(&self) -> &Service;

    fn service_mut(&mut self) -> &mut Service;

    /// Bus name of the remote service this listener talks to.
    fn interface_name(&self) -> &str {
        ""
    }

    fn service_uri(&self) -> String {
        format!("{}{}", crate::service::URI_SCHEME, self.interface_name())
    }

    /// Called once the listener has a slot, before any event reaches it.
    fn attached(&mut self, _bus: &mut dyn ListenerBus) {}

    /// A normal reply for one of our calls.
    fn service_response(
        &mut self,
        _bus: &mut dyn ListenerBus,
        method: &str,
        payload: &str,
        token: Token,
    ) {
        self.service_mut().default_response(method, payload, token);
    }

    /// A transport-level failure for one of our calls.
    fn hub_error(
        &mut self,
        _bus: &mut dyn ListenerBus,
        method: &str,
        error: &str,
        payload: &str,
        token: Token,
    ) {
        self.service_mut().default_hub_error(method, error, payload, token);
    }

    /// Cancel one call, or every call when `token` is invalid.
    fn cancel(&mut self, bus: &mut dyn ListenerBus, token: Token) {
        self.service_mut().cancel(bus, token);
    }

    /// Run a hosted method. `None` means the method is not served here.
    fn invoke(&mut self, _bus: &mut dyn ListenerBus, _method: &str, _params: &Value) -> Option<Value> {
        None
    }

    /// Push the result of a hosted method to every subscriber of `method`.
    ///
    /// `response_method` names the hosted method that builds the payload;
    /// it defaults to `method` itself.
    fn push_subscription(
        &mut self,
        bus: &mut dyn ListenerBus,
        method: &str,
        param: &str,
        response_method: Option<&str>,
    ) -> bool {
        let identity = self.service().identity().clone();
        if !self.service().methods().iter().any(|m| m == method) {
            warn!("No method {} for service {}", method, identity.app_id);
            return false;
        }

        let member = response_method.filter(|m| !m.is_empty()).unwrap_or(method);
        let arg = Value::Object(crate::service::parse_object(param));
        let Some(returned) = self.invoke(bus, member, &arg) else {
            warn!(
                "Failed to invoke response method {} for service {}",
                member, identity.app_id
            );
            return false;
        };

        let mut reply = match returned {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if reply.contains_key(crate::service::keys::ERROR_CODE) {
            warn!("Nothing to push for method {} for service {}", method, identity.app_id);
            return false;
        }
        reply.insert(crate::service::keys::RETURN_VALUE.into(), Value::Bool(true));
        bus.subscription_reply(&identity, method, &Value::Object(reply).to_string())
    }
}

impl dyn Listener {
    pub fn downcast_ref<T: Listener + 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }

    pub fn downcast_mut<T: Listener + 'static>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut()
    }
}

/// Bus operations available to a listener while one of its handlers runs.
///
/// Calls made through this are owned by the running listener; replies come
/// back to it. A scope without a listener places fire-and-forget calls.
pub trait ListenerBus {
    /// Place `service` + `method`; returns [`Token::INVALID`] on failure.
    fn call(
        &mut self,
        identity: &ClientIdentity,
        service: &str,
        method: &str,
        payload: &str,
        session: Option<&str>,
    ) -> Token;

    fn set_timeout(&mut self, identity: &ClientIdentity, token: Token, timeout: Duration) -> bool;

    /// Cancel one live call placed through `identity`. Unknown tokens are
    /// ignored.
    fn cancel(&mut self, identity: &ClientIdentity, token: Token);

    /// Cancel every live call of the running listener.
    fn cancel_all(&mut self);

    /// Give the host loop one pass.
    fn yield_now(&mut self);

    /// Host `methods` under `category` for the running listener.
    fn register_methods(&mut self, identity: &ClientIdentity, category: &str, methods: &[String])
        -> bool;

    /// Answer an inbound request received on connection `identity`.
    fn reply(&mut self, identity: &ClientIdentity, request: RequestId, payload: &str) -> bool;

    /// Keep an inbound request as a subscriber of `method`.
    fn subscription_add(&mut self, identity: &ClientIdentity, method: &str, request: RequestId)
        -> bool;

    fn subscription_reply(&mut self, identity: &ClientIdentity, method: &str, payload: &str) -> bool;

    fn subscribers_count(&mut self, identity: &ClientIdentity, method: &str) -> usize;

    /// Retry [`call`](Self::call) up to `attempts` times, yielding to the host
    /// loop between attempts.
    fn call_with_retry(
        &mut self,
        identity: &ClientIdentity,
        service: &str,
        method: &str,
        payload: &str,
        session: Option<&str>,
        attempts: u32,
    ) -> Token {
        let mut token = Token::INVALID;
        for attempt in 0..attempts {
            token = self.call(identity, service, method, payload, session);
            if token.is_valid() {
                return token;
            }
            warn!(
                "Call failed {}{} - retry in next loop pass ({})",
                service, method, attempt
            );
            if attempt + 1 < attempts {
                self.yield_now();
            }
        }
        warn!(
            "Call failed finally {}{} after {} attempts",
            service, method, attempts
        );
        token
    }
}

/// Live calls by (carrying app id, token).
type CallMap = BTreeMap<(String, Token), CallInfo>;

struct Entry {
    listener: Option<Box<dyn Listener>>,
    calls: CallMap,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Arena of listeners and their live calls.
#[derive(Default)]
pub struct ListenerRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, listener: Box<dyn Listener>) -> ListenerId {
        let entry = Entry {
            listener: Some(listener),
            calls: BTreeMap::new(),
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return ListenerId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        ListenerId {
            index,
            generation: 0,
        }
    }

    /// Free the slot. Returns the listener (if not checked out) and the calls
    /// that were still live.
    pub fn remove(
        &mut self,
        id: ListenerId,
    ) -> Option<(Option<Box<dyn Listener>>, Vec<(Token, CallInfo)>)> {
        let slot = self.slot_mut(id)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some((entry.listener, into_calls(entry.calls)))
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.entry(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live listener ids in slot order.
    pub fn ids(&self) -> Vec<ListenerId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.entry.is_some())
            .map(|(index, s)| ListenerId {
                index: index as u32,
                generation: s.generation,
            })
            .collect()
    }

    pub fn get(&self, id: ListenerId) -> Option<&(dyn Listener + 'static)> {
        self.entry(id)?.listener.as_deref()
    }

    pub fn get_mut(&mut self, id: ListenerId) -> Option<&mut (dyn Listener + 'static)> {
        self.entry_mut(id)?.listener.as_deref_mut()
    }

    /// Take the listener out of its slot while one of its handlers runs.
    pub fn checkout(&mut self, id: ListenerId) -> Option<Box<dyn Listener>> {
        self.entry_mut(id)?.listener.take()
    }

    /// Put a checked-out listener back. Returns it if the slot went away.
    pub fn checkin(&mut self, id: ListenerId, listener: Box<dyn Listener>) -> Option<Box<dyn Listener>> {
        match self.entry_mut(id) {
            Some(entry) => {
                entry.listener = Some(listener);
                None
            }
            None => Some(listener),
        }
    }

    pub fn is_checked_out(&self, id: ListenerId) -> bool {
        self.entry(id).is_some_and(|e| e.listener.is_none())
    }

    /// Record a call carried by the connection named in `info.identity`.
    pub fn add_call(&mut self, id: ListenerId, token: Token, info: CallInfo) -> bool {
        match self.entry_mut(id) {
            Some(entry) => {
                entry.calls.insert((info.identity.clone(), token), info);
                true
            }
            None => false,
        }
    }

    pub fn call(&self, id: ListenerId, identity: &str, token: Token) -> Option<&CallInfo> {
        self.entry(id)?.calls.get(&(identity.to_string(), token))
    }

    pub fn remove_call(&mut self, id: ListenerId, identity: &str, token: Token) -> Option<CallInfo> {
        self.entry_mut(id)?.calls.remove(&(identity.to_string(), token))
    }

    pub fn take_calls(&mut self, id: ListenerId) -> Vec<(Token, CallInfo)> {
        match self.entry_mut(id) {
            Some(entry) => into_calls(std::mem::take(&mut entry.calls)),
            None => Vec::new(),
        }
    }

    /// Live tokens, grouped by connection and in token order within each.
    pub fn live_tokens(&self, id: ListenerId) -> Vec<Token> {
        self.entry(id)
            .map(|e| e.calls.keys().map(|(_, token)| *token).collect())
            .unwrap_or_default()
    }

    /// Whether replies can currently reach this listener at all.
    pub fn is_routed(&self, id: ListenerId) -> bool {
        self.entry(id).is_some_and(|e| !e.calls.is_empty())
    }

    /// Every live call carried by connection `identity`.
    pub fn calls_on(&self, identity: &str) -> Vec<(ListenerId, Token, CallInfo)> {
        let mut found = Vec::new();
        for id in self.ids() {
            if let Some(entry) = self.entry(id) {
                for ((app_id, token), info) in &entry.calls {
                    if app_id == identity {
                        found.push((id, *token, info.clone()));
                    }
                }
            }
        }
        found
    }

    fn slot_mut(&mut self, id: ListenerId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
    }

    fn entry(&self, id: ListenerId) -> Option<&Entry> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)?
            .entry
            .as_ref()
    }

    fn entry_mut(&mut self, id: ListenerId) -> Option<&mut Entry> {
        self.slot_mut(id)?.entry.as_mut()
    }
}

fn into_calls(calls: CallMap) -> Vec<(Token, CallInfo)> {
    calls
        .into_iter()
        .map(|((_, token), info)| (token, info))
        .collect()
}
