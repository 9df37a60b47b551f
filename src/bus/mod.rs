//! Native bus abstraction.
//!
//! Everything above this module talks to the bus through two traits:
//! - [`BusConnector`] registers a client identity and hands back a handle
//! - [`BusHandle`] is the registered handle: calls, cancels, inbound replies
//!
//! Replies and inbound requests never come back through return values. The
//! handle forwards them as [`BusEvent`]s onto the host loop channel it was
//! attached to, and the dispatcher drains that channel on the loop thread.

pub mod unix_socket;
pub mod wire;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{mpsc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

pub use unix_socket::{UnixBusConnector, UnixBusHandle};

/// Hub error names delivered through the hub-error path.
pub mod hub_error {
    /// The target service went away while a call or subscription was live.
    pub const SERVICE_DOWN: &str = "hub.error.service_down";
    /// Our own connection to the hub dropped.
    pub const DISCONNECTED: &str = "hub.error.disconnected";
    /// The target service is not known to the hub.
    pub const UNKNOWN_SERVICE: &str = "hub.error.unknown_service";

    /// True for errors after which subscriptions must be re-established.
    pub fn is_service_down(error: &str) -> bool {
        error == SERVICE_DOWN || error == DISCONNECTED
    }
}

/// Payload delivered when a call's timeout expires.
pub const TIMEOUT_PAYLOAD: &str =
    r#"{"returnValue":false,"errorCode":-1,"errorText":"Message response timeout"}"#;

/// Correlation handle returned by a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(pub u64);

impl Token {
    /// Sentinel returned by every failed call.
    pub const INVALID: Token = Token(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a client registers on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientKind {
    /// Registers under its own service name.
    #[default]
    Service,
    /// Registers as `<appId>-<pid>` on behalf of an application.
    Application,
}

/// Security role of a service client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoleType {
    #[default]
    Unset,
    Regular,
    Privileged,
}

impl RoleType {
    /// Parse a role string; only `regular` and `privileged` are recognised.
    pub fn parse(role: &str) -> Option<Self> {
        match role {
            "regular" => Some(Self::Regular),
            "privileged" => Some(Self::Privileged),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::Regular => "regular",
            Self::Privileged => "privileged",
        }
    }
}

/// Dispatch priority of a handle's event source on the host loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Default,
    High,
}

/// Who is calling: one connection exists per distinct `app_id`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientIdentity {
    pub app_id: String,
    pub kind: ClientKind,
    pub role: RoleType,
}

impl ClientIdentity {
    pub fn service(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            kind: ClientKind::Service,
            role: RoleType::Unset,
        }
    }

    pub fn application(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            kind: ClientKind::Application,
            role: RoleType::Unset,
        }
    }

    pub fn with_role(mut self, role: RoleType) -> Self {
        self.role = role;
        self
    }

    /// Identity taken from `APP_ID` and `ROLE_TYPE`.
    ///
    /// A present `APP_ID` makes this an application client.
    pub fn from_env() -> Self {
        let role = std::env::var("ROLE_TYPE")
            .ok()
            .and_then(|r| RoleType::parse(&r))
            .unwrap_or_default();
        match std::env::var("APP_ID") {
            Ok(app_id) if !app_id.is_empty() => Self::application(app_id).with_role(role),
            _ => Self::service(String::new()).with_role(role),
        }
    }
}

/// Opaque per-call context handed to the bus and returned with every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallContext(pub u64);

/// Identifier of an inbound request, used to reply to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

/// How a reply arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Normal payload from the called service.
    Reply,
    /// Transport-level failure, with the hub error name.
    HubError(String),
    /// The call's timeout expired; the call is already cancelled.
    Timeout,
}

/// A reply to an outbound call.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub token: Token,
    pub payload: String,
    pub kind: MessageKind,
}

/// A request addressed to one of our registered methods.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub id: RequestId,
    pub category: String,
    pub method: String,
    pub payload: String,
    pub session: Option<String>,
}

/// A response the spreader hands back to the loop for delivery.
#[derive(Debug, Clone)]
pub struct SpreadResponse {
    pub listener: CallContext,
    pub method: String,
    pub payload: String,
    pub token: Token,
}

/// Everything the host loop consumes.
#[derive(Debug)]
pub enum BusEvent {
    /// `identity` names the connection that issued `message.token`.
    Reply {
        identity: String,
        context: CallContext,
        message: BusMessage,
    },
    Request {
        identity: String,
        request: InboundRequest,
    },
    SubscriptionCancelled {
        identity: String,
        method: String,
    },
    Disconnected {
        identity: String,
    },
    Spread(SpreadResponse),
}

/// Sending side of the host loop channel.
pub type EventSender = mpsc::Sender<BusEvent>;

/// Receiving side of the host loop channel.
pub type EventReceiver = mpsc::Receiver<BusEvent>;

/// Create the host loop channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel()
}

/// Lock a mutex shared with a bus thread, recovering from poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where a handle forwards its events once attached.
#[derive(Debug, Clone)]
pub struct EventSource {
    /// Identity of the owning connection, stamped on inbound events.
    pub identity: String,
    pub sender: EventSender,
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Registration failed: {0}")]
    Register(String),

    #[error("Attach to event loop failed: {0}")]
    Attach(String),

    #[error("Setting priority failed: {0}")]
    Priority(String),

    #[error("Call failed: {0}")]
    Call(String),

    #[error("Cancel failed: {0}")]
    Cancel(String),

    #[error("Setting timeout failed: {0}")]
    Timeout(String),

    #[error("Handle is not attached")]
    NotAttached,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A registered connection to the bus.
///
/// The four `call*` entry points mirror the native API: subscription vs single
/// reply, and own identity vs attributed to an application id.
pub trait BusHandle: Send {
    /// Start forwarding replies and inbound requests to the host loop.
    fn attach(&mut self, source: EventSource) -> Result<(), BusError>;

    fn set_priority(&mut self, priority: Priority) -> Result<(), BusError>;

    /// Standing call under our own identity; any number of replies.
    fn call(
        &mut self,
        uri: &str,
        payload: &str,
        session: Option<&str>,
        context: Option<CallContext>,
    ) -> Result<Token, BusError>;

    /// Single-reply call under our own identity.
    fn call_one_reply(
        &mut self,
        uri: &str,
        payload: &str,
        session: Option<&str>,
        context: Option<CallContext>,
    ) -> Result<Token, BusError>;

    /// Standing call attributed to `app_id`.
    fn call_from_application(
        &mut self,
        uri: &str,
        payload: &str,
        session: Option<&str>,
        app_id: &str,
        context: Option<CallContext>,
    ) -> Result<Token, BusError>;

    /// Single-reply call attributed to `app_id`.
    fn call_from_application_one_reply(
        &mut self,
        uri: &str,
        payload: &str,
        session: Option<&str>,
        app_id: &str,
        context: Option<CallContext>,
    ) -> Result<Token, BusError>;

    fn cancel(&mut self, token: Token) -> Result<(), BusError>;

    /// Cancel `token` automatically after `timeout` unless it was answered.
    fn set_timeout(&mut self, token: Token, timeout: Duration) -> Result<(), BusError>;

    /// Host `methods` under `category`.
    fn register_category(&mut self, category: &str, methods: &[String]) -> Result<(), BusError>;

    /// Answer an inbound request.
    fn reply(&mut self, request: RequestId, payload: &str) -> Result<(), BusError>;

    /// Keep `request` as a subscriber under `key` for later pushes.
    fn subscription_add(&mut self, key: &str, request: RequestId) -> Result<(), BusError>;

    /// Push `payload` to every subscriber under `key`.
    fn subscription_reply(&mut self, key: &str, payload: &str) -> Result<(), BusError>;

    fn subscribers_count(&self, key: &str) -> usize;

    fn unregister(&mut self) -> Result<(), BusError>;
}

/// Creates registered handles.
pub trait BusConnector: Send + Sync {
    /// Register a plain service client under `name`.
    fn register(&self, name: &str) -> Result<Box<dyn BusHandle>, BusError>;

    /// Register an application client under `name` on behalf of `app_id`.
    fn register_application(&self, name: &str, app_id: &str)
        -> Result<Box<dyn BusHandle>, BusError>;
}

#[cfg(test)]
pub(crate) mod mock;
