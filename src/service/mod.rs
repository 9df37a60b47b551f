//! Service base.
//!
//! [`Service`] is the state every listener is built on: client identity,
//! session, hosted methods and the event channel observers read from. It
//! implements the uniform request/response contract:
//! - `check_for_errors` turns any payload into `Success` or `Error`
//! - `call`/`call_with_retry`/`cancel` apply the session rules
//! - `register_server_status` watches a remote service come and go
//! - [`handle_request`] enforces the JSON reply envelope for hosted methods

pub mod application_manager;
pub mod generic;
pub mod notification;
pub mod system;

#[cfg(test)]
pub(crate) mod testing;

pub use application_manager::ApplicationManagerService;
pub use generic::GenericService;
pub use notification::NotificationService;
pub use system::SystemService;

use crate::bus::{ClientIdentity, ClientKind, InboundRequest, RoleType, Token};
use crate::listener::{Listener, ListenerBus, DEFAULT_RETRY_ATTEMPTS};
use serde_json::{Map, Value};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const URI_SCHEME: &str = "luna://";
pub const URI_SCHEME_DEPRECATED: &str = "palm://";

/// Session value that disables the per-service session for one call.
pub const NO_SESSION: &str = "no-session";

pub const DEFAULT_CATEGORY: &str = "/";

pub const SERVER_STATUS_SERVICE: &str = "luna://com.webos.service.bus";
pub const SERVER_STATUS_METHOD: &str = "/signal/registerServerStatus";

/// Field names of the JSON envelope.
pub mod keys {
    pub const RETURN_VALUE: &str = "returnValue";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const SUBSCRIBED: &str = "subscribed";
    pub const WATCH: &str = "watch";
    pub const ERROR_CODE: &str = "errorCode";
    pub const ERROR_TEXT: &str = "errorText";
    pub const ERROR_MSG: &str = "errorMsg";
    pub const SERVICE_NAME: &str = "serviceName";
    pub const CONNECTED: &str = "connected";
    pub const SESSION_ID: &str = "sessionId";
}

pub const ERROR_CODE_JSON_PARSE: &str = "-1000";
pub const ERROR_TEXT_JSON_PARSE: &str = "Json parse error";
pub const ERROR_CODE_INVALID_TYPE: &str = "-1001";
pub const ERROR_TEXT_INVALID_TYPE: &str = "Invalid parameter type";
pub const ERROR_CODE_UNKNOWN_METHOD: &str = "-1002";
pub const ERROR_TEXT_UNKNOWN_METHOD: &str = "Unknown method";

/// Observable notifications emitted by services.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    /// Every reply, verbatim.
    Response {
        method: String,
        payload: String,
        token: Token,
    },
    Success(Token),
    Error {
        code: i64,
        text: String,
        token: Token,
    },
    CallSuccess(Map<String, Value>),
    CallFailure(Map<String, Value>),
    CallResponse(Map<String, Value>),
    Cancelled(Token),
    /// A remote caller dropped its subscription to one of our methods.
    SubscriptionAboutToCancel(String),
    AppIdChanged(String),
    SessionIdChanged(Option<String>),
    MethodsChanged(Vec<String>),
    CategoryChanged(String),

    ConnectedChanged(bool),
    ApplicationListChanged(String),
    LaunchPointsListChanged(String),
    SameLaunchPointsListPublished,
    RunningListChanged(String),
    Launched {
        identifier: String,
        token: Token,
    },
    LaunchFailed {
        identifier: String,
        token: Token,
        error_code: i64,
    },
    Closed {
        process_id: String,
        token: Token,
    },
    AppLaunched {
        app_id: String,
        title: String,
        no_splash: bool,
        splash_background: String,
    },
    AppLifeStatusChanged {
        app_id: String,
        status: String,
        process_id: String,
        extra_info: Option<String>,
    },

    ToastListChanged(String),
    AlertListChanged(String),
    InputAlertListChanged(String),
    PincodePromptListChanged(String),

    PreferenceChanged {
        key: String,
        value: Value,
    },
    SystemTimeChanged(i64),
}

/// Parse `payload` as a JSON object; anything else yields an empty object.
pub fn parse_object(payload: &str) -> Map<String, Value> {
    if payload.is_empty() {
        return Map::new();
    }
    match serde_json::from_str(payload) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Whether `payload` asks for a standing subscription.
pub fn is_subscription(payload: &str) -> bool {
    let object = parse_object(payload);
    [keys::SUBSCRIBE, keys::WATCH]
        .iter()
        .any(|key| object.get(*key).and_then(Value::as_bool) == Some(true))
}

/// Normalise a service name to `luna://name/`.
pub fn normalize_service_name(name: &str) -> String {
    let mut normalized = if name.starts_with(URI_SCHEME) || name.starts_with(URI_SCHEME_DEPRECATED)
    {
        name.to_string()
    } else {
        format!("{}{}", URI_SCHEME, name)
    };
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    normalized
}

fn error_code(value: &Value) -> i64 {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .unwrap_or(0)
}

/// Base state shared by every listener.
pub struct Service {
    identity: ClientIdentity,
    session_id: Option<String>,
    category: String,
    methods: Vec<String>,
    call_service_name: String,
    call_service_method: String,
    spread_events: bool,
    retry_attempts: u32,
    events: Sender<ServiceEvent>,
}

impl Service {
    pub fn new(identity: ClientIdentity) -> (Self, Receiver<ServiceEvent>) {
        let (events, rx) = mpsc::channel();
        let service = Self {
            identity,
            session_id: None,
            category: DEFAULT_CATEGORY.to_string(),
            methods: Vec::new(),
            call_service_name: String::new(),
            call_service_method: String::new(),
            spread_events: false,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            events,
        };
        (service, rx)
    }

    /// Identity from `APP_ID` / `ROLE_TYPE`.
    pub fn from_env() -> (Self, Receiver<ServiceEvent>) {
        Self::new(ClientIdentity::from_env())
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn app_id(&self) -> &str {
        &self.identity.app_id
    }

    /// Set the app id once. Returns true if it was set by this call.
    pub fn set_app_id(&mut self, app_id: &str) -> bool {
        if app_id.is_empty() {
            warn!("Attempt to set empty app id");
            return false;
        }
        if self.identity.app_id.is_empty() {
            self.identity.app_id = app_id.to_string();
            self.emit(ServiceEvent::AppIdChanged(app_id.to_string()));
            return true;
        }
        if self.identity.app_id != app_id {
            warn!(
                "Attempt to change app id from {} to {}",
                self.identity.app_id, app_id
            );
        }
        false
    }

    /// Set the role once; only `regular` and `privileged` are accepted.
    pub fn set_role_type(&mut self, role: &str) {
        if role.is_empty() {
            warn!("Attempt to set empty role type");
            return;
        }
        if self.identity.role == RoleType::Unset {
            if let Some(parsed) = RoleType::parse(role) {
                debug!("Set role type to {}", role);
                self.identity.role = parsed;
            }
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Returns true if the session changed.
    pub fn set_session_id(&mut self, session_id: Option<&str>) -> bool {
        let session_id = session_id.filter(|s| !s.is_empty()).map(str::to_string);
        if self.session_id == session_id {
            return false;
        }
        self.session_id = session_id.clone();
        self.emit(ServiceEvent::SessionIdChanged(session_id));
        true
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn set_category(&mut self, category: &str) {
        self.category = category.to_string();
        self.emit(ServiceEvent::CategoryChanged(category.to_string()));
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Host `methods` on the bus in addition to those already hosted.
    pub fn set_methods(&mut self, bus: &mut dyn ListenerBus, methods: &[String]) {
        self.methods.extend_from_slice(methods);
        self.register_methods(bus, methods);
        self.emit(ServiceEvent::MethodsChanged(self.methods.clone()));
    }

    #[deprecated(note = "use set_methods")]
    pub fn set_public_methods(&mut self, bus: &mut dyn ListenerBus, methods: &[String]) {
        warn!("The property publicMethods is deprecated. Use property methods.");
        self.set_methods(bus, methods);
    }

    #[deprecated(note = "use set_methods")]
    pub fn set_private_methods(&mut self, bus: &mut dyn ListenerBus, methods: &[String]) {
        warn!("The property privateMethods is deprecated. Use property methods.");
        self.set_methods(bus, methods);
    }

    fn register_methods(&self, bus: &mut dyn ListenerBus, methods: &[String]) {
        if self.identity.app_id.is_empty() {
            warn!(
                "App id is undefined, ignoring method registration: {}",
                methods.join(",")
            );
            return;
        }
        if self.identity.kind == ClientKind::Application {
            warn!("Application clients can't register methods");
            return;
        }
        if !bus.register_methods(&self.identity, &self.category, methods) {
            warn!("Failed to register methods {}", methods.join(","));
        }
    }

    pub fn call_service_name(&self) -> &str {
        &self.call_service_name
    }

    /// Accepts `com.service`, `luna://com.service` or `luna://com.service/category`.
    pub fn set_call_service_name(&mut self, name: &str) {
        self.call_service_name = normalize_service_name(name);
    }

    pub fn call_service_method(&self) -> &str {
        &self.call_service_method
    }

    pub fn set_call_service_method(&mut self, method: &str) {
        self.call_service_method = method.to_string();
    }

    pub fn spread_events(&self) -> bool {
        self.spread_events
    }

    /// Route normal replies through the response spreader.
    pub fn set_spread_events(&mut self, spread: bool) {
        self.spread_events = spread;
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn set_retry_attempts(&mut self, attempts: u32) {
        self.retry_attempts = attempts.max(1);
    }

    pub(crate) fn emit(&self, event: ServiceEvent) {
        // Nobody observing is fine.
        let _ = self.events.send(event);
    }

    /// Session a call actually uses: explicit, else ours; `no-session` clears it.
    pub fn effective_session(&self, session: Option<&str>) -> Option<String> {
        let session = session
            .filter(|s| !s.is_empty())
            .or(self.session_id.as_deref())?;
        if session == NO_SESSION {
            None
        } else {
            Some(session.to_string())
        }
    }

    pub fn call(
        &self,
        bus: &mut dyn ListenerBus,
        service: &str,
        method: &str,
        payload: &str,
        timeout: Option<Duration>,
        session: Option<&str>,
    ) -> Token {
        let session = self.effective_session(session);
        self.call_internal(bus, service, method, payload, timeout, session.as_deref())
    }

    fn call_internal(
        &self,
        bus: &mut dyn ListenerBus,
        service: &str,
        method: &str,
        payload: &str,
        timeout: Option<Duration>,
        session: Option<&str>,
    ) -> Token {
        let token = bus.call(&self.identity, service, method, payload, session);
        if let (true, Some(timeout)) = (token.is_valid(), timeout) {
            bus.set_timeout(&self.identity, token, timeout);
        }
        token
    }

    /// Call the configured `service`/`method` with `params` as payload.
    pub fn call_service(&self, bus: &mut dyn ListenerBus, params: &Map<String, Value>) -> Token {
        let payload = Value::Object(params.clone()).to_string();
        self.call(
            bus,
            &self.call_service_name,
            &self.call_service_method,
            &payload,
            None,
            None,
        )
    }

    pub fn call_with_retry(
        &self,
        bus: &mut dyn ListenerBus,
        service: &str,
        method: &str,
        payload: &str,
    ) -> Token {
        let session = self.effective_session(None);
        bus.call_with_retry(
            &self.identity,
            service,
            method,
            payload,
            session.as_deref(),
            self.retry_attempts,
        )
    }

    /// Cancel one call, or every call when `token` is invalid.
    pub fn cancel(&self, bus: &mut dyn ListenerBus, token: Token) {
        if token.is_valid() {
            bus.cancel(&self.identity, token);
        } else {
            bus.cancel_all();
        }
        self.emit(ServiceEvent::Cancelled(token));
    }

    /// Emit `Success` when the payload has no `errorCode`, else `Error`.
    pub fn check_for_errors(&self, payload: &str, token: Token) {
        self.check_object_for_errors(&parse_object(payload), token);
    }

    fn check_object_for_errors(&self, object: &Map<String, Value>, token: Token) {
        // By convention errorCode is absent on success rather than zero.
        let Some(code) = object.get(keys::ERROR_CODE) else {
            self.emit(ServiceEvent::Success(token));
            return;
        };
        let code = error_code(code);
        let text = object
            .get(keys::ERROR_TEXT)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        warn!("Error response for token {}: {} {}", token, code, text);
        self.emit(ServiceEvent::Error { code, text, token });
    }

    /// Reply handling for listeners that do not specialise it.
    pub fn default_response(&self, method: &str, payload: &str, token: Token) {
        let object = parse_object(payload);
        self.check_object_for_errors(&object, token);
        self.emit(ServiceEvent::Response {
            method: method.to_string(),
            payload: payload.to_string(),
            token,
        });

        if object.get(keys::RETURN_VALUE).and_then(Value::as_bool) == Some(true) {
            self.emit(ServiceEvent::CallSuccess(object.clone()));
        } else {
            self.emit(ServiceEvent::CallFailure(object.clone()));
        }
        self.emit(ServiceEvent::CallResponse(object));
    }

    pub fn default_hub_error(&self, method: &str, error: &str, payload: &str, token: Token) {
        warn!("Hub error detected for token {}: {} {}", token, method, error);
        self.check_for_errors(payload, token);
    }

    /// Watch `service_name` connect and disconnect.
    pub fn register_server_status(
        &self,
        bus: &mut dyn ListenerBus,
        service_name: &str,
        use_session: bool,
    ) -> Token {
        let mut params = Map::new();
        params.insert(keys::SERVICE_NAME.into(), Value::from(service_name));
        params.insert(keys::SUBSCRIBE.into(), Value::Bool(true));
        if let (true, Some(session)) = (use_session, self.session_id.as_deref()) {
            params.insert(keys::SESSION_ID.into(), Value::from(session));
        }

        let token = self.call_internal(
            bus,
            SERVER_STATUS_SERVICE,
            SERVER_STATUS_METHOD,
            &Value::Object(params).to_string(),
            None,
            None,
        );
        if token.is_valid() {
            info!(
                "registerServerStatus for {} (app id {:?}, token {}, session {:?}, use session {})",
                service_name, self.identity.app_id, token, self.session_id, use_session
            );
        } else {
            warn!(
                "registerServerStatus failed for {} (app id {:?}, session {:?}, use session {})",
                service_name, self.identity.app_id, self.session_id, use_session
            );
        }
        token
    }

    pub fn subscribers_count(&self, bus: &mut dyn ListenerBus, method: &str) -> usize {
        bus.subscribers_count(&self.identity, method)
    }
}

/// Whether a server-status payload reports `service_name` as connected.
///
/// `None` when the payload is about another service or has no status.
pub fn server_status(payload: &Map<String, Value>, service_name: &str) -> Option<bool> {
    if payload.get(keys::SERVICE_NAME).and_then(Value::as_str) != Some(service_name) {
        return None;
    }
    Some(
        payload
            .get(keys::CONNECTED)
            .and_then(Value::as_bool)
            .unwrap_or(false),
    )
}

pub(crate) fn error_reply(code: &str, text: &str) -> String {
    let mut reply = Map::new();
    reply.insert(keys::ERROR_CODE.into(), Value::from(code));
    reply.insert(keys::ERROR_TEXT.into(), Value::from(text));
    reply.insert(keys::RETURN_VALUE.into(), Value::Bool(false));
    Value::Object(reply).to_string()
}

/// Run an inbound request through `listener` and send the reply.
///
/// Malformed payloads are rejected before the listener sees them. A
/// successful reply to a subscription request also registers the caller as
/// a subscriber of the method.
pub fn handle_request(listener: &mut dyn Listener, bus: &mut dyn ListenerBus, request: &InboundRequest) {
    let identity = listener.service().identity().clone();

    let mut message = match serde_json::from_str::<Value>(&request.payload) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(e) => {
            debug!("Rejecting {} request: {}", request.method, e);
            let reply = error_reply(ERROR_CODE_JSON_PARSE, ERROR_TEXT_JSON_PARSE);
            bus.reply(&identity, request.id, &reply);
            return;
        }
    };

    if let Some(session) = request.session.as_deref().filter(|s| !s.is_empty()) {
        message.insert(keys::SESSION_ID.into(), Value::from(session));
    }

    let subscribe = match message.get(keys::SUBSCRIBE) {
        None => false,
        Some(Value::Bool(subscribe)) => *subscribe,
        Some(_) => {
            let reply = error_reply(ERROR_CODE_INVALID_TYPE, ERROR_TEXT_INVALID_TYPE);
            bus.reply(&identity, request.id, &reply);
            return;
        }
    };

    let Some(returned) = listener.invoke(bus, &request.method, &Value::Object(message)) else {
        warn!(
            "No handler for method {} on {}",
            request.method, identity.app_id
        );
        let reply = error_reply(ERROR_CODE_UNKNOWN_METHOD, ERROR_TEXT_UNKNOWN_METHOD);
        bus.reply(&identity, request.id, &reply);
        return;
    };
    let returned = match returned {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    let mut reply = Map::new();
    let success = !returned.contains_key(keys::ERROR_CODE);
    if success {
        reply.extend(returned);
        if subscribe {
            let subscribed = bus.subscription_add(&identity, &request.method, request.id);
            reply.insert(keys::SUBSCRIBED.into(), Value::Bool(subscribed));
        }
    } else {
        for key in [keys::ERROR_CODE, keys::ERROR_TEXT] {
            reply.insert(
                key.into(),
                returned.get(key).cloned().unwrap_or(Value::Null),
            );
        }
        if let Some(msg) = returned.get(keys::ERROR_MSG).filter(|v| !v.is_null()) {
            reply.insert(keys::ERROR_MSG.into(), msg.clone());
        }
    }
    reply.insert(keys::RETURN_VALUE.into(), Value::Bool(success));

    if !bus.reply(&identity, request.id, &Value::Object(reply).to_string()) {
        warn!("Failed to reply to {} on {}", request.method, identity.app_id);
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{drain, RecordingBus};
    use super::*;
    use crate::bus::RequestId;

    struct Echo {
        base: Service,
    }

    impl Listener for Echo {
        fn service(&self) -> &Service {
            &self.base
        }

        fn service_mut(&mut self) -> &mut Service {
            &mut self.base
        }

        fn invoke(&mut self, _bus: &mut dyn ListenerBus, method: &str, params: &Value) -> Option<Value> {
            match method {
                "echo" => Some(params.clone()),
                "fail" => Some(serde_json::json!({
                    "errorCode": 5,
                    "errorText": "nope",
                    "errorMsg": "legacy",
                    "extra": 1
                })),
                "status" => Some(serde_json::json!({"state": "on"})),
                _ => None,
            }
        }
    }

    fn echo(app_id: &str) -> (Echo, Receiver<ServiceEvent>) {
        let (base, rx) = Service::new(ClientIdentity::service(app_id));
        (Echo { base }, rx)
    }

    fn request(method: &str, payload: &str, session: Option<&str>) -> InboundRequest {
        InboundRequest {
            id: RequestId(11),
            category: DEFAULT_CATEGORY.to_string(),
            method: method.to_string(),
            payload: payload.to_string(),
            session: session.map(str::to_string),
        }
    }

    fn reply_of(bus: &RecordingBus) -> Value {
        let (_, payload) = bus.replies.last().expect("reply sent");
        serde_json::from_str(payload).unwrap()
    }

    #[test]
    fn test_subscription_detection() {
        assert!(is_subscription(r#"{"subscribe":true}"#));
        assert!(is_subscription(r#"{"watch":true,"x":1}"#));
        assert!(!is_subscription(r#"{"subscribe":false}"#));
        assert!(!is_subscription(r#"{"subscribe":"true"}"#));
        assert!(!is_subscription("not json"));
        assert!(!is_subscription(""));
    }

    #[test]
    fn test_normalize_service_name() {
        assert_eq!(normalize_service_name("com.svc"), "luna://com.svc/");
        assert_eq!(normalize_service_name("luna://com.svc"), "luna://com.svc/");
        assert_eq!(normalize_service_name("palm://com.svc/cat/"), "palm://com.svc/cat/");
    }

    #[test]
    fn test_check_for_errors() {
        let (service, rx) = Service::new(ClientIdentity::service("a"));
        service.check_for_errors(r#"{"returnValue":true}"#, Token(1));
        service.check_for_errors(
            r#"{"returnValue":false,"errorCode":-1,"errorText":"Message response timeout"}"#,
            Token(2),
        );
        service.check_for_errors("garbage", Token(3));

        assert_eq!(
            drain(&rx),
            vec![
                ServiceEvent::Success(Token(1)),
                ServiceEvent::Error {
                    code: -1,
                    text: "Message response timeout".into(),
                    token: Token(2)
                },
                ServiceEvent::Success(Token(3)),
            ]
        );
    }

    #[test]
    fn test_default_response_signals() {
        let (service, rx) = Service::new(ClientIdentity::service("a"));
        service.default_response("/m", r#"{"returnValue":false,"errorCode":3}"#, Token(4));

        let events = drain(&rx);
        assert!(matches!(events[0], ServiceEvent::Error { code: 3, .. }));
        assert!(matches!(events[1], ServiceEvent::Response { .. }));
        assert!(matches!(events[2], ServiceEvent::CallFailure(_)));
        assert!(matches!(events[3], ServiceEvent::CallResponse(_)));
    }

    #[test]
    fn test_app_id_is_set_once() {
        let (mut service, rx) = Service::new(ClientIdentity::service(""));
        assert!(!service.set_app_id(""));
        assert!(service.set_app_id("com.first"));
        assert!(!service.set_app_id("com.second"));
        assert_eq!(service.app_id(), "com.first");
        assert_eq!(drain(&rx), vec![ServiceEvent::AppIdChanged("com.first".into())]);
    }

    #[test]
    fn test_role_type_is_set_once() {
        let (mut service, _rx) = Service::new(ClientIdentity::service("a"));
        service.set_role_type("admin");
        assert_eq!(service.identity().role, RoleType::Unset);
        service.set_role_type("regular");
        service.set_role_type("privileged");
        assert_eq!(service.identity().role, RoleType::Regular);
    }

    #[test]
    fn test_session_resolution() {
        let mut bus = RecordingBus::new();
        let (mut service, _rx) = Service::new(ClientIdentity::service("a"));
        service.set_session_id(Some("s-base"));

        service.call(&mut bus, "luna://x", "/m", "{}", None, None);
        service.call(&mut bus, "luna://x", "/m", "{}", None, Some("s-explicit"));
        service.call(&mut bus, "luna://x", "/m", "{}", None, Some(NO_SESSION));

        let sessions: Vec<_> = bus.calls.iter().map(|c| c.session.clone()).collect();
        assert_eq!(
            sessions,
            vec![Some("s-base".into()), Some("s-explicit".into()), None]
        );
    }

    #[test]
    fn test_timeout_attached_to_valid_token_only() {
        let mut bus = RecordingBus::new();
        let (service, _rx) = Service::new(ClientIdentity::service("a"));

        let token = service.call(&mut bus, "luna://x", "/m", "{}", Some(Duration::from_millis(300)), None);
        bus.fail_calls = 1;
        service.call(&mut bus, "luna://x", "/m", "{}", Some(Duration::from_millis(300)), None);

        assert_eq!(bus.timeouts, vec![(token, Duration::from_millis(300))]);
    }

    #[test]
    fn test_call_service_uses_normalised_target() {
        let mut bus = RecordingBus::new();
        let (mut service, _rx) = Service::new(ClientIdentity::service("a"));
        service.set_call_service_name("com.webos.service.tv");
        service.set_call_service_method("getState");

        let mut params = Map::new();
        params.insert("id".into(), Value::from(3));
        service.call_service(&mut bus, &params);

        let call = bus.calls.last().unwrap();
        assert_eq!(call.service, "luna://com.webos.service.tv/");
        assert_eq!(call.method, "getState");
        assert_eq!(call.payload, r#"{"id":3}"#);
    }

    #[test]
    fn test_cancel_invalid_token_cancels_all() {
        let mut bus = RecordingBus::new();
        let (service, rx) = Service::new(ClientIdentity::service("a"));

        service.cancel(&mut bus, Token::INVALID);
        service.cancel(&mut bus, Token(9));

        assert_eq!(bus.cancel_all, 1);
        assert_eq!(bus.cancels, vec![Token(9)]);
        assert_eq!(
            drain(&rx),
            vec![
                ServiceEvent::Cancelled(Token::INVALID),
                ServiceEvent::Cancelled(Token(9))
            ]
        );
    }

    #[test]
    fn test_register_server_status_payload() {
        let mut bus = RecordingBus::new();
        let (mut service, _rx) = Service::new(ClientIdentity::service("a"));
        service.set_session_id(Some("s-1"));

        service.register_server_status(&mut bus, "com.webos.notification", true);
        service.register_server_status(&mut bus, "com.webos.notification", false);

        let first = &bus.calls[0];
        assert_eq!(first.service, SERVER_STATUS_SERVICE);
        assert_eq!(first.method, SERVER_STATUS_METHOD);
        assert_eq!(first.session, None);
        let payload: Value = serde_json::from_str(&first.payload).unwrap();
        assert_eq!(payload["serviceName"], "com.webos.notification");
        assert_eq!(payload["subscribe"], true);
        assert_eq!(payload["sessionId"], "s-1");

        let second: Value = serde_json::from_str(&bus.calls[1].payload).unwrap();
        assert!(second.get("sessionId").is_none());
    }

    #[test]
    fn test_methods_refused_for_application_clients() {
        let mut bus = RecordingBus::new();
        let (mut service, _rx) = Service::new(ClientIdentity::application("com.app"));
        service.set_methods(&mut bus, &["ping".to_string()]);

        assert!(bus.registered.is_empty());
        assert_eq!(service.methods(), ["ping".to_string()]);
    }

    #[test]
    fn test_request_parse_error_reply() {
        let mut bus = RecordingBus::new();
        let (mut listener, _rx) = echo("com.host");
        handle_request(&mut listener, &mut bus, &request("echo", "{oops", None));

        assert_eq!(
            bus.replies[0].1,
            r#"{"errorCode":"-1000","errorText":"Json parse error","returnValue":false}"#
        );
    }

    #[test]
    fn test_request_invalid_subscribe_type() {
        let mut bus = RecordingBus::new();
        let (mut listener, _rx) = echo("com.host");
        handle_request(&mut listener, &mut bus, &request("echo", r#"{"subscribe":1}"#, None));

        assert_eq!(
            bus.replies[0].1,
            r#"{"errorCode":"-1001","errorText":"Invalid parameter type","returnValue":false}"#
        );
    }

    #[test]
    fn test_request_success_merges_fields_and_session() {
        let mut bus = RecordingBus::new();
        let (mut listener, _rx) = echo("com.host");
        handle_request(&mut listener, &mut bus, &request("echo", r#"{"a":1}"#, Some("s-9")));

        let reply = reply_of(&bus);
        assert_eq!(reply["a"], 1);
        assert_eq!(reply["sessionId"], "s-9");
        assert_eq!(reply["returnValue"], true);
        assert!(reply.get("subscribed").is_none());
    }

    #[test]
    fn test_request_subscription_registers_subscriber() {
        let mut bus = RecordingBus::new();
        let (mut listener, _rx) = echo("com.host");
        handle_request(&mut listener, &mut bus, &request("echo", r#"{"subscribe":true}"#, None));

        assert_eq!(reply_of(&bus)["subscribed"], true);
        assert_eq!(bus.subscriptions["echo"], vec![RequestId(11)]);
    }

    #[test]
    fn test_request_failure_keeps_error_fields_only() {
        let mut bus = RecordingBus::new();
        let (mut listener, _rx) = echo("com.host");
        handle_request(&mut listener, &mut bus, &request("fail", r#"{"subscribe":true}"#, None));

        let reply = reply_of(&bus);
        assert_eq!(reply["errorCode"], 5);
        assert_eq!(reply["errorText"], "nope");
        assert_eq!(reply["errorMsg"], "legacy");
        assert_eq!(reply["returnValue"], false);
        assert!(reply.get("extra").is_none());
        assert!(bus.subscriptions.is_empty());
    }

    #[test]
    fn test_request_unknown_method() {
        let mut bus = RecordingBus::new();
        let (mut listener, _rx) = echo("com.host");
        handle_request(&mut listener, &mut bus, &request("missing", "{}", None));

        assert_eq!(reply_of(&bus)["errorCode"], ERROR_CODE_UNKNOWN_METHOD);
    }

    #[test]
    fn test_push_subscription() {
        let mut bus = RecordingBus::new();
        let (mut listener, _rx) = echo("com.host");
        listener.base.set_methods(&mut bus, &["watchState".to_string()]);

        assert!(!listener.push_subscription(&mut bus, "unknown", "", None));
        assert!(listener.push_subscription(&mut bus, "watchState", "", Some("status")));
        assert!(!listener.push_subscription(&mut bus, "watchState", "", Some("fail")));

        assert_eq!(bus.pushes.len(), 1);
        let (method, payload) = &bus.pushes[0];
        assert_eq!(method, "watchState");
        assert_eq!(payload, r#"{"returnValue":true,"state":"on"}"#);
    }
}
