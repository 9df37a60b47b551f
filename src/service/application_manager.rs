//! Client for `com.webos.applicationManager`.
//!
//! Keeps a server-status watch on the application manager at all times and
//! tracks whether it is connected. Launch and close calls remember what they
//! were for, so their replies can be reported per identifier.

use super::{keys, parse_object, server_status, Service, ServiceEvent};
use crate::bus::{hub_error, ClientIdentity, Token};
use crate::listener::{Listener, ListenerBus};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use tracing::warn;

pub const SERVICE_NAME: &str = "com.webos.applicationManager";

pub const METHOD_LAUNCH: &str = "/launch";
pub const METHOD_CLOSE: &str = "/close";
pub const METHOD_REMOVE_LAUNCH_POINT: &str = "/removeLaunchPoint";
pub const METHOD_MOVE_LAUNCH_POINT: &str = "/moveLaunchPoint";
pub const METHOD_LIST_LAUNCH_POINTS: &str = "/listLaunchPoints";
pub const METHOD_LIST_APPS: &str = "/listApps";
pub const METHOD_RUNNING: &str = "/running";
pub const METHOD_ON_LAUNCH: &str = "/onLaunch";
pub const METHOD_GET_APP_LIFE_STATUS: &str = "/getAppLifeStatus";

const SUBSCRIBE: &str = r#"{"subscribe":true}"#;

pub struct ApplicationManagerService {
    base: Service,
    connected: bool,
    token_server_status: Token,
    launch_calls: HashMap<Token, String>,
    close_calls: HashMap<Token, String>,
    application_list: String,
    launch_points_list: String,
    running_list: String,
}

impl ApplicationManagerService {
    pub fn new(identity: ClientIdentity) -> (Self, Receiver<ServiceEvent>) {
        let (base, rx) = Service::new(identity);
        let service = Self {
            base,
            connected: false,
            token_server_status: Token::INVALID,
            launch_calls: HashMap::new(),
            close_calls: HashMap::new(),
            application_list: String::new(),
            launch_points_list: String::new(),
            running_list: String::new(),
        };
        (service, rx)
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn server_status_token(&self) -> Token {
        self.token_server_status
    }

    pub fn set_app_id(&mut self, bus: &mut dyn ListenerBus, app_id: &str) {
        self.base.set_app_id(app_id);
        self.ensure_server_status(bus);
    }

    fn ensure_server_status(&mut self, bus: &mut dyn ListenerBus) {
        if !self.token_server_status.is_valid() {
            self.token_server_status = self.base.register_server_status(bus, SERVICE_NAME, false);
        }
    }

    /// Launch `identifier` with `params`, a JSON object with or without braces.
    pub fn launch(
        &mut self,
        bus: &mut dyn ListenerBus,
        identifier: &str,
        params: &str,
        check_update_on_launch: bool,
        auto_installation: bool,
    ) -> Token {
        let mut params = params.trim().to_string();
        if !params.starts_with('{') && !params.ends_with('}') {
            params = format!("{{{}}}", params);
        }
        let params: Value = match serde_json::from_str(&params) {
            Ok(params) => params,
            Err(e) => {
                warn!("Invalid launch params for {}: {}", identifier, e);
                return Token::INVALID;
            }
        };

        let payload = json!({
            "id": identifier,
            "params": params,
            "checkUpdateOnLaunch": check_update_on_launch,
            "autoInstallation": auto_installation,
        });
        let token = self.call(bus, METHOD_LAUNCH, &payload.to_string());
        if token.is_valid() {
            self.launch_calls.insert(token, identifier.to_string());
        }
        token
    }

    pub fn close(&mut self, bus: &mut dyn ListenerBus, process_id: &str) -> Token {
        let payload = json!({ "processId": process_id });
        let token = self.call(bus, METHOD_CLOSE, &payload.to_string());
        if token.is_valid() {
            self.close_calls.insert(token, process_id.to_string());
        }
        token
    }

    pub fn remove_launch_point(&mut self, bus: &mut dyn ListenerBus, launch_point_id: &str) -> Token {
        let payload = json!({ "launchPointId": launch_point_id });
        self.call(bus, METHOD_REMOVE_LAUNCH_POINT, &payload.to_string())
    }

    pub fn move_launch_point(&mut self, bus: &mut dyn ListenerBus, index: i64, to: i64) -> Token {
        let payload = json!({ "index": index, "to": to });
        self.call(bus, METHOD_MOVE_LAUNCH_POINT, &payload.to_string())
    }

    /// Last running list; also (re)subscribes to it.
    pub fn running_list(&mut self, bus: &mut dyn ListenerBus) -> &str {
        self.call(bus, METHOD_RUNNING, SUBSCRIBE);
        &self.running_list
    }

    pub fn application_list(&self) -> &str {
        &self.application_list
    }

    pub fn launch_points_list(&self) -> &str {
        &self.launch_points_list
    }

    pub fn subscribe_launched_app_id(&mut self, bus: &mut dyn ListenerBus) -> Token {
        self.subscribe(bus, METHOD_ON_LAUNCH)
    }

    pub fn subscribe_app_life_status(&mut self, bus: &mut dyn ListenerBus) -> Token {
        self.subscribe(bus, METHOD_GET_APP_LIFE_STATUS)
    }

    pub fn subscribe_application_list(&mut self, bus: &mut dyn ListenerBus) -> Token {
        self.subscribe(bus, METHOD_LIST_APPS)
    }

    pub fn subscribe_launch_points_list(&mut self, bus: &mut dyn ListenerBus) -> Token {
        self.subscribe(bus, METHOD_LIST_LAUNCH_POINTS)
    }

    fn subscribe(&mut self, bus: &mut dyn ListenerBus, method: &str) -> Token {
        let uri = self.service_uri();
        self.base.call_with_retry(bus, &uri, method, SUBSCRIBE)
    }

    fn call(&mut self, bus: &mut dyn ListenerBus, method: &str, payload: &str) -> Token {
        let uri = self.service_uri();
        self.base.call(bus, &uri, method, payload, None, None)
    }

    fn update_list(&mut self, method: &str, payload: &str) {
        let slot = match method {
            METHOD_LIST_APPS => &mut self.application_list,
            METHOD_LIST_LAUNCH_POINTS => &mut self.launch_points_list,
            _ => &mut self.running_list,
        };
        if *slot == payload {
            if method == METHOD_LIST_LAUNCH_POINTS {
                self.base.emit(ServiceEvent::SameLaunchPointsListPublished);
            }
            return;
        }
        *slot = payload.to_string();
        let event = match method {
            METHOD_LIST_APPS => ServiceEvent::ApplicationListChanged(payload.to_string()),
            METHOD_LIST_LAUNCH_POINTS => ServiceEvent::LaunchPointsListChanged(payload.to_string()),
            _ => ServiceEvent::RunningListChanged(payload.to_string()),
        };
        self.base.emit(event);
    }

    fn on_launch_reply(&mut self, object: &Map<String, Value>, token: Token) {
        let identifier = self.launch_calls.remove(&token).unwrap_or_default();
        if return_value(object) {
            self.base.emit(ServiceEvent::Launched { identifier, token });
        } else {
            let error_code = object
                .get(keys::ERROR_CODE)
                .and_then(Value::as_i64)
                .unwrap_or(0);
            self.base.emit(ServiceEvent::LaunchFailed {
                identifier,
                token,
                error_code,
            });
        }
    }

    fn on_close_reply(&mut self, object: &Map<String, Value>, token: Token) {
        let process_id = self.close_calls.remove(&token).unwrap_or_default();
        if return_value(object) {
            self.base.emit(ServiceEvent::Closed { process_id, token });
        }
    }

    fn on_app_launched(&self, object: &Map<String, Value>) {
        let app_id = string_field(object, "appId");
        if app_id.is_empty() {
            return;
        }
        self.base.emit(ServiceEvent::AppLaunched {
            app_id,
            title: string_field(object, "title"),
            no_splash: object
                .get("noSplash")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            splash_background: string_field(object, "splashBackground"),
        });
    }

    fn on_app_life_status(&self, object: &Map<String, Value>) {
        let app_id = string_field(object, "appId");
        if app_id.is_empty() {
            return;
        }
        let extra_info = object
            .get("extraInfo")
            .and_then(Value::as_object)
            .filter(|extra| !extra.is_empty())
            .map(|extra| Value::Object(extra.clone()).to_string());
        self.base.emit(ServiceEvent::AppLifeStatusChanged {
            app_id,
            status: string_field(object, "status"),
            process_id: string_field(object, "processId"),
            extra_info,
        });
    }
}

fn return_value(object: &Map<String, Value>) -> bool {
    object
        .get(keys::RETURN_VALUE)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn string_field(object: &Map<String, Value>, key: &str) -> String {
    object
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl Listener for ApplicationManagerService {
    fn service(&self) -> &Service {
        &self.base
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.base
    }

    fn interface_name(&self) -> &str {
        SERVICE_NAME
    }

    fn attached(&mut self, bus: &mut dyn ListenerBus) {
        if !self.base.app_id().is_empty() {
            self.ensure_server_status(bus);
        }
    }

    fn cancel(&mut self, bus: &mut dyn ListenerBus, token: Token) {
        self.base.cancel(bus, token);
        // A blanket cancel also dropped the status watch.
        if !token.is_valid() || token == self.token_server_status {
            self.token_server_status = self.base.register_server_status(bus, SERVICE_NAME, false);
        }
    }

    fn service_response(&mut self, _bus: &mut dyn ListenerBus, method: &str, payload: &str, token: Token) {
        self.base.check_for_errors(payload, token);
        self.base.emit(ServiceEvent::Response {
            method: method.to_string(),
            payload: payload.to_string(),
            token,
        });

        let object = parse_object(payload);
        if token == self.token_server_status {
            if let Some(connected) = server_status(&object, SERVICE_NAME) {
                if self.connected != connected {
                    self.connected = connected;
                    self.base.emit(ServiceEvent::ConnectedChanged(connected));
                }
                return;
            }
        }

        match method {
            METHOD_LIST_APPS | METHOD_LIST_LAUNCH_POINTS | METHOD_RUNNING => {
                self.update_list(method, payload)
            }
            METHOD_LAUNCH => self.on_launch_reply(&object, token),
            METHOD_CLOSE => self.on_close_reply(&object, token),
            METHOD_ON_LAUNCH => self.on_app_launched(&object),
            METHOD_GET_APP_LIFE_STATUS => self.on_app_life_status(&object),
            _ => warn!("ApplicationManagerService: unknown method {}", method),
        }
    }

    fn hub_error(
        &mut self,
        bus: &mut dyn ListenerBus,
        _method: &str,
        error: &str,
        payload: &str,
        token: Token,
    ) {
        self.base.check_for_errors(payload, token);
        if hub_error::is_service_down(error) {
            warn!("ApplicationManagerService: hub error {} - recover subscriptions", error);
            self.connected = false;
            self.base.emit(ServiceEvent::ConnectedChanged(false));
            Listener::cancel(self, bus, Token::INVALID);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::{drain, RecordingBus};
    use crate::service::{SERVER_STATUS_METHOD, SERVER_STATUS_SERVICE};

    fn attached() -> (ApplicationManagerService, Receiver<ServiceEvent>, RecordingBus) {
        let mut bus = RecordingBus::new();
        let (mut service, rx) =
            ApplicationManagerService::new(ClientIdentity::service("com.example.shell"));
        service.attached(&mut bus);
        drain(&rx);
        (service, rx, bus)
    }

    fn status_payload(connected: bool) -> String {
        json!({ "serviceName": SERVICE_NAME, "connected": connected }).to_string()
    }

    #[test]
    fn test_server_status_watch_on_attach() {
        let (service, _rx, bus) = attached();
        let call = bus.last_call();
        assert_eq!(call.service, SERVER_STATUS_SERVICE);
        assert_eq!(call.method, SERVER_STATUS_METHOD);
        assert!(call.payload.contains(SERVICE_NAME));
        assert_eq!(service.server_status_token(), call.token);
    }

    #[test]
    fn test_no_watch_without_app_id() {
        let mut bus = RecordingBus::new();
        let (mut service, _rx) = ApplicationManagerService::new(ClientIdentity::service(""));
        service.attached(&mut bus);
        assert!(bus.calls.is_empty());

        service.set_app_id(&mut bus, "com.example.shell");
        assert_eq!(bus.calls_to(SERVER_STATUS_METHOD).len(), 1);
        service.set_app_id(&mut bus, "com.example.shell");
        assert_eq!(bus.calls_to(SERVER_STATUS_METHOD).len(), 1);
    }

    #[test]
    fn test_connected_tracking() {
        let (mut service, rx, mut bus) = attached();
        let status = service.server_status_token();

        service.service_response(&mut bus, SERVER_STATUS_METHOD, &status_payload(true), status);
        service.service_response(&mut bus, SERVER_STATUS_METHOD, &status_payload(true), status);

        assert!(service.connected());
        let changes: Vec<_> = drain(&rx)
            .into_iter()
            .filter(|e| matches!(e, ServiceEvent::ConnectedChanged(_)))
            .collect();
        assert_eq!(changes, vec![ServiceEvent::ConnectedChanged(true)]);
    }

    #[test]
    fn test_cancel_of_status_token_rewatches() {
        let (mut service, _rx, mut bus) = attached();
        let original = bus.last_call().clone();

        Listener::cancel(&mut service, &mut bus, original.token);

        let rewatch = bus.last_call();
        assert_eq!(bus.cancels, vec![original.token]);
        assert_ne!(rewatch.token, original.token);
        assert_eq!(rewatch.service, original.service);
        assert_eq!(rewatch.method, original.method);
        assert_eq!(rewatch.payload, original.payload);
        assert_eq!(service.server_status_token(), rewatch.token);
    }

    #[test]
    fn test_blanket_cancel_rewatches() {
        let (mut service, _rx, mut bus) = attached();
        Listener::cancel(&mut service, &mut bus, Token::INVALID);
        assert_eq!(bus.cancel_all, 1);
        assert_eq!(bus.calls_to(SERVER_STATUS_METHOD).len(), 2);
    }

    #[test]
    fn test_cancel_of_other_token_keeps_watch() {
        let (mut service, _rx, mut bus) = attached();
        let token = service.close(&mut bus, "1001");
        Listener::cancel(&mut service, &mut bus, token);
        assert_eq!(bus.calls_to(SERVER_STATUS_METHOD).len(), 1);
    }

    #[test]
    fn test_launch_payload_and_reply() {
        let (mut service, rx, mut bus) = attached();
        let token = service.launch(&mut bus, "com.example.app", r#""page":"home""#, false, true);

        let payload: Value = serde_json::from_str(&bus.last_call().payload).unwrap();
        assert_eq!(bus.last_call().service, "luna://com.webos.applicationManager");
        assert_eq!(payload["id"], "com.example.app");
        assert_eq!(payload["params"]["page"], "home");
        assert_eq!(payload["checkUpdateOnLaunch"], false);
        assert_eq!(payload["autoInstallation"], true);

        service.service_response(&mut bus, METHOD_LAUNCH, r#"{"returnValue":true}"#, token);
        assert!(drain(&rx).contains(&ServiceEvent::Launched {
            identifier: "com.example.app".into(),
            token
        }));
    }

    #[test]
    fn test_launch_failure_reports_error_code() {
        let (mut service, rx, mut bus) = attached();
        let token = service.launch(&mut bus, "com.example.app", "{}", true, false);
        service.service_response(
            &mut bus,
            METHOD_LAUNCH,
            r#"{"returnValue":false,"errorCode":-101}"#,
            token,
        );
        assert!(drain(&rx).contains(&ServiceEvent::LaunchFailed {
            identifier: "com.example.app".into(),
            token,
            error_code: -101
        }));
    }

    #[test]
    fn test_invalid_launch_params() {
        let (mut service, _rx, mut bus) = attached();
        let calls = bus.calls.len();
        assert_eq!(
            service.launch(&mut bus, "com.example.app", "{broken", false, false),
            Token::INVALID
        );
        assert_eq!(bus.calls.len(), calls);
    }

    #[test]
    fn test_close_reports_process() {
        let (mut service, rx, mut bus) = attached();
        let token = service.close(&mut bus, "1001");
        service.service_response(&mut bus, METHOD_CLOSE, r#"{"returnValue":true}"#, token);
        assert!(drain(&rx).contains(&ServiceEvent::Closed {
            process_id: "1001".into(),
            token
        }));
    }

    #[test]
    fn test_list_changes_emitted_once() {
        let (mut service, rx, mut bus) = attached();
        let payload = r#"{"returnValue":true,"apps":[]}"#;
        service.service_response(&mut bus, METHOD_LIST_APPS, payload, Token(50));
        service.service_response(&mut bus, METHOD_LIST_APPS, payload, Token(50));
        service.service_response(&mut bus, METHOD_LIST_LAUNCH_POINTS, payload, Token(51));
        service.service_response(&mut bus, METHOD_LIST_LAUNCH_POINTS, payload, Token(51));

        let events = drain(&rx);
        let count = |wanted: fn(&ServiceEvent) -> bool| events.iter().filter(|e| wanted(e)).count();
        assert_eq!(count(|e| matches!(e, ServiceEvent::ApplicationListChanged(_))), 1);
        assert_eq!(count(|e| matches!(e, ServiceEvent::LaunchPointsListChanged(_))), 1);
        assert_eq!(count(|e| matches!(e, ServiceEvent::SameLaunchPointsListPublished)), 1);
        assert_eq!(service.application_list(), payload);
    }

    #[test]
    fn test_app_life_status_extra_info() {
        let (mut service, rx, mut bus) = attached();
        let payload = r#"{"appId":"com.a","status":"foreground","processId":"7","extraInfo":{"k":1}}"#;
        service.service_response(&mut bus, METHOD_GET_APP_LIFE_STATUS, payload, Token(60));

        assert!(drain(&rx).contains(&ServiceEvent::AppLifeStatusChanged {
            app_id: "com.a".into(),
            status: "foreground".into(),
            process_id: "7".into(),
            extra_info: Some(r#"{"k":1}"#.into()),
        }));
    }

    #[test]
    fn test_subscriptions_use_retry() {
        let (mut service, _rx, mut bus) = attached();
        bus.fail_calls = 2;
        let token = service.subscribe_launched_app_id(&mut bus);

        assert!(token.is_valid());
        assert_eq!(bus.yields, 2);
        assert_eq!(bus.last_call().method, METHOD_ON_LAUNCH);
        assert_eq!(bus.last_call().payload, SUBSCRIBE);
    }

    #[test]
    fn test_service_down_recovers() {
        let (mut service, rx, mut bus) = attached();
        let status = service.server_status_token();
        service.service_response(&mut bus, SERVER_STATUS_METHOD, &status_payload(true), status);

        service.hub_error(&mut bus, METHOD_LIST_APPS, hub_error::SERVICE_DOWN, "{}", Token(5));

        assert!(!service.connected());
        assert_eq!(bus.cancel_all, 1);
        assert_eq!(bus.calls_to(SERVER_STATUS_METHOD).len(), 2);
        assert!(drain(&rx).contains(&ServiceEvent::ConnectedChanged(false)));
    }
}
