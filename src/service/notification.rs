//! Client for `com.webos.notification`.
//!
//! Notification feeds are subscribed lazily, the first time each list is
//! asked for, and (re)issued whenever the notification service reports
//! connected. A session change drops everything and starts over.

use super::{keys, parse_object, server_status, Service, ServiceEvent};
use crate::bus::{hub_error, ClientIdentity, Token};
use crate::listener::{Listener, ListenerBus};
use serde_json::Value;
use std::sync::mpsc::Receiver;
use tracing::{debug, warn};

pub const SERVICE_NAME: &str = "com.webos.notification";

const SUBSCRIBE: &str = r#"{"subscribe":true}"#;

/// The notification feeds this client can follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Toast,
    Alert,
    InputAlert,
    PincodePrompt,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 4] = [
        NotificationKind::Toast,
        NotificationKind::Alert,
        NotificationKind::InputAlert,
        NotificationKind::PincodePrompt,
    ];

    pub fn method(self) -> &'static str {
        match self {
            Self::Toast => "/getToastNotification",
            Self::Alert => "/getAlertNotification",
            Self::InputAlert => "/getInputAlertNotification",
            Self::PincodePrompt => "/getPincodePromptNotification",
        }
    }

    fn changed(self, payload: String) -> ServiceEvent {
        match self {
            Self::Toast => ServiceEvent::ToastListChanged(payload),
            Self::Alert => ServiceEvent::AlertListChanged(payload),
            Self::InputAlert => ServiceEvent::InputAlertListChanged(payload),
            Self::PincodePrompt => ServiceEvent::PincodePromptListChanged(payload),
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Default)]
struct Feed {
    requested: bool,
    token: Token,
    list: String,
}

pub struct NotificationService {
    base: Service,
    token_server_status: Token,
    feeds: [Feed; 4],
}

impl NotificationService {
    pub fn new(identity: ClientIdentity) -> (Self, Receiver<ServiceEvent>) {
        let (base, rx) = Service::new(identity);
        let service = Self {
            base,
            token_server_status: Token::INVALID,
            feeds: Default::default(),
        };
        (service, rx)
    }

    pub fn server_status_token(&self) -> Token {
        self.token_server_status
    }

    pub fn feed_token(&self, kind: NotificationKind) -> Token {
        self.feeds[kind.index()].token
    }

    pub fn set_app_id(&mut self, bus: &mut dyn ListenerBus, app_id: &str) {
        self.base.set_app_id(app_id);
        if !self.token_server_status.is_valid() {
            self.token_server_status = self.base.register_server_status(bus, SERVICE_NAME, true);
        }
    }

    /// Switch session; every subscription is re-established under it.
    pub fn set_session_id(&mut self, bus: &mut dyn ListenerBus, session_id: Option<&str>) {
        if self.base.set_session_id(session_id) {
            self.reset_subscription(bus);
        }
    }

    /// Current list for `kind`, subscribing on first request.
    pub fn list(&mut self, bus: &mut dyn ListenerBus, kind: NotificationKind) -> &str {
        if !self.feeds[kind.index()].requested {
            self.feeds[kind.index()].requested = true;
            self.init_subscription_calls(bus);
        }
        &self.feeds[kind.index()].list
    }

    pub fn toast_list(&mut self, bus: &mut dyn ListenerBus) -> &str {
        self.list(bus, NotificationKind::Toast)
    }

    pub fn alert_list(&mut self, bus: &mut dyn ListenerBus) -> &str {
        self.list(bus, NotificationKind::Alert)
    }

    pub fn input_alert_list(&mut self, bus: &mut dyn ListenerBus) -> &str {
        self.list(bus, NotificationKind::InputAlert)
    }

    pub fn pincode_prompt_list(&mut self, bus: &mut dyn ListenerBus) -> &str {
        self.list(bus, NotificationKind::PincodePrompt)
    }

    fn init_subscription_calls(&mut self, bus: &mut dyn ListenerBus) {
        let uri = self.service_uri();
        for kind in NotificationKind::ALL {
            if !self.feeds[kind.index()].requested {
                continue;
            }
            let previous = self.feeds[kind.index()].token;
            if previous.is_valid() {
                Listener::cancel(self, bus, previous);
            }
            self.feeds[kind.index()].token =
                self.base.call_with_retry(bus, &uri, kind.method(), SUBSCRIBE);
        }
    }

    fn reset_subscription(&mut self, bus: &mut dyn ListenerBus) {
        debug!("NotificationService: resetting subscriptions");
        Listener::cancel(self, bus, Token::INVALID);
    }
}

impl Listener for NotificationService {
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
        if !self.base.app_id().is_empty() && !self.token_server_status.is_valid() {
            self.token_server_status = self.base.register_server_status(bus, SERVICE_NAME, true);
        }
    }

    fn cancel(&mut self, bus: &mut dyn ListenerBus, token: Token) {
        self.base.cancel(bus, token);
        if !token.is_valid() {
            for feed in &mut self.feeds {
                feed.token = Token::INVALID;
            }
        }
        if !token.is_valid() || token == self.token_server_status {
            self.token_server_status = self.base.register_server_status(bus, SERVICE_NAME, true);
        }
    }

    fn service_response(&mut self, bus: &mut dyn ListenerBus, method: &str, payload: &str, token: Token) {
        self.base.check_for_errors(payload, token);
        self.base.emit(ServiceEvent::Response {
            method: method.to_string(),
            payload: payload.to_string(),
            token,
        });
        debug!("Notification response {} {} {}", method, payload, token);

        let object = parse_object(payload);
        if token == self.token_server_status && server_status(&object, SERVICE_NAME) == Some(true) {
            self.init_subscription_calls(bus);
            return;
        }

        let subscribed = object
            .get(keys::SUBSCRIBED)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let returned = object
            .get(keys::RETURN_VALUE)
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || object
                .get("message")
                .and_then(Value::as_str)
                .is_some_and(|m| !m.is_empty());
        if subscribed || !returned {
            // Subscription confirmation, or an error already reported.
            return;
        }

        let matched = NotificationKind::ALL.into_iter().find(|kind| {
            self.feeds[kind.index()].token == token && kind.method() == method
        });
        let Some(kind) = matched else {
            warn!("NotificationService: unknown method {}", method);
            return;
        };

        let feed = &mut self.feeds[kind.index()];
        if feed.list == payload {
            return;
        }
        feed.list = payload.to_string();
        self.base.emit(kind.changed(payload.to_string()));
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
            warn!("NotificationService: hub error {} - recover subscriptions", error);
            self.reset_subscription(bus);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::{drain, RecordingBus};
    use crate::service::SERVER_STATUS_METHOD;
    use serde_json::json;

    fn attached() -> (NotificationService, Receiver<ServiceEvent>, RecordingBus) {
        let mut bus = RecordingBus::new();
        let (mut service, rx) = NotificationService::new(ClientIdentity::service("com.example.shell"));
        service.attached(&mut bus);
        drain(&rx);
        (service, rx, bus)
    }

    fn connect(service: &mut NotificationService, bus: &mut RecordingBus) {
        let payload = json!({ "serviceName": SERVICE_NAME, "connected": true }).to_string();
        let status = service.server_status_token();
        service.service_response(bus, SERVER_STATUS_METHOD, &payload, status);
    }

    #[test]
    fn test_watch_uses_session() {
        let mut bus = RecordingBus::new();
        let (mut service, _rx) = NotificationService::new(ClientIdentity::service(""));
        service.base.set_session_id(Some("s-1"));
        service.set_app_id(&mut bus, "com.example.shell");

        let payload: Value = serde_json::from_str(&bus.last_call().payload).unwrap();
        assert_eq!(payload["sessionId"], "s-1");
    }

    #[test]
    fn test_feeds_subscribe_lazily() {
        let (mut service, _rx, mut bus) = attached();
        assert!(bus.calls_to(NotificationKind::Toast.method()).is_empty());

        service.toast_list(&mut bus);
        service.toast_list(&mut bus);
        assert_eq!(bus.calls_to(NotificationKind::Toast.method()).len(), 1);
        assert!(bus.calls_to(NotificationKind::Alert.method()).is_empty());
    }

    #[test]
    fn test_connected_reissues_requested_feeds() {
        let (mut service, _rx, mut bus) = attached();
        service.alert_list(&mut bus);
        let first = service.feed_token(NotificationKind::Alert);

        connect(&mut service, &mut bus);

        assert!(bus.cancels.contains(&first));
        assert_eq!(bus.calls_to(NotificationKind::Alert.method()).len(), 2);
        assert_ne!(service.feed_token(NotificationKind::Alert), first);
        assert!(bus.calls_to(NotificationKind::Toast.method()).is_empty());
    }

    #[test]
    fn test_list_change_and_confirmation() {
        let (mut service, rx, mut bus) = attached();
        service.toast_list(&mut bus);
        let token = service.feed_token(NotificationKind::Toast);
        let method = NotificationKind::Toast.method();

        service.service_response(&mut bus, method, r#"{"returnValue":true,"subscribed":true}"#, token);
        let list = r#"{"returnValue":true,"toasts":[1]}"#;
        service.service_response(&mut bus, method, list, token);
        service.service_response(&mut bus, method, list, token);

        let changes: Vec<_> = drain(&rx)
            .into_iter()
            .filter(|e| matches!(e, ServiceEvent::ToastListChanged(_)))
            .collect();
        assert_eq!(changes, vec![ServiceEvent::ToastListChanged(list.into())]);
        assert_eq!(service.toast_list(&mut bus), list);
    }

    #[test]
    fn test_message_payload_counts_as_update() {
        let (mut service, rx, mut bus) = attached();
        service.pincode_prompt_list(&mut bus);
        let token = service.feed_token(NotificationKind::PincodePrompt);

        service.service_response(
            &mut bus,
            NotificationKind::PincodePrompt.method(),
            r#"{"message":"enter pin"}"#,
            token,
        );
        assert!(drain(&rx)
            .iter()
            .any(|e| matches!(e, ServiceEvent::PincodePromptListChanged(_))));
    }

    #[test]
    fn test_stale_token_ignored() {
        let (mut service, rx, mut bus) = attached();
        service.toast_list(&mut bus);
        service.service_response(
            &mut bus,
            NotificationKind::Toast.method(),
            r#"{"returnValue":true,"toasts":[]}"#,
            Token(999),
        );
        assert!(!drain(&rx)
            .iter()
            .any(|e| matches!(e, ServiceEvent::ToastListChanged(_))));
    }

    #[test]
    fn test_session_change_resets() {
        let (mut service, _rx, mut bus) = attached();
        service.set_session_id(&mut bus, Some("s-2"));
        service.set_session_id(&mut bus, Some("s-2"));

        assert_eq!(bus.cancel_all, 1);
        let rewatch: Value = serde_json::from_str(&bus.last_call().payload).unwrap();
        assert_eq!(rewatch["sessionId"], "s-2");
    }

    #[test]
    fn test_service_down_resets() {
        let (mut service, _rx, mut bus) = attached();
        service.toast_list(&mut bus);
        service.hub_error(&mut bus, "/getToastNotification", hub_error::SERVICE_DOWN, "{}", Token(3));

        assert_eq!(bus.cancel_all, 1);
        assert_eq!(service.feed_token(NotificationKind::Toast), Token::INVALID);
        assert_eq!(bus.calls_to(SERVER_STATUS_METHOD).len(), 2);
    }
}
