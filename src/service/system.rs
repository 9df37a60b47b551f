//! Client for `com.palm.systemservice` preferences and system time.

use super::{keys, parse_object, Service, ServiceEvent};
use crate::bus::{ClientIdentity, Token};
use crate::listener::{Listener, ListenerBus};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use tracing::warn;

pub const SERVICE_NAME: &str = "com.palm.systemservice";

pub const METHOD_GET_PREFERENCES: &str = "/getPreferences";
pub const METHOD_SET_PREFERENCES: &str = "/setPreferences";
pub const METHOD_GET_SYSTEM_TIME: &str = "/time/getSystemTime";

pub const KEY_WALLPAPER: &str = "wallpaper";
pub const KEY_TIME_FORMAT: &str = "timeFormat";
pub const KEY_AIRPLANE_MODE: &str = "airplaneMode";
pub const KEY_ROTATION_LOCK: &str = "rotationLock";
pub const KEY_MUTE_SOUND: &str = "muteSound";
pub const KEY_LOCK_TIMEOUT: &str = "lockTimeout";

pub struct SystemService {
    base: Service,
    preferences: HashMap<String, Value>,
    /// Preference subscriptions already placed, by key.
    watched: HashMap<String, Token>,
    time_token: Token,
    system_time: i64,
}

impl SystemService {
    pub fn new(identity: ClientIdentity) -> (Self, Receiver<ServiceEvent>) {
        let (base, rx) = Service::new(identity);
        let service = Self {
            base,
            preferences: HashMap::new(),
            watched: HashMap::new(),
            time_token: Token::INVALID,
            system_time: 0,
        };
        (service, rx)
    }

    /// Subscribe to preference `key` unless already subscribed.
    pub fn get_preference(&mut self, bus: &mut dyn ListenerBus, key: &str) -> Token {
        if let Some(token) = self.watched.get(key) {
            return *token;
        }
        let payload = json!({ "keys": [key], "subscribe": true });
        let token = self.call(bus, METHOD_GET_PREFERENCES, &payload.to_string());
        if token.is_valid() {
            self.watched.insert(key.to_string(), token);
        }
        token
    }

    pub fn set_preference(&mut self, bus: &mut dyn ListenerBus, key: &str, value: Value) -> Token {
        let mut payload = Map::new();
        payload.insert(key.to_string(), value);
        self.call(bus, METHOD_SET_PREFERENCES, &Value::Object(payload).to_string())
    }

    /// Cached value of `key`, if one was received.
    pub fn preference(&self, key: &str) -> Option<&Value> {
        self.preferences.get(key)
    }

    pub fn wallpaper(&mut self, bus: &mut dyn ListenerBus) -> Option<String> {
        self.get_preference(bus, KEY_WALLPAPER);
        self.preference(KEY_WALLPAPER)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn time_format(&mut self, bus: &mut dyn ListenerBus) -> Option<String> {
        self.get_preference(bus, KEY_TIME_FORMAT);
        self.preference(KEY_TIME_FORMAT)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn airplane_mode(&mut self, bus: &mut dyn ListenerBus) -> bool {
        self.bool_preference(bus, KEY_AIRPLANE_MODE)
    }

    pub fn rotation_lock(&mut self, bus: &mut dyn ListenerBus) -> bool {
        self.bool_preference(bus, KEY_ROTATION_LOCK)
    }

    pub fn mute_sound(&mut self, bus: &mut dyn ListenerBus) -> bool {
        self.bool_preference(bus, KEY_MUTE_SOUND)
    }

    /// Lock timeout in seconds.
    pub fn lock_timeout(&mut self, bus: &mut dyn ListenerBus) -> i64 {
        self.get_preference(bus, KEY_LOCK_TIMEOUT);
        self.preference(KEY_LOCK_TIMEOUT)
            .and_then(Value::as_f64)
            .map_or(0, |seconds| seconds as i64)
    }

    pub fn set_time_format(&mut self, bus: &mut dyn ListenerBus, format: &str) -> Token {
        self.set_preference(bus, KEY_TIME_FORMAT, Value::from(format))
    }

    pub fn set_airplane_mode(&mut self, bus: &mut dyn ListenerBus, enabled: bool) -> Token {
        self.set_preference(bus, KEY_AIRPLANE_MODE, Value::Bool(enabled))
    }

    pub fn set_rotation_lock(&mut self, bus: &mut dyn ListenerBus, enabled: bool) -> Token {
        self.set_preference(bus, KEY_ROTATION_LOCK, Value::Bool(enabled))
    }

    pub fn set_mute_sound(&mut self, bus: &mut dyn ListenerBus, enabled: bool) -> Token {
        self.set_preference(bus, KEY_MUTE_SOUND, Value::Bool(enabled))
    }

    pub fn set_lock_timeout(&mut self, bus: &mut dyn ListenerBus, seconds: i64) -> Token {
        self.set_preference(bus, KEY_LOCK_TIMEOUT, Value::from(seconds))
    }

    /// Last known system time (UTC seconds); subscribes on first use.
    pub fn system_time(&mut self, bus: &mut dyn ListenerBus) -> i64 {
        if !self.time_token.is_valid() {
            self.time_token = self.call(bus, METHOD_GET_SYSTEM_TIME, r#"{"subscribe":true}"#);
        }
        self.system_time
    }

    fn bool_preference(&mut self, bus: &mut dyn ListenerBus, key: &str) -> bool {
        self.get_preference(bus, key);
        self.preference(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn call(&mut self, bus: &mut dyn ListenerBus, method: &str, payload: &str) -> Token {
        let uri = self.service_uri();
        self.base.call(bus, &uri, method, payload, None, None)
    }

    fn on_preferences(&mut self, payload: &str) {
        let mut object = parse_object(payload);
        object.remove(keys::RETURN_VALUE);
        object.remove(keys::SUBSCRIBED);

        // One preference per reply; the first key wins.
        let Some((key, value)) = object.into_iter().next() else {
            return;
        };
        let value = if key == KEY_WALLPAPER {
            value.get("wallpaperFile").cloned().unwrap_or(Value::Null)
        } else {
            value
        };

        if self.preferences.get(&key) == Some(&value) {
            return;
        }
        self.preferences.insert(key.clone(), value.clone());
        self.base.emit(ServiceEvent::PreferenceChanged { key, value });
    }

    fn on_system_time(&mut self, payload: &str) {
        let object = parse_object(payload);
        self.system_time = object
            .get("utc")
            .and_then(Value::as_f64)
            .map_or(0, |utc| utc as i64);
        self.base.emit(ServiceEvent::SystemTimeChanged(self.system_time));
    }
}

impl Listener for SystemService {
    fn service(&self) -> &Service {
        &self.base
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.base
    }

    fn interface_name(&self) -> &str {
        SERVICE_NAME
    }

    fn cancel(&mut self, bus: &mut dyn ListenerBus, token: Token) {
        self.base.cancel(bus, token);
        if token.is_valid() {
            self.watched.retain(|_, watched| *watched != token);
            if token == self.time_token {
                self.time_token = Token::INVALID;
            }
        } else {
            self.watched.clear();
            self.time_token = Token::INVALID;
        }
    }

    fn service_response(&mut self, _bus: &mut dyn ListenerBus, method: &str, payload: &str, token: Token) {
        self.base.check_for_errors(payload, token);
        self.base.emit(ServiceEvent::Response {
            method: method.to_string(),
            payload: payload.to_string(),
            token,
        });

        match method {
            METHOD_GET_PREFERENCES | METHOD_SET_PREFERENCES => self.on_preferences(payload),
            METHOD_GET_SYSTEM_TIME => self.on_system_time(payload),
            _ => warn!("SystemService: unknown method {}", method),
        }
    }
}
