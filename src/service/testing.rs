//! Recording [`ListenerBus`] for service unit tests.

use super::ServiceEvent;
use crate::bus::{ClientIdentity, RequestId, Token};
use crate::listener::ListenerBus;
use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub identity: String,
    pub service: String,
    pub method: String,
    pub payload: String,
    pub session: Option<String>,
    pub token: Token,
}

#[derive(Default)]
pub struct RecordingBus {
    next_token: u64,
    /// Number of upcoming calls to reject.
    pub fail_calls: u32,
    pub calls: Vec<RecordedCall>,
    pub timeouts: Vec<(Token, Duration)>,
    pub cancels: Vec<Token>,
    pub cancel_all: usize,
    pub yields: usize,
    pub registered: Vec<(String, Vec<String>)>,
    pub replies: Vec<(RequestId, String)>,
    pub subscriptions: HashMap<String, Vec<RequestId>>,
    pub pushes: Vec<(String, String)>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_call(&self) -> &RecordedCall {
        self.calls.last().expect("no calls recorded")
    }

    pub fn calls_to(&self, method: &str) -> Vec<&RecordedCall> {
        self.calls.iter().filter(|c| c.method == method).collect()
    }
}

impl ListenerBus for RecordingBus {
    fn call(
        &mut self,
        identity: &ClientIdentity,
        service: &str,
        method: &str,
        payload: &str,
        session: Option<&str>,
    ) -> Token {
        if self.fail_calls > 0 {
            self.fail_calls -= 1;
            return Token::INVALID;
        }
        self.next_token += 1;
        let token = Token(self.next_token);
        self.calls.push(RecordedCall {
            identity: identity.app_id.clone(),
            service: service.to_string(),
            method: method.to_string(),
            payload: payload.to_string(),
            session: session.map(str::to_string),
            token,
        });
        token
    }

    fn set_timeout(&mut self, _identity: &ClientIdentity, token: Token, timeout: Duration) -> bool {
        self.timeouts.push((token, timeout));
        true
    }

    fn cancel(&mut self, _identity: &ClientIdentity, token: Token) {
        self.cancels.push(token);
    }

    fn cancel_all(&mut self) {
        self.cancel_all += 1;
    }

    fn yield_now(&mut self) {
        self.yields += 1;
    }

    fn register_methods(
        &mut self,
        _identity: &ClientIdentity,
        category: &str,
        methods: &[String],
    ) -> bool {
        self.registered.push((category.to_string(), methods.to_vec()));
        true
    }

    fn reply(&mut self, _identity: &ClientIdentity, request: RequestId, payload: &str) -> bool {
        self.replies.push((request, payload.to_string()));
        true
    }

    fn subscription_add(
        &mut self,
        _identity: &ClientIdentity,
        method: &str,
        request: RequestId,
    ) -> bool {
        self.subscriptions
            .entry(method.to_string())
            .or_default()
            .push(request);
        true
    }

    fn subscription_reply(&mut self, _identity: &ClientIdentity, method: &str, payload: &str) -> bool {
        self.pushes.push((method.to_string(), payload.to_string()));
        true
    }

    fn subscribers_count(&mut self, _identity: &ClientIdentity, method: &str) -> usize {
        self.subscriptions.get(method).map_or(0, Vec::len)
    }
}

/// Everything emitted so far.
pub fn drain(rx: &Receiver<ServiceEvent>) -> Vec<ServiceEvent> {
    rx.try_iter().collect()
}
