//! Fuzz target for inbound request handling.
//!
//! Runs arbitrary requests through the reply envelope logic and checks
//! that exactly one well-formed JSON reply comes out.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use lunabridge::bus::{ClientIdentity, InboundRequest, RequestId, Token};
use lunabridge::listener::{Listener, ListenerBus};
use lunabridge::service::{handle_request, Service};
use serde_json::Value;
use std::time::Duration;

#[derive(Arbitrary, Debug)]
struct FuzzRequest {
    method: String,
    payload: String,
    session: Option<String>,
}

/// Bus that only keeps replies.
#[derive(Default)]
struct ReplyBus {
    replies: Vec<String>,
}

impl ListenerBus for ReplyBus {
    fn call(&mut self, _: &ClientIdentity, _: &str, _: &str, _: &str, _: Option<&str>) -> Token {
        Token::INVALID
    }

    fn set_timeout(&mut self, _: &ClientIdentity, _: Token, _: Duration) -> bool {
        false
    }

    fn cancel(&mut self, _: &ClientIdentity, _: Token) {}

    fn cancel_all(&mut self) {}

    fn yield_now(&mut self) {}

    fn register_methods(&mut self, _: &ClientIdentity, _: &str, _: &[String]) -> bool {
        true
    }

    fn reply(&mut self, _: &ClientIdentity, _: RequestId, payload: &str) -> bool {
        self.replies.push(payload.to_string());
        true
    }

    fn subscription_add(&mut self, _: &ClientIdentity, _: &str, _: RequestId) -> bool {
        true
    }

    fn subscription_reply(&mut self, _: &ClientIdentity, _: &str, _: &str) -> bool {
        true
    }

    fn subscribers_count(&mut self, _: &ClientIdentity, _: &str) -> usize {
        0
    }
}

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
            "fail" => Some(serde_json::json!({"errorCode": 1, "errorText": "failed"})),
            _ => None,
        }
    }
}

fuzz_target!(|input: FuzzRequest| {
    let (base, _rx) = Service::new(ClientIdentity::service("com.example.fuzz"));
    let mut echo = Echo { base };
    let mut bus = ReplyBus::default();

    let request = InboundRequest {
        id: RequestId(1),
        category: "/".into(),
        method: input.method,
        payload: input.payload,
        session: input.session,
    };
    handle_request(&mut echo, &mut bus, &request);

    assert_eq!(bus.replies.len(), 1);
    let reply: Value = serde_json::from_str(&bus.replies[0]).unwrap();
    assert!(reply.get("returnValue").and_then(Value::as_bool).is_some());
});
