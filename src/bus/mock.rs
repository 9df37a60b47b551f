//! Scripted in-memory bus used by unit tests.

use super::{
    BusConnector, BusError, BusHandle, CallContext, EventSource, Priority, RequestId, Token,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Which native entry point a call went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallVariant {
    Call,
    CallOneReply,
    CallFromApplication,
    CallFromApplicationOneReply,
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub variant: CallVariant,
    pub uri: String,
    pub payload: String,
    pub session: Option<String>,
    pub app_id: Option<String>,
    pub context: Option<CallContext>,
    pub token: Token,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub registrations: Vec<(String, Option<String>)>,
    pub fail_register: bool,
    pub fail_attach: bool,
    pub fail_priority: bool,
    /// Number of upcoming calls to reject.
    pub fail_calls: u32,
    pub next_token: u64,
    pub calls: Vec<MockCall>,
    pub cancels: Vec<Token>,
    pub timeouts: Vec<(Token, Duration)>,
    pub categories: Vec<(String, Vec<String>)>,
    pub replies: Vec<(RequestId, String)>,
    pub subscriptions: HashMap<String, Vec<RequestId>>,
    pub pushes: Vec<(String, String)>,
    pub priority: Option<Priority>,
    pub unregisters: usize,
    pub source: Option<EventSource>,
}

#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn last_call(&self) -> MockCall {
        self.state().calls.last().cloned().expect("no calls recorded")
    }

    pub fn cancels(&self) -> Vec<Token> {
        self.state().cancels.clone()
    }

    fn handle(&self) -> Box<dyn BusHandle> {
        Box::new(MockHandle {
            state: self.state.clone(),
        })
    }
}

impl BusConnector for MockConnector {
    fn register(&self, name: &str) -> Result<Box<dyn BusHandle>, BusError> {
        let mut state = self.state();
        state.registrations.push((name.to_string(), None));
        if state.fail_register {
            return Err(BusError::Register("scripted failure".into()));
        }
        drop(state);
        Ok(self.handle())
    }

    fn register_application(
        &self,
        name: &str,
        app_id: &str,
    ) -> Result<Box<dyn BusHandle>, BusError> {
        let mut state = self.state();
        state
            .registrations
            .push((name.to_string(), Some(app_id.to_string())));
        if state.fail_register {
            return Err(BusError::Register("scripted failure".into()));
        }
        drop(state);
        Ok(self.handle())
    }
}

struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    fn record(
        &mut self,
        variant: CallVariant,
        uri: &str,
        payload: &str,
        session: Option<&str>,
        app_id: Option<&str>,
        context: Option<CallContext>,
    ) -> Result<Token, BusError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_calls > 0 {
            state.fail_calls -= 1;
            return Err(BusError::Call("scripted failure".into()));
        }
        state.next_token += 1;
        let token = Token(state.next_token);
        state.calls.push(MockCall {
            variant,
            uri: uri.to_string(),
            payload: payload.to_string(),
            session: session.map(str::to_string),
            app_id: app_id.map(str::to_string),
            context,
            token,
        });
        Ok(token)
    }
}

impl BusHandle for MockHandle {
    fn attach(&mut self, source: EventSource) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_attach {
            return Err(BusError::Attach("scripted failure".into()));
        }
        state.source = Some(source);
        Ok(())
    }

    fn set_priority(&mut self, priority: Priority) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_priority {
            return Err(BusError::Priority("scripted failure".into()));
        }
        state.priority = Some(priority);
        Ok(())
    }

    fn call(
        &mut self,
        uri: &str,
        payload: &str,
        session: Option<&str>,
        context: Option<CallContext>,
    ) -> Result<Token, BusError> {
        self.record(CallVariant::Call, uri, payload, session, None, context)
    }

    fn call_one_reply(
        &mut self,
        uri: &str,
        payload: &str,
        session: Option<&str>,
        context: Option<CallContext>,
    ) -> Result<Token, BusError> {
        self.record(CallVariant::CallOneReply, uri, payload, session, None, context)
    }

    fn call_from_application(
        &mut self,
        uri: &str,
        payload: &str,
        session: Option<&str>,
        app_id: &str,
        context: Option<CallContext>,
    ) -> Result<Token, BusError> {
        self.record(
            CallVariant::CallFromApplication,
            uri,
            payload,
            session,
            Some(app_id),
            context,
        )
    }

    fn call_from_application_one_reply(
        &mut self,
        uri: &str,
        payload: &str,
        session: Option<&str>,
        app_id: &str,
        context: Option<CallContext>,
    ) -> Result<Token, BusError> {
        self.record(
            CallVariant::CallFromApplicationOneReply,
            uri,
            payload,
            session,
            Some(app_id),
            context,
        )
    }

    fn cancel(&mut self, token: Token) -> Result<(), BusError> {
        self.state.lock().unwrap().cancels.push(token);
        Ok(())
    }

    fn set_timeout(&mut self, token: Token, timeout: Duration) -> Result<(), BusError> {
        self.state.lock().unwrap().timeouts.push((token, timeout));
        Ok(())
    }

    fn register_category(&mut self, category: &str, methods: &[String]) -> Result<(), BusError> {
        self.state
            .lock()
            .unwrap()
            .categories
            .push((category.to_string(), methods.to_vec()));
        Ok(())
    }

    fn reply(&mut self, request: RequestId, payload: &str) -> Result<(), BusError> {
        self.state
            .lock()
            .unwrap()
            .replies
            .push((request, payload.to_string()));
        Ok(())
    }

    fn subscription_add(&mut self, key: &str, request: RequestId) -> Result<(), BusError> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .entry(key.to_string())
            .or_default()
            .push(request);
        Ok(())
    }

    fn subscription_reply(&mut self, key: &str, payload: &str) -> Result<(), BusError> {
        self.state
            .lock()
            .unwrap()
            .pushes
            .push((key.to_string(), payload.to_string()));
        Ok(())
    }

    fn subscribers_count(&self, key: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .get(key)
            .map_or(0, Vec::len)
    }

    fn unregister(&mut self) -> Result<(), BusError> {
        self.state.lock().unwrap().unregisters += 1;
        Ok(())
    }
}
