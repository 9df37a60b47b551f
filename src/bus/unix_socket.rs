//! Unix domain socket bus backend.
//!
//! Talks newline-delimited JSON frames ([`super::wire`]) to a hub socket.
//! Registration is a blocking handshake; after [`BusHandle::attach`] a reader
//! thread decodes hub frames and forwards them onto the host loop channel.
//! A second thread per handle expires call timeouts from a deadline heap.

use super::wire::{ClientFrame, HubFrame};
use super::{
    lock, BusConnector, BusError, BusEvent, BusHandle, BusMessage, CallContext, EventSource,
    InboundRequest, MessageKind, Priority, RequestId, Token, TIMEOUT_PAYLOAD,
};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io::{BufRead, BufReader, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long registration and writes may block.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Default hub socket path.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("luna-bus.sock")
}

/// Registers clients with the hub listening on `socket_path`.
#[derive(Debug, Clone)]
pub struct UnixBusConnector {
    socket_path: PathBuf,
}

impl UnixBusConnector {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn connect(&self, name: &str, app_id: Option<&str>) -> Result<UnixBusHandle, BusError> {
        let path = &self.socket_path;

        if !path.exists() {
            return Err(BusError::Register(format!(
                "{}: hub not running",
                path.display()
            )));
        }

        let stream = UnixStream::connect(path)
            .map_err(|e| BusError::Register(format!("{}: {}", path.display(), e)))?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let mut handle = UnixBusHandle::new(name, stream);

        handle.send(&ClientFrame::Register {
            name: name.to_string(),
            app_id: app_id.map(str::to_string),
        })?;

        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(BusError::Register("hub closed the connection".into()));
        }

        match HubFrame::decode(&line).map_err(|e| BusError::Protocol(e.to_string()))? {
            HubFrame::Registered { unique_name } => {
                info!("Registered on bus as {} ({})", name, unique_name);
            }
            HubFrame::Error { code, message } => {
                return Err(BusError::Register(format!("{} ({})", message, code)));
            }
            other => {
                return Err(BusError::Protocol(format!(
                    "unexpected registration reply: {:?}",
                    other
                )));
            }
        }

        // Replies may take arbitrarily long once registered.
        lock(&handle.writer).set_read_timeout(None)?;
        handle.reader = Some(reader);
        Ok(handle)
    }
}

impl BusConnector for UnixBusConnector {
    fn register(&self, name: &str) -> Result<Box<dyn BusHandle>, BusError> {
        Ok(Box::new(self.connect(name, None)?))
    }

    fn register_application(
        &self,
        name: &str,
        app_id: &str,
    ) -> Result<Box<dyn BusHandle>, BusError> {
        Ok(Box::new(self.connect(name, Some(app_id))?))
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingCall {
    context: CallContext,
    one_reply: bool,
    answered: bool,
}

/// State shared with the reader and timeout threads.
#[derive(Default)]
struct Shared {
    /// Calls whose replies are routed back, by token.
    pending: Mutex<HashMap<Token, PendingCall>>,
    /// Inbound subscribers, by subscription key.
    subscriptions: Mutex<HashMap<String, Vec<RequestId>>>,
    /// Call timeout deadlines, earliest first.
    timers: Mutex<BinaryHeap<Reverse<(Instant, Token)>>>,
    /// Signalled when a deadline is added or the handle closes.
    timer_wake: Condvar,
    /// Set before a deliberate close so EOF is not reported as a drop.
    closing: AtomicBool,
}

/// A registered hub connection.
pub struct UnixBusHandle {
    name: String,
    writer: Arc<Mutex<UnixStream>>,
    reader: Option<BufReader<UnixStream>>,
    reader_thread: Option<JoinHandle<()>>,
    timer_thread: Option<JoinHandle<()>>,
    source: Option<EventSource>,
    shared: Arc<Shared>,
    next_token: u64,
}

impl UnixBusHandle {
    fn new(name: &str, stream: UnixStream) -> Self {
        Self {
            name: name.to_string(),
            writer: Arc::new(Mutex::new(stream)),
            reader: None,
            reader_thread: None,
            timer_thread: None,
            source: None,
            shared: Arc::new(Shared::default()),
            next_token: 0,
        }
    }

    fn send(&self, frame: &ClientFrame) -> Result<(), BusError> {
        write_frame(&self.writer, frame)
    }

    fn submit(
        &mut self,
        uri: &str,
        payload: &str,
        session: Option<&str>,
        app_id: Option<&str>,
        context: Option<CallContext>,
        one_reply: bool,
    ) -> Result<Token, BusError> {
        if self.source.is_none() {
            return Err(BusError::NotAttached);
        }

        self.next_token += 1;
        let token = Token(self.next_token);

        // Registered before sending so a fast reply still finds its route.
        if let Some(context) = context {
            lock(&self.shared.pending).insert(
                token,
                PendingCall {
                    context,
                    one_reply,
                    answered: false,
                },
            );
        }

        let frame = ClientFrame::Call {
            token,
            uri: uri.to_string(),
            payload: payload.to_string(),
            one_reply,
            session: session.map(str::to_string),
            app_id: app_id.map(str::to_string),
        };

        if let Err(e) = self.send(&frame) {
            lock(&self.shared.pending).remove(&token);
            return Err(BusError::Call(e.to_string()));
        }

        debug!("Bus call {} -> {} (token {})", self.name, uri, token);
        Ok(token)
    }

    fn close(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        let _ = lock(&self.writer).shutdown(Shutdown::Both);
        if let Some(thread) = self.reader_thread.take() {
            let _ = thread.join();
        }
        {
            let mut timers = lock(&self.shared.timers);
            timers.clear();
            self.shared.timer_wake.notify_all();
        }
        if let Some(thread) = self.timer_thread.take() {
            let _ = thread.join();
        }
        lock(&self.shared.pending).clear();
        lock(&self.shared.subscriptions).clear();
    }
}

impl BusHandle for UnixBusHandle {
    fn attach(&mut self, source: EventSource) -> Result<(), BusError> {
        if self.reader_thread.is_some() {
            return Err(BusError::Attach(format!("{} is already attached", self.name)));
        }
        let reader = self
            .reader
            .take()
            .ok_or_else(|| BusError::Attach(format!("{} has no open stream", self.name)))?;

        let shared = self.shared.clone();
        let thread_source = source.clone();
        let thread = std::thread::Builder::new()
            .name(format!("bus-reader-{}", self.name))
            .spawn(move || read_loop(reader, shared, thread_source))
            .map_err(|e| BusError::Attach(e.to_string()))?;
        self.reader_thread = Some(thread);

        let shared = self.shared.clone();
        let writer = self.writer.clone();
        let thread_source = source.clone();
        let timer = std::thread::Builder::new()
            .name(format!("bus-timer-{}", self.name))
            .spawn(move || timer_loop(shared, writer, thread_source))
            .map_err(|e| BusError::Attach(e.to_string()))?;
        self.timer_thread = Some(timer);

        self.source = Some(source);
        Ok(())
    }

    fn set_priority(&mut self, priority: Priority) -> Result<(), BusError> {
        self.send(&ClientFrame::SetPriority { priority })
            .map_err(|e| BusError::Priority(e.to_string()))
    }

    fn call(
        &mut self,
        uri: &str,
        payload: &str,
        session: Option<&str>,
        context: Option<CallContext>,
    ) -> Result<Token, BusError> {
        self.submit(uri, payload, session, None, context, false)
    }

    fn call_one_reply(
        &mut self,
        uri: &str,
        payload: &str,
        session: Option<&str>,
        context: Option<CallContext>,
    ) -> Result<Token, BusError> {
        self.submit(uri, payload, session, None, context, true)
    }

    fn call_from_application(
        &mut self,
        uri: &str,
        payload: &str,
        session: Option<&str>,
        app_id: &str,
        context: Option<CallContext>,
    ) -> Result<Token, BusError> {
        self.submit(uri, payload, session, Some(app_id), context, false)
    }

    fn call_from_application_one_reply(
        &mut self,
        uri: &str,
        payload: &str,
        session: Option<&str>,
        app_id: &str,
        context: Option<CallContext>,
    ) -> Result<Token, BusError> {
        self.submit(uri, payload, session, Some(app_id), context, true)
    }

    fn cancel(&mut self, token: Token) -> Result<(), BusError> {
        lock(&self.shared.pending).remove(&token);
        self.send(&ClientFrame::Cancel { token })
            .map_err(|e| BusError::Cancel(e.to_string()))
    }

    fn set_timeout(&mut self, token: Token, timeout: Duration) -> Result<(), BusError> {
        if !lock(&self.shared.pending).contains_key(&token) {
            return Err(BusError::Timeout(format!("token {} is not pending", token)));
        }
        if self.source.is_none() {
            return Err(BusError::NotAttached);
        }

        self.send(&ClientFrame::SetTimeout {
            token,
            timeout_ms: timeout.as_millis() as u64,
        })
        .map_err(|e| BusError::Timeout(e.to_string()))?;

        let mut timers = lock(&self.shared.timers);
        timers.push(Reverse((Instant::now() + timeout, token)));
        self.shared.timer_wake.notify_one();

        Ok(())
    }

    fn register_category(&mut self, category: &str, methods: &[String]) -> Result<(), BusError> {
        self.send(&ClientFrame::RegisterCategory {
            category: category.to_string(),
            methods: methods.to_vec(),
        })
    }

    fn reply(&mut self, request: RequestId, payload: &str) -> Result<(), BusError> {
        self.send(&ClientFrame::Reply {
            request,
            payload: payload.to_string(),
        })
    }

    fn subscription_add(&mut self, key: &str, request: RequestId) -> Result<(), BusError> {
        lock(&self.shared.subscriptions)
            .entry(key.to_string())
            .or_default()
            .push(request);
        Ok(())
    }

    fn subscription_reply(&mut self, key: &str, payload: &str) -> Result<(), BusError> {
        let subscribers = lock(&self.shared.subscriptions)
            .get(key)
            .cloned()
            .unwrap_or_default();

        for request in subscribers {
            self.send(&ClientFrame::SubscriptionReply {
                request,
                payload: payload.to_string(),
            })?;
        }
        Ok(())
    }

    fn subscribers_count(&self, key: &str) -> usize {
        lock(&self.shared.subscriptions)
            .get(key)
            .map_or(0, Vec::len)
    }

    fn unregister(&mut self) -> Result<(), BusError> {
        let result = self.send(&ClientFrame::Unregister);
        self.close();
        info!("Unregistered {} from bus", self.name);
        result
    }
}

impl Drop for UnixBusHandle {
    fn drop(&mut self) {
        if !self.shared.closing.load(Ordering::SeqCst) {
            self.close();
        }
    }
}

fn write_frame(writer: &Mutex<UnixStream>, frame: &ClientFrame) -> Result<(), BusError> {
    let json = frame
        .encode()
        .map_err(|e| BusError::Protocol(e.to_string()))?;
    let mut stream = lock(writer);
    writeln!(stream, "{}", json)?;
    stream.flush()?;
    Ok(())
}

fn read_loop(mut reader: BufReader<UnixStream>, shared: Arc<Shared>, source: EventSource) {
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => match HubFrame::decode(&line) {
                Ok(frame) => {
                    if !forward_frame(frame, &shared, &source) {
                        debug!("Host loop gone, stopping reader for {}", source.identity);
                        return;
                    }
                }
                Err(e) => warn!("Bus frame parse error on {}: {}", source.identity, e),
            },
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Bus read error on {}: {}", source.identity, e);
                break;
            }
        }
    }

    if !shared.closing.load(Ordering::SeqCst) {
        warn!("Bus connection for {} closed by hub", source.identity);
        let _ = source.sender.send(BusEvent::Disconnected {
            identity: source.identity.clone(),
        });
    }
}

/// Expire call timeouts in deadline order until the handle closes.
fn timer_loop(shared: Arc<Shared>, writer: Arc<Mutex<UnixStream>>, source: EventSource) {
    loop {
        let token = {
            let mut timers = lock(&shared.timers);
            loop {
                if shared.closing.load(Ordering::SeqCst) {
                    return;
                }
                let now = Instant::now();
                match timers.peek().map(|Reverse((deadline, _))| *deadline) {
                    Some(deadline) if deadline <= now => break,
                    Some(deadline) => {
                        timers = shared
                            .timer_wake
                            .wait_timeout(timers, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                    None => {
                        timers = shared
                            .timer_wake
                            .wait(timers)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
            match timers.pop() {
                Some(Reverse((_, token))) => token,
                None => continue,
            }
        };

        if !expire(&shared, &writer, &source, token) {
            debug!("Host loop gone, stopping timer for {}", source.identity);
            return;
        }
    }
}

/// Cancel an unanswered call at the hub and report its timeout.
/// Returns false once the host loop is gone.
fn expire(shared: &Shared, writer: &Mutex<UnixStream>, source: &EventSource, token: Token) -> bool {
    let expired = {
        let mut pending = lock(&shared.pending);
        match pending.get(&token) {
            Some(call) if !call.answered => pending.remove(&token),
            _ => None,
        }
    };
    let Some(call) = expired else {
        return true;
    };

    debug!("Call {} on {} timed out", token, source.identity);
    if let Err(e) = write_frame(writer, &ClientFrame::Cancel { token }) {
        debug!("Failed to cancel timed out call {}: {}", token, e);
    }
    source
        .sender
        .send(BusEvent::Reply {
            identity: source.identity.clone(),
            context: call.context,
            message: BusMessage {
                token,
                payload: TIMEOUT_PAYLOAD.to_string(),
                kind: MessageKind::Timeout,
            },
        })
        .is_ok()
}

/// Route one hub frame. Returns false once the host loop is gone.
fn forward_frame(frame: HubFrame, shared: &Shared, source: &EventSource) -> bool {
    let event = match frame {
        HubFrame::Response { token, payload } => {
            route_reply(shared, token).map(|context| BusEvent::Reply {
                identity: source.identity.clone(),
                context,
                message: BusMessage {
                    token,
                    payload,
                    kind: MessageKind::Reply,
                },
            })
        }
        HubFrame::HubError {
            token,
            error,
            payload,
        } => route_reply(shared, token).map(|context| BusEvent::Reply {
            identity: source.identity.clone(),
            context,
            message: BusMessage {
                token,
                payload,
                kind: MessageKind::HubError(error),
            },
        }),
        HubFrame::Request {
            request,
            category,
            method,
            payload,
            session,
        } => Some(BusEvent::Request {
            identity: source.identity.clone(),
            request: InboundRequest {
                id: request,
                category,
                method,
                payload,
                session,
            },
        }),
        HubFrame::SubscriptionCancelled { request } => {
            let mut subscriptions = lock(&shared.subscriptions);
            let key = subscriptions
                .iter()
                .find(|(_, requests)| requests.contains(&request))
                .map(|(key, _)| key.clone());
            key.map(|key| {
                if let Some(requests) = subscriptions.get_mut(&key) {
                    requests.retain(|r| *r != request);
                }
                BusEvent::SubscriptionCancelled {
                    identity: source.identity.clone(),
                    method: key,
                }
            })
        }
        other @ (HubFrame::Registered { .. } | HubFrame::Error { .. }) => {
            warn!("Unexpected hub frame on {}: {:?}", source.identity, other);
            None
        }
    };

    match event {
        Some(event) => source.sender.send(event).is_ok(),
        None => true,
    }
}

/// Find where a reply goes, forgetting single-reply calls once answered.
fn route_reply(shared: &Shared, token: Token) -> Option<CallContext> {
    let mut pending = lock(&shared.pending);
    let Some(call) = pending.get_mut(&token) else {
        debug!("Dropping reply for unknown token {}", token);
        return None;
    };
    call.answered = true;
    let context = call.context;
    if call.one_reply {
        pending.remove(&token);
    }
    Some(context)
}
