//! Command-line bus client.
//!
//! The event pump is blocking, so each command runs it on a blocking task
//! and races it against Ctrl-C. On Ctrl-C the pump is asked to stop, then
//! shuts the manager down so every live call is cancelled at the hub.

use crate::bus::unix_socket::UnixBusConnector;
use crate::bus::{ClientIdentity, Token};
use crate::config::Config;
use crate::dispatcher::ServiceManager;
use crate::listener::{Listener, ListenerId};
use crate::service::{
    self, parse_object, server_status, GenericService, ServiceEvent, URI_SCHEME,
    URI_SCHEME_DEPRECATED,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Bus name used when no app id is configured.
pub const CLIENT_NAME: &str = "org.webosports.lunabridge";

/// How long one pump pass waits before re-checking the stop flag.
const PUMP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Invalid bus URI: {0}")]
    InvalidUri(String),

    #[error("Call to {0} failed")]
    CallFailed(String),

    #[error("Call to {uri} returned error {code}: {text}")]
    ErrorReply { uri: String, code: i64, text: String },

    #[error("Event pump failed: {0}")]
    Pump(#[from] tokio::task::JoinError),
}

/// Everything `lunabridge call` needs.
#[derive(Debug, Clone, Default)]
pub struct CallRequest {
    pub uri: String,
    pub payload: String,
    pub app_id: Option<String>,
    pub session: Option<String>,
    pub timeout: Option<Duration>,
    pub retry: Option<u32>,
    pub spread: bool,
}

/// Split `luna://service/method` into `("luna://service", "/method")`.
///
/// A missing scheme means `luna://`.
pub fn split_uri(uri: &str) -> Result<(String, String), ClientError> {
    let (scheme, rest) = if let Some(rest) = uri.strip_prefix(URI_SCHEME) {
        (URI_SCHEME, rest)
    } else if let Some(rest) = uri.strip_prefix(URI_SCHEME_DEPRECATED) {
        (URI_SCHEME_DEPRECATED, rest)
    } else {
        (URI_SCHEME, uri)
    };

    match rest.find('/') {
        Some(slash) if slash > 0 && slash + 1 < rest.len() => {
            let (name, method) = rest.split_at(slash);
            Ok((format!("{}{}", scheme, name), method.to_string()))
        }
        _ => Err(ClientError::InvalidUri(uri.to_string())),
    }
}

fn manager(config: &Config) -> ServiceManager {
    let connector = Arc::new(UnixBusConnector::new(config.socket_path()));
    ServiceManager::new(connector, config.spread_delay())
}

/// Run `pump` on a blocking task until it finishes or Ctrl-C arrives.
async fn run_pump<T, F>(pump: F) -> Result<T, ClientError>
where
    T: Send + 'static,
    F: FnOnce(Arc<AtomicBool>) -> Result<T, ClientError> + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let mut task = tokio::task::spawn_blocking({
        let stop = stop.clone();
        move || pump(stop)
    });

    tokio::select! {
        result = &mut task => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            stop.store(true, Ordering::SeqCst);
            task.await?
        }
    }
}

/// Place one call and print every reply payload on stdout.
///
/// One-shot calls end after their reply; subscriptions run until Ctrl-C.
/// Returns the number of replies printed.
pub async fn call(config: Config, request: CallRequest) -> Result<usize, ClientError> {
    let (service_name, method) = split_uri(&request.uri)?;
    run_pump(move |stop| call_blocking(&config, &request, &service_name, &method, &stop)).await
}

fn call_blocking(
    config: &Config,
    request: &CallRequest,
    service_name: &str,
    method: &str,
    stop: &AtomicBool,
) -> Result<usize, ClientError> {
    let identity = match &request.app_id {
        Some(app_id) => ClientIdentity::application(app_id.clone()),
        None => config.identity(CLIENT_NAME),
    };
    let (mut service, events) = GenericService::new(identity);
    let base = service.service_mut();
    base.set_spread_events(request.spread);
    base.set_retry_attempts(request.retry.unwrap_or(config.calls.retry_attempts));
    base.set_session_id(request.session.as_deref());

    let mut manager = manager(config);
    let id = manager.attach(Box::new(service));
    let timeout = request.timeout.or_else(|| config.call_timeout());
    let retry = request.retry.is_some();

    let token = manager
        .with_listener::<GenericService, _>(id, |service, bus| {
            let base = service.service();
            if retry {
                let token = base.call_with_retry(bus, service_name, method, &request.payload);
                if let (true, Some(timeout)) = (token.is_valid(), timeout) {
                    bus.set_timeout(base.identity(), token, timeout);
                }
                token
            } else {
                base.call(bus, service_name, method, &request.payload, timeout, None)
            }
        })
        .unwrap_or(Token::INVALID);
    if !token.is_valid() {
        manager.shutdown();
        return Err(ClientError::CallFailed(request.uri.clone()));
    }
    debug!("Called {} with token {}", request.uri, token);

    let subscription = service::is_subscription(&request.payload);
    let result = print_replies(&mut manager, id, &events, subscription, stop, &request.uri);
    manager.shutdown();
    result
}

fn print_replies(
    manager: &mut ServiceManager,
    id: ListenerId,
    events: &Receiver<ServiceEvent>,
    subscription: bool,
    stop: &AtomicBool,
    uri: &str,
) -> Result<usize, ClientError> {
    let mut printed = 0;
    let mut failure = None;
    let mut answered = false;

    while !stop.load(Ordering::SeqCst) {
        manager.wait_events(PUMP_INTERVAL);
        for event in events.try_iter() {
            match event {
                ServiceEvent::Response { payload, .. } => {
                    println!("{}", payload);
                    printed += 1;
                    answered = true;
                }
                ServiceEvent::Error { code, text, .. } => {
                    warn!("{} replied with error {}: {}", uri, code, text);
                    failure = Some((code, text));
                    answered = true;
                }
                _ => {}
            }
        }

        if subscription {
            continue;
        }
        // A spread reply leaves the live-call map before it reaches us.
        let settled = manager.live_tokens(id).is_empty() && manager.pending_spread(id) == 0;
        if answered || settled {
            break;
        }
    }

    match failure {
        Some((code, text)) if !subscription => Err(ClientError::ErrorReply {
            uri: uri.to_string(),
            code,
            text,
        }),
        _ => Ok(printed),
    }
}

/// Print a line each time `service_name` connects or disconnects.
pub async fn watch(config: Config, service_name: String) -> Result<(), ClientError> {
    run_pump(move |stop| watch_blocking(&config, &service_name, &stop)).await
}

fn watch_blocking(config: &Config, service_name: &str, stop: &AtomicBool) -> Result<(), ClientError> {
    let (service, events) = GenericService::new(config.identity(CLIENT_NAME));
    let mut manager = manager(config);
    let id = manager.attach(Box::new(service));

    let token = manager
        .with_listener::<GenericService, _>(id, |service, bus| {
            service
                .service()
                .register_server_status(bus, service_name, false)
        })
        .unwrap_or(Token::INVALID);
    if !token.is_valid() {
        manager.shutdown();
        return Err(ClientError::CallFailed(service_name.to_string()));
    }

    let mut connected = None;
    while !stop.load(Ordering::SeqCst) {
        manager.wait_events(PUMP_INTERVAL);
        for event in events.try_iter() {
            let ServiceEvent::Response { payload, .. } = event else {
                continue;
            };
            let Some(status) = server_status(&parse_object(&payload), service_name) else {
                continue;
            };
            if connected != Some(status) {
                connected = Some(status);
                let state = if status { "connected" } else { "disconnected" };
                println!("{} {}", service_name, state);
            }
        }
    }

    manager.shutdown();
    Ok(())
}
