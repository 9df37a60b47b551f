//! Paced delivery of responses.
//!
//! Listeners in spread mode do not get their replies synchronously. Replies
//! go into one global FIFO drained by a worker thread, which hands them back
//! to the host loop one at a time and waits for the loop to acknowledge each
//! delivery before moving on. An optional delay after each acknowledgement
//! throttles the whole system.
//!
//! The acknowledgement is a rendezvous channel per delivery. Removing the
//! listener whose delivery is in flight drops the sending half, which wakes
//! the worker.

use crate::bus::{lock, BusEvent, CallContext, EventSender, SpreadResponse};
use std::collections::{HashSet, VecDeque};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Default)]
struct State {
    queue: VecDeque<SpreadResponse>,
    /// Listeners with queued deliveries that have not been removed.
    tracked: HashSet<CallContext>,
    /// Listener whose delivery awaits acknowledgement.
    awaiting: Option<(CallContext, SyncSender<()>)>,
    running: bool,
    stopping: bool,
}

/// Single-worker response pacer.
pub struct ResponseSpreader {
    state: Arc<Mutex<State>>,
    events: EventSender,
    post_delay: Duration,
    worker: Option<JoinHandle<()>>,
}

impl ResponseSpreader {
    pub fn new(events: EventSender, post_delay: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            events,
            post_delay,
            worker: None,
        }
    }

    pub fn post_delay(&self) -> Duration {
        self.post_delay
    }

    /// Queue a response and make sure the worker is running.
    pub fn enqueue(&mut self, response: SpreadResponse) {
        let start = {
            let mut state = lock(&self.state);
            if state.stopping {
                warn!("Response spreader is stopped, dropping {}", response.method);
                return;
            }
            state.tracked.insert(response.listener);
            state.queue.push_back(response);
            !std::mem::replace(&mut state.running, true)
        };

        if start {
            self.spawn_worker();
        }
    }

    /// The host loop finished handling the in-flight delivery for `listener`.
    pub fn acknowledge(&self, listener: CallContext) {
        let mut state = lock(&self.state);
        let matches = matches!(&state.awaiting, Some((awaiting, _)) if *awaiting == listener);
        if matches {
            if let Some((_, ack)) = state.awaiting.take() {
                let _ = ack.send(());
            }
        }
    }

    /// Stop delivering to `listener`, releasing the worker if it waits on it.
    pub fn remove_listener(&self, listener: CallContext) {
        let mut state = lock(&self.state);
        state.tracked.remove(&listener);
        let matches = matches!(&state.awaiting, Some((awaiting, _)) if *awaiting == listener);
        if matches {
            state.awaiting = None;
            debug!("Released in-flight spread delivery for removed listener");
        }
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Deliveries still owed to `listener`, the in-flight one included.
    pub fn pending_for(&self, listener: CallContext) -> usize {
        let state = lock(&self.state);
        let in_flight = matches!(&state.awaiting, Some((awaiting, _)) if *awaiting == listener);
        if !state.tracked.contains(&listener) {
            return usize::from(in_flight);
        }
        let queued = state
            .queue
            .iter()
            .filter(|response| response.listener == listener)
            .count();
        queued + usize::from(in_flight)
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        lock(&self.state).tracked.len()
    }

    /// Drop everything queued and join the worker.
    pub fn shutdown(&mut self) {
        {
            let mut state = lock(&self.state);
            state.stopping = true;
            state.queue.clear();
            state.tracked.clear();
            state.awaiting = None;
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Response spreader worker panicked");
            }
        }
    }

    fn spawn_worker(&mut self) {
        if let Some(previous) = self.worker.take() {
            // The previous worker already cleared `running`; it is exiting.
            let _ = previous.join();
        }

        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let post_delay = self.post_delay;
        let spawned = thread::Builder::new()
            .name("response-spreader".into())
            .spawn(move || run_worker(state, events, post_delay));

        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => {
                warn!("Failed to start response spreader: {}", e);
                lock(&self.state).running = false;
            }
        }
    }
}

impl Drop for ResponseSpreader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(state: Arc<Mutex<State>>, events: EventSender, post_delay: Duration) {
    debug!("Response spreader started");
    loop {
        let (response, ack) = {
            let mut guard = lock(&state);
            if guard.stopping {
                guard.running = false;
                return;
            }
            let Some(response) = guard.queue.pop_front() else {
                guard.running = false;
                debug!("Response spreader idle");
                return;
            };
            if !guard.tracked.contains(&response.listener) {
                debug!("Skipping spread response for removed listener: {}", response.method);
                continue;
            }
            if !guard.queue.iter().any(|queued| queued.listener == response.listener) {
                guard.tracked.remove(&response.listener);
            }
            let (tx, rx) = mpsc::sync_channel(1);
            guard.awaiting = Some((response.listener, tx));
            (response, rx)
        };

        if events.send(BusEvent::Spread(response)).is_err() {
            info!("Host loop gone, response spreader exiting");
            let mut guard = lock(&state);
            guard.awaiting = None;
            guard.running = false;
            return;
        }

        // Err means the listener was removed or the spreader shut down.
        let _ = ack.recv();

        if !post_delay.is_zero() {
            thread::sleep(post_delay);
        }
    }
}
