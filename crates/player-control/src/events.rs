//! Cross-thread event delivery between status monitors and the session.
//!
//! Status monitors run on background threads and must notify the owning
//! session without the session polling player state itself. The bridge is an
//! unbounded channel: monitors push typed events through an [`EventEmitter`],
//! the session registers handlers on the [`EventBridge`] and drains the queue
//! from its own thread.
//!
//! Delivery discipline: handlers are invoked once per event, in emission
//! order, **on the thread that calls [`EventBridge::dispatch_pending`] or
//! [`EventBridge::dispatch_wait`]** — never on a monitor thread. Handlers may
//! therefore call back into the backend (e.g. `load` the next track, which
//! joins the monitor thread) without deadlocking.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};

/// A playback event emitted by a status monitor.
///
/// Events carry no payload; the session correlates them with the track it
/// currently has loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    /// The current track finished playing.
    SongEnded,
    /// Elapsed playback time crossed the report threshold.
    ReportThreshold,
}

/// Sending half handed to status monitors.
#[derive(Clone)]
pub struct EventEmitter {
    tx: Sender<PlayerEvent>,
}

impl EventEmitter {
    /// Push an event to the session. Dropped silently if the session side is
    /// gone (the monitor is about to be stopped anyway).
    pub fn emit(&self, event: PlayerEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!(?event, "event dropped, bridge receiver gone");
        }
    }
}

type EventHandler = Box<dyn FnMut(PlayerEvent) + Send>;

/// Session-owned side of the bridge: the event queue plus registered
/// handlers.
pub struct EventBridge {
    tx: Sender<PlayerEvent>,
    rx: Receiver<PlayerEvent>,
    handlers: Vec<EventHandler>,
}

impl EventBridge {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            handlers: Vec::new(),
        }
    }

    /// Emitter handle for a backend / status monitor.
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            tx: self.tx.clone(),
        }
    }

    /// Register a handler. All registered handlers run for every event, in
    /// registration order.
    pub fn on_event<F>(&mut self, handler: F)
    where
        F: FnMut(PlayerEvent) + Send + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Run handlers for every queued event. Returns the number of events
    /// dispatched.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.rx.try_recv() {
            for handler in &mut self.handlers {
                handler(event);
            }
            count += 1;
        }
        count
    }

    /// Wait up to `timeout` for the first event, then drain everything that
    /// is queued. Returns the number of events dispatched.
    pub fn dispatch_wait(&mut self, timeout: Duration) -> usize {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => {
                for handler in &mut self.handlers {
                    handler(event);
                }
                1 + self.dispatch_pending()
            }
            Err(_) => 0,
        }
    }
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new()
    }
}
