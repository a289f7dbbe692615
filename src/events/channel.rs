//! Event plumbing over crossbeam-channel.
//!
//! Listeners (the CLI progress bar, audit logs, tests) subscribe through an
//! [`EventReceiver`]. Emitting never blocks a submission: when a bounded
//! channel is full the event is dropped and counted instead.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::Event;

/// Emits cache events; clone freely across submission threads.
#[derive(Clone)]
pub struct EventSender {
    route: Option<Route>,
}

#[derive(Clone)]
struct Route {
    tx: Sender<Event>,
    overflow: Arc<AtomicU64>,
}

impl EventSender {
    /// Hand `event` to the listener, if there still is one.
    pub fn send(&self, event: Event) {
        let Some(route) = &self.route else {
            return;
        };
        match route.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                route.overflow.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::trace!("event listener gone");
            }
        }
    }
}

/// Listening end of an [`EventChannel`]
pub struct EventReceiver {
    rx: Receiver<Event>,
    overflow: Arc<AtomicU64>,
}

impl EventReceiver {
    /// Wait for the next event; `None` once every sender is gone
    pub fn recv(&self) -> Option<Event> {
        self.rx.recv().ok()
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Blocking iterator that ends when the cache (and every sender) is dropped
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.rx.iter()
    }

    /// Everything queued right now, oldest first, without waiting
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }

    /// Events a full bounded channel had to discard so far
    pub fn dropped(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

/// Constructors for sender/receiver pairs
pub struct EventChannel;

impl EventChannel {
    /// Unbounded channel; nothing is ever dropped.
    pub fn new() -> (EventSender, EventReceiver) {
        Self::pair(crossbeam_channel::unbounded())
    }

    /// Holds at most `capacity` undelivered events; later ones are dropped
    /// and show up in [`EventReceiver::dropped`].
    pub fn bounded(capacity: usize) -> (EventSender, EventReceiver) {
        Self::pair(crossbeam_channel::bounded(capacity))
    }

    fn pair((tx, rx): (Sender<Event>, Receiver<Event>)) -> (EventSender, EventReceiver) {
        let overflow = Arc::new(AtomicU64::new(0));
        let sender = EventSender {
            route: Some(Route {
                tx,
                overflow: Arc::clone(&overflow),
            }),
        };
        (sender, EventReceiver { rx, overflow })
    }
}

/// Sender with no listener; every event is discarded without queueing.
pub fn null_sender() -> EventSender {
    EventSender { route: None }
}
