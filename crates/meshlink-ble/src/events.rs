//! Event hubs
//!
//! [`EventHub`] is a live-only broadcast. [`ReplayHub`] additionally keeps
//! every event since it was last reset, so a subscriber that arrives after a
//! link came up still sees its whole history.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use meshlink_core::Luid;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

// ----------------------------------------------------------------------------
// Link Events
// ----------------------------------------------------------------------------

/// Lifecycle events published by the connection state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected { luid: Luid, fragment_size: usize },
    Disconnected { luid: Luid, reason: String },
    Gone { luid: Luid, reason: String },
    ServerStarted,
    ServerStopped,
    TransactionStarted { luid: Luid },
    TransactionFinished { luid: Luid, success: bool },
}

impl LinkEvent {
    /// The peer this event concerns, if any
    pub fn luid(&self) -> Option<Luid> {
        match self {
            LinkEvent::Connected { luid, .. }
            | LinkEvent::Disconnected { luid, .. }
            | LinkEvent::Gone { luid, .. }
            | LinkEvent::TransactionStarted { luid }
            | LinkEvent::TransactionFinished { luid, .. } => Some(*luid),
            LinkEvent::ServerStarted | LinkEvent::ServerStopped => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Live Hub
// ----------------------------------------------------------------------------

/// Live broadcast; subscribers only see events published after subscribing
#[derive(Debug, Clone)]
pub struct EventHub<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventHub<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers, returning how many received it
    pub fn publish(&self, event: T) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    pub fn subscribers(&self) -> usize {
        self.sender.receiver_count()
    }
}

// ----------------------------------------------------------------------------
// Replay Hub
// ----------------------------------------------------------------------------

/// Broadcast that replays its history to new subscribers
#[derive(Debug)]
pub struct ReplayHub<T: Clone> {
    history: Mutex<Vec<T>>,
    sender: broadcast::Sender<T>,
}

impl<T: Clone> ReplayHub<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            history: Mutex::new(Vec::new()),
            sender,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, event: T) {
        // Recording and sending under one lock keeps subscribe() gap-free
        let mut history = self.lock();
        history.push(event.clone());
        let _ = self.sender.send(event);
    }

    /// Subscribe, receiving the full history first
    pub fn subscribe(&self) -> ReplaySubscription<T> {
        let history = self.lock();
        ReplaySubscription {
            backlog: history.iter().cloned().collect(),
            live: self.sender.subscribe(),
        }
    }

    /// Forget the history; existing subscribers are unaffected
    pub fn reset(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Receiver half of a [`ReplayHub`]
#[derive(Debug)]
pub struct ReplaySubscription<T: Clone> {
    backlog: VecDeque<T>,
    live: broadcast::Receiver<T>,
}

impl<T: Clone> ReplaySubscription<T> {
    /// Next event, or `None` once the hub is gone
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.live.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Replay subscriber lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is ready
    pub fn try_recv(&mut self) -> Option<T> {
        self.backlog
            .pop_front()
            .or_else(|| self.live.try_recv().ok())
    }
}
