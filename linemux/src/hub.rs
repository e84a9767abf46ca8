//! Broadcast registry behind the `split` service.
//!
//! A [`Hub`] maps subscriber ids to bounded delivery channels. Every mutation of
//! the membership map and of the closed flag happens under a single mutex, and
//! [`Hub::send`] holds that mutex for the whole fan-out, so all subscribers see
//! lines in one total order and never observe a half-updated membership set.

use std::{collections::HashMap, fmt::Debug, hash::Hash, time::Duration};

use thiserror::Error;
use tokio::sync::{
    Mutex,
    mpsc::{self, error::SendTimeoutError},
};
use tracing::{debug, warn};

use crate::line::Line;

/// Misuse of a [`Hub`]. These indicate a caller bug, not a transient failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    #[error("hub is already closed")]
    AlreadyClosed,
    #[error("subscriber is not registered")]
    UnknownSubscriber,
    #[error("subscriber is already registered")]
    DuplicateSubscriber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubOptions {
    /// Lines buffered per subscriber before `send` has to wait on it.
    pub queue_depth: usize,
    /// How long `send` waits on a full subscriber before evicting it.
    pub send_timeout: Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            send_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Hub<K> {
    state: Mutex<HubState<K>>,
    options: HubOptions,
}

struct HubState<K> {
    members: HashMap<K, mpsc::Sender<Line>>,
    closed: bool,
}

impl<K> HubState<K> {
    fn ensure_open(&self) -> Result<(), HubError> {
        if self.closed {
            return Err(HubError::AlreadyClosed);
        }
        Ok(())
    }
}

impl<K> Hub<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new(options: HubOptions) -> Self {
        Self {
            state: Mutex::new(HubState {
                members: HashMap::new(),
                closed: false,
            }),
            options,
        }
    }

    /// Registers `id` and returns the channel that carries every line sent from
    /// now on. The channel ends when the subscriber leaves, is evicted, or the
    /// hub closes.
    pub async fn join(&self, id: K) -> Result<mpsc::Receiver<Line>, HubError> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        if state.members.contains_key(&id) {
            return Err(HubError::DuplicateSubscriber);
        }

        let (tx, rx) = mpsc::channel(self.options.queue_depth.max(1));
        state.members.insert(id.clone(), tx);
        debug!(subscriber = ?id, members = state.members.len(), "subscriber joined");
        Ok(rx)
    }

    /// Unregisters `id`, closing its channel. Lines already queued are still
    /// delivered to the receiver before it sees the end of the stream.
    pub async fn leave(&self, id: &K) -> Result<(), HubError> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        match state.members.remove(id) {
            Some(_closed) => {
                debug!(subscriber = ?id, members = state.members.len(), "subscriber left");
                Ok(())
            }
            None => Err(HubError::UnknownSubscriber),
        }
    }

    /// Delivers `line` to every registered subscriber and returns how many took
    /// it. Subscribers that stay full for longer than the send timeout, or whose
    /// receiver is gone, are evicted.
    pub async fn send(&self, line: Line) -> Result<usize, HubError> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let mut evicted = Vec::new();
        for (id, tx) in &state.members {
            match tx.send_timeout(line.clone(), self.options.send_timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(
                        subscriber = ?id,
                        timeout = ?self.options.send_timeout,
                        "subscriber is not keeping up; evicting"
                    );
                    evicted.push(id.clone());
                }
                Err(SendTimeoutError::Closed(_)) => {
                    debug!(subscriber = ?id, "subscriber receiver dropped; evicting");
                    evicted.push(id.clone());
                }
            }
        }

        for id in &evicted {
            state.members.remove(id);
        }
        Ok(state.members.len())
    }

    /// Marks the hub closed and closes every remaining subscriber. Returns how
    /// many subscribers were still registered.
    pub async fn close(&self) -> Result<usize, HubError> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state.closed = true;

        let remaining = state.members.len();
        state.members.clear();
        debug!(remaining, "hub closed");
        Ok(remaining)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.members.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}
