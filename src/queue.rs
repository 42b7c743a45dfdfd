//! At-least-once work queues with visibility timeouts and a dead-letter list.
//!
//! Used for the flush queue (dirty markers) and for each ingest job's tile
//! task queue.

use crate::error::{Result, SpatialError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// A received message. The body stays invisible to other receivers until the
/// receipt is acked, nacked, or the visibility timeout lapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery<T> {
    pub receipt: Uuid,
    pub body: T,
    /// Number of times this body has been delivered, including this one
    pub attempts: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub pending: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

impl QueueDepth {
    /// Pending plus in-flight: work that has not been acknowledged yet.
    pub fn outstanding(&self) -> usize {
        self.pending + self.in_flight
    }
}

#[async_trait]
pub trait WorkQueue<T: Send + 'static>: Send + Sync {
    async fn send_batch(&self, bodies: Vec<T>) -> Result<()>;

    async fn send(&self, body: T) -> Result<()> {
        self.send_batch(vec![body]).await
    }

    /// Next visible message, if any.
    async fn receive(&self) -> Result<Option<Delivery<T>>>;

    /// Remove a delivered message. Returns false for an unknown or expired
    /// receipt.
    async fn ack(&self, receipt: Uuid) -> Result<bool>;

    /// Return a delivered message to the queue, visible again after `delay`.
    async fn nack(&self, receipt: Uuid, delay: Duration) -> Result<bool>;

    /// Move a delivered message to the dead-letter list.
    async fn dead_letter(&self, receipt: Uuid) -> Result<bool>;

    async fn depth(&self) -> Result<QueueDepth>;

    /// Drop every pending and in-flight message; returns how many were dropped.
    async fn purge(&self) -> Result<usize>;

    /// Move every dead-lettered message back to pending with a fresh attempt
    /// count.
    async fn redrive_dead_letters(&self) -> Result<usize>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message<T> {
    body: T,
    attempts: u32,
    visible_at: DateTime<Utc>,
}

struct QueueState<T> {
    pending: VecDeque<Message<T>>,
    in_flight: HashMap<Uuid, Message<T>>,
    dead: Vec<T>,
}

/// On-disk form of a queue
#[derive(Serialize, Deserialize)]
struct QueueSnapshot<T> {
    pending: Vec<Message<T>>,
    dead: Vec<T>,
}

impl<T> Default for QueueState<T> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            dead: Vec::new(),
        }
    }
}

impl<T> QueueState<T> {
    /// Return in-flight messages whose visibility window has lapsed.
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, message)| message.visible_at <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some(message) = self.in_flight.remove(&receipt) {
                self.pending.push_back(message);
            }
        }
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// In-process [`WorkQueue`]
pub struct MemoryQueue<T> {
    state: Mutex<QueueState<T>>,
    visibility_timeout: Duration,
    offline: AtomicBool,
}

impl<T> MemoryQueue<T> {
    /// Create an empty queue; received messages stay hidden for `visibility_timeout`
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            visibility_timeout,
            offline: AtomicBool::new(false),
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// While offline every call fails with `StoreUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SpatialError::unavailable("work queue", "queue offline"));
        }
        Ok(())
    }
}

impl<T: Clone> MemoryQueue<T> {
    /// Bodies on the dead-letter list.
    pub fn dead_letters(&self) -> Vec<T> {
        self.state.lock().dead.clone()
    }
}

impl<T: Serialize + DeserializeOwned + Clone> MemoryQueue<T> {
    /// Persist the queue as JSON. In-flight messages are written as pending,
    /// so a reload redelivers them.
    pub async fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = {
            let state = self.state.lock();
            let mut pending: Vec<Message<T>> = state.in_flight.values().cloned().collect();
            pending.extend(state.pending.iter().cloned());
            QueueSnapshot {
                pending,
                dead: state.dead.clone(),
            }
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Replace the queue contents with a snapshot written by `save_to_path`.
    pub async fn load_from_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = tokio::fs::read(path).await?;
        let snapshot: QueueSnapshot<T> = serde_json::from_slice(&raw)?;
        *self.state.lock() = QueueState {
            pending: snapshot.pending.into(),
            in_flight: HashMap::new(),
            dead: snapshot.dead,
        };
        Ok(())
    }
}

#[async_trait]
impl<T> WorkQueue<T> for MemoryQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn send_batch(&self, bodies: Vec<T>) -> Result<()> {
        self.check_online()?;
        let now = Utc::now();
        let mut state = self.state.lock();
        state.pending.extend(bodies.into_iter().map(|body| Message {
            body,
            attempts: 0,
            visible_at: now,
        }));
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery<T>>> {
        self.check_online()?;
        let now = Utc::now();
        let mut state = self.state.lock();
        state.reclaim_expired(now);

        let Some(position) = state.pending.iter().position(|m| m.visible_at <= now) else {
            return Ok(None);
        };
        let Some(mut message) = state.pending.remove(position) else {
            return Ok(None);
        };
        message.attempts += 1;
        message.visible_at = after(now, self.visibility_timeout);

        let receipt = Uuid::new_v4();
        let delivery = Delivery {
            receipt,
            body: message.body.clone(),
            attempts: message.attempts,
        };
        state.in_flight.insert(receipt, message);
        Ok(Some(delivery))
    }

    async fn ack(&self, receipt: Uuid) -> Result<bool> {
        self.check_online()?;
        Ok(self.state.lock().in_flight.remove(&receipt).is_some())
    }

    async fn nack(&self, receipt: Uuid, delay: Duration) -> Result<bool> {
        self.check_online()?;
        let mut state = self.state.lock();
        match state.in_flight.remove(&receipt) {
            Some(mut message) => {
                message.visible_at = after(Utc::now(), delay);
                state.pending.push_back(message);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn dead_letter(&self, receipt: Uuid) -> Result<bool> {
        self.check_online()?;
        let mut state = self.state.lock();
        match state.in_flight.remove(&receipt) {
            Some(message) => {
                state.dead.push(message.body);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn depth(&self) -> Result<QueueDepth> {
        self.check_online()?;
        let state = self.state.lock();
        Ok(QueueDepth {
            pending: state.pending.len(),
            in_flight: state.in_flight.len(),
            dead_lettered: state.dead.len(),
        })
    }

    async fn purge(&self) -> Result<usize> {
        self.check_online()?;
        let mut state = self.state.lock();
        let dropped = state.pending.len() + state.in_flight.len();
        state.pending.clear();
        state.in_flight.clear();
        Ok(dropped)
    }

    async fn redrive_dead_letters(&self) -> Result<usize> {
        self.check_online()?;
        let now = Utc::now();
        let mut state = self.state.lock();
        let dead = std::mem::take(&mut state.dead);
        let count = dead.len();
        state.pending.extend(dead.into_iter().map(|body| Message {
            body,
            attempts: 0,
            visible_at: now,
        }));
        Ok(count)
    }
}
