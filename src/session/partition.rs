//! Queue partitioning.
//!
//! Spreads work over `K` independent queues so producers for different entities do
//! not contend on one lock. An entity id always maps to the same shard
//! (`id.rem_euclid(K)`), which keeps per-entity ordering while `K` consumers drain
//! the shards in parallel.

use crate::core::packet::SessionId;
use crate::error::{NetworkError, Result};
use crate::session::queue::PacketQueue;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Queues that can be emptied in place.
pub trait ClearableQueue {
    fn clear(&self);
}

impl ClearableQueue for PacketQueue {
    fn clear(&self) {
        PacketQueue::clear(self);
    }
}

#[derive(Debug)]
pub struct QueuePartitionManager<Q> {
    queues: Vec<Q>,
}

impl<Q> QueuePartitionManager<Q> {
    /// Build `size` queues, each from a fresh call to `supplier`.
    pub fn new<F>(size: usize, mut supplier: F) -> Result<Self>
    where
        F: FnMut() -> Q,
    {
        if size == 0 {
            return Err(NetworkError::ConfigError(
                "queue partition size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            queues: (0..size).map(|_| supplier()).collect(),
        })
    }

    /// The shard owning `element_id`. Negative ids wrap like a floored modulo.
    pub fn queue_by_element_id(&self, element_id: i64) -> &Q {
        &self.queues[self.index_of(element_id)]
    }

    pub fn index_of(&self, element_id: i64) -> usize {
        element_id.rem_euclid(self.queues.len() as i64) as usize
    }

    pub fn queue_by_index(&self, index: usize) -> Option<&Q> {
        self.queues.get(index)
    }

    pub fn size(&self) -> usize {
        self.queues.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Q> {
        self.queues.iter()
    }
}

impl<Q: ClearableQueue> QueuePartitionManager<Q> {
    pub fn clear(&self) {
        for queue in &self.queues {
            queue.clear();
        }
    }
}

/// Writer-side work list: ids of sessions with output waiting.
///
/// Producers push and notify; the single consumer of a shard awaits [`TicketQueue::next`].
#[derive(Debug, Default)]
pub struct TicketQueue {
    tickets: Mutex<VecDeque<SessionId>>,
    notify: Notify,
}

impl TicketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, session: SessionId) {
        if let Ok(mut tickets) = self.tickets.lock() {
            tickets.push_back(session);
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<SessionId> {
        self.tickets.lock().ok().and_then(|mut t| t.pop_front())
    }

    /// Wait for the next ticket.
    pub async fn next(&self) -> SessionId {
        loop {
            if let Some(session) = self.try_pop() {
                return session;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.tickets.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClearableQueue for TicketQueue {
    fn clear(&self) {
        if let Ok(mut tickets) = self.tickets.lock() {
            tickets.clear();
        }
    }
}
