//! # Packet Queue
//!
//! Bounded outbound buffer owned by exactly one session.
//!
//! Every `put` consults a [`PacketQueuePolicy`] before inserting, which lets the
//! queue shed low-priority traffic as it fills up instead of growing without bound.
//! A queue that is already at capacity rejects everything with
//! [`PacketQueueError::Full`], whatever the policy says.
//!
//! Packets leave in insertion order, so one session's outbound stream is never
//! reordered (rejected packets simply never enter).
//!
//! ## Default Policy
//! | usage            | accepted priorities     |
//! |------------------|-------------------------|
//! | below 75%        | all                     |
//! | 75% up to 90%    | `Normal` and above      |
//! | 90% and above    | `Guaranteed` only       |

use crate::core::packet::{Packet, PacketPriority};
use crate::error::PacketQueueError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Fill level handed to the policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueUsage {
    pub size: usize,
    pub max_size: usize,
}

impl QueueUsage {
    pub fn percentage_used(&self) -> f32 {
        if self.max_size == 0 {
            return 100.0;
        }
        self.size as f32 * 100.0 / self.max_size as f32
    }
}

/// Decides whether a packet may enter a queue at its current fill level.
pub trait PacketQueuePolicy: Send + Sync {
    fn apply_policy(&self, usage: QueueUsage, packet: &Packet) -> Result<(), PacketQueueError>;
}

/// Threshold based shedding.
#[derive(Debug, Clone, Copy)]
pub struct DefaultPacketQueuePolicy {
    normal_threshold: f32,
    guaranteed_threshold: f32,
}

impl DefaultPacketQueuePolicy {
    pub const NORMAL_THRESHOLD: f32 = 75.0;
    pub const GUARANTEED_THRESHOLD: f32 = 90.0;

    pub fn new() -> Self {
        Self::with_thresholds(Self::NORMAL_THRESHOLD, Self::GUARANTEED_THRESHOLD)
    }

    /// Custom thresholds in percent. `normal` should not exceed `guaranteed`.
    pub fn with_thresholds(normal: f32, guaranteed: f32) -> Self {
        Self {
            normal_threshold: normal,
            guaranteed_threshold: guaranteed,
        }
    }
}

impl Default for DefaultPacketQueuePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketQueuePolicy for DefaultPacketQueuePolicy {
    fn apply_policy(&self, usage: QueueUsage, packet: &Packet) -> Result<(), PacketQueueError> {
        let percentage_used = usage.percentage_used();
        let minimum = if percentage_used >= self.guaranteed_threshold {
            PacketPriority::Guaranteed
        } else if percentage_used >= self.normal_threshold {
            PacketPriority::Normal
        } else {
            return Ok(());
        };

        if packet.priority() < minimum {
            return Err(PacketQueueError::PolicyViolation {
                priority: packet.priority(),
                percentage_used,
            });
        }
        Ok(())
    }
}

/// Accepts everything until the queue is full.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSheddingPolicy;

impl PacketQueuePolicy for NoSheddingPolicy {
    fn apply_policy(&self, _usage: QueueUsage, _packet: &Packet) -> Result<(), PacketQueueError> {
        Ok(())
    }
}

struct Inner {
    packets: VecDeque<Packet>,
    max_size: usize,
}

pub struct PacketQueue {
    inner: Mutex<Inner>,
    policy: Arc<dyn PacketQueuePolicy>,
}

impl PacketQueue {
    pub fn new(max_size: usize, policy: Arc<dyn PacketQueuePolicy>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                packets: VecDeque::with_capacity(max_size.min(1024)),
                max_size,
            }),
            policy,
        }
    }

    pub fn with_default_policy(max_size: usize) -> Self {
        Self::new(max_size, Arc::new(DefaultPacketQueuePolicy::new()))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the deque half-modified.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Oldest packet, left in place.
    pub fn peek(&self) -> Option<Packet> {
        self.lock().packets.front().cloned()
    }

    /// Remove and return the oldest packet.
    pub fn take(&self) -> Option<Packet> {
        self.lock().packets.pop_front()
    }

    /// Remove up to `max` packets in order.
    pub fn take_batch(&self, max: usize) -> Vec<Packet> {
        let mut inner = self.lock();
        let n = max.min(inner.packets.len());
        inner.packets.drain(..n).collect()
    }

    /// Insert at the back after the capacity check and the policy.
    ///
    /// # Errors
    /// `Full` when at capacity, `PolicyViolation` when the policy sheds the packet.
    pub fn put(&self, packet: Packet) -> Result<(), PacketQueueError> {
        let mut inner = self.lock();
        let usage = QueueUsage {
            size: inner.packets.len(),
            max_size: inner.max_size,
        };
        if usage.size >= usage.max_size {
            return Err(PacketQueueError::Full {
                max_size: usage.max_size,
            });
        }
        self.policy.apply_policy(usage, &packet)?;
        inner.packets.push_back(packet);
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().packets.is_empty()
    }

    pub fn is_full(&self) -> bool {
        let inner = self.lock();
        inner.packets.len() >= inner.max_size
    }

    pub fn percentage_used(&self) -> f32 {
        let inner = self.lock();
        QueueUsage {
            size: inner.packets.len(),
            max_size: inner.max_size,
        }
        .percentage_used()
    }

    pub fn max_size(&self) -> usize {
        self.lock().max_size
    }

    /// Shrinking below the current size keeps queued packets; new puts fail until it drains.
    pub fn set_max_size(&self, max_size: usize) {
        self.lock().max_size = max_size;
    }

    pub fn clear(&self) {
        self.lock().packets.clear();
    }
}

impl std::fmt::Debug for PacketQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("PacketQueue")
            .field("size", &inner.packets.len())
            .field("max_size", &inner.max_size)
            .finish()
    }
}
