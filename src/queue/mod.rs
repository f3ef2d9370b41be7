//! Tier-partitioned job queue with at-least-once delivery.
//!
//! Messages are partitioned by tier and dequeued under a visibility-timeout
//! lease: a dequeued message stays invisible to other consumers until its
//! deadline, then the reaper makes it deliverable again. Delivery order is
//! weighted round-robin across tier partitions; FIFO is best-effort within a
//! partition only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::Tier;

pub mod memory;
pub mod redis;

pub use memory::MemoryQueue;
pub use redis::RedisQueue;

/// Transient wrapper carrying a job id through the queue.
///
/// `visibility_deadline` is lease bookkeeping assigned at dequeue; it is not
/// part of the wire payload, which must stay byte-stable between dequeue and
/// acknowledge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueMessage {
    pub job_id: Uuid,
    pub tier: Tier,
    pub enqueue_time: DateTime<Utc>,
    /// Number of redeliveries so far; 0 on first delivery.
    pub delivery_count: u32,
    #[serde(skip)]
    pub visibility_deadline: Option<DateTime<Utc>>,
}

impl QueueMessage {
    pub fn new(job_id: Uuid, tier: Tier) -> Self {
        Self {
            job_id,
            tier,
            enqueue_time: Utc::now(),
            delivery_count: 0,
            visibility_deadline: None,
        }
    }
}

/// Messages surfaced by one reaper cycle.
#[derive(Debug, Default)]
pub struct ReapOutcome {
    /// Lease expired, message returned to its tier partition.
    pub redelivered: Vec<QueueMessage>,
    /// Delivery budget exhausted, message routed to the dead-letter list.
    pub dead_lettered: Vec<QueueMessage>,
}

/// Eventually-consistent queue snapshot for the admin endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub depth: u64,
    pub oldest_enqueue_age_secs: Option<i64>,
    pub in_flight: u64,
    pub per_tier: HashMap<String, u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[async_trait]
pub trait RenderQueue: Send + Sync {
    async fn enqueue(&self, msg: QueueMessage) -> Result<(), QueueError>;

    /// Pop one message under a visibility lease, preferring higher-weighted
    /// tiers. Non-blocking; callers poll at their idle interval.
    async fn dequeue(&self) -> Result<Option<QueueMessage>, QueueError>;

    /// Settle a delivered message, dropping its lease.
    async fn ack(&self, msg: &QueueMessage) -> Result<(), QueueError>;

    /// Redeliver messages whose lease expired before `now`, dead-lettering
    /// those past the delivery budget.
    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<ReapOutcome, QueueError>;

    async fn snapshot(&self) -> Result<QueueSnapshot, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

/// Weighted round-robin tier selector.
///
/// Weights expand into a slot cycle (weight 4 = four slots); each dequeue
/// scans candidate tiers starting at the cursor slot and advances by one on
/// success. Over a full cycle of `sum(weights)` dequeues under backlog, each
/// tier's partition is served `weight` times and leads the scan at least
/// once, which is the starvation bound.
pub struct WeightedCycle {
    slots: Vec<Tier>,
    cursor: AtomicUsize,
}

impl WeightedCycle {
    /// Build from `(tier, weight)` pairs, highest priority first. A zero
    /// weight is bumped to one so no tier can be configured out of service.
    pub fn new(weights: &[(Tier, u32)]) -> Self {
        let mut slots = Vec::new();
        for &(tier, weight) in weights {
            for _ in 0..weight.max(1) {
                slots.push(tier);
            }
        }
        Self {
            slots,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Unique tiers in slot order starting from the cursor.
    pub fn candidates(&self) -> Vec<Tier> {
        let start = self.cursor.load(Ordering::Relaxed) % self.slots.len();
        let mut seen = Vec::with_capacity(Tier::ALL.len());
        for i in 0..self.slots.len() {
            let tier = self.slots[(start + i) % self.slots.len()];
            if !seen.contains(&tier) {
                seen.push(tier);
            }
        }
        seen
    }

    /// Consume one slot after a successful dequeue.
    pub fn advance(&self) {
        self.cursor.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_weight_tier_leads_the_scan() {
        let cycle = WeightedCycle::new(&[(Tier::Enterprise, 3), (Tier::Free, 1)]);
        assert_eq!(cycle.candidates()[0], Tier::Enterprise);
    }

    #[test]
    fn every_tier_leads_once_per_cycle() {
        let cycle = WeightedCycle::new(&[(Tier::Enterprise, 3), (Tier::Pro, 2), (Tier::Free, 1)]);
        let mut leaders = Vec::new();
        for _ in 0..6 {
            leaders.push(cycle.candidates()[0]);
            cycle.advance();
        }
        assert_eq!(
            leaders.iter().filter(|&&t| t == Tier::Enterprise).count(),
            3
        );
        assert_eq!(leaders.iter().filter(|&&t| t == Tier::Pro).count(), 2);
        assert_eq!(leaders.iter().filter(|&&t| t == Tier::Free).count(), 1);
    }

    #[test]
    fn zero_weight_still_gets_a_slot() {
        let cycle = WeightedCycle::new(&[(Tier::Enterprise, 2), (Tier::Free, 0)]);
        let mut leaders = Vec::new();
        for _ in 0..3 {
            leaders.push(cycle.candidates()[0]);
            cycle.advance();
        }
        assert!(leaders.contains(&Tier::Free));
    }
}
