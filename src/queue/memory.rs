//! In-memory queue for single-process deployments and tests.
//!
//! Mirrors the Redis layout: per-tier FIFO partitions, a leased set with
//! visibility deadlines, and a dead-letter list. Reaping takes an explicit
//! `now` so lease expiry is deterministic under test.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{QueueError, QueueMessage, QueueSnapshot, ReapOutcome, RenderQueue, WeightedCycle};
use crate::models::job::Tier;

#[derive(Default)]
struct Inner {
    pending: HashMap<Tier, VecDeque<QueueMessage>>,
    leased: Vec<QueueMessage>,
    dead: Vec<QueueMessage>,
}

pub struct MemoryQueue {
    inner: Mutex<Inner>,
    cycle: WeightedCycle,
    visibility_timeout: chrono::Duration,
    max_deliveries: u32,
}

impl MemoryQueue {
    pub fn new(
        weights: &[(Tier, u32)],
        visibility_timeout_secs: u64,
        max_deliveries: u32,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            cycle: WeightedCycle::new(weights),
            visibility_timeout: chrono::Duration::seconds(visibility_timeout_secs as i64),
            max_deliveries,
        }
    }

    /// Dead-lettered messages, oldest first.
    pub async fn dead_letters(&self) -> Vec<QueueMessage> {
        self.inner.lock().await.dead.clone()
    }
}

#[async_trait]
impl RenderQueue for MemoryQueue {
    async fn enqueue(&self, msg: QueueMessage) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.pending.entry(msg.tier).or_default().push_back(msg);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<QueueMessage>, QueueError> {
        let mut inner = self.inner.lock().await;
        for tier in self.cycle.candidates() {
            let popped = inner.pending.get_mut(&tier).and_then(|p| p.pop_front());
            if let Some(mut msg) = popped {
                msg.visibility_deadline = Some(Utc::now() + self.visibility_timeout);
                inner.leased.push(msg.clone());
                self.cycle.advance();
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    async fn ack(&self, msg: &QueueMessage) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        if let Some(pos) = inner
            .leased
            .iter()
            .position(|m| m.job_id == msg.job_id && m.delivery_count == msg.delivery_count)
        {
            inner.leased.remove(pos);
        }
        Ok(())
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<ReapOutcome, QueueError> {
        let mut inner = self.inner.lock().await;
        let mut outcome = ReapOutcome::default();

        let leased = std::mem::take(&mut inner.leased);
        let (expired, alive): (Vec<_>, Vec<_>) = leased
            .into_iter()
            .partition(|m| m.visibility_deadline.is_some_and(|d| d <= now));
        inner.leased = alive;

        for mut msg in expired {
            msg.delivery_count += 1;
            msg.visibility_deadline = None;
            if msg.delivery_count > self.max_deliveries {
                inner.dead.push(msg.clone());
                outcome.dead_lettered.push(msg);
            } else {
                inner
                    .pending
                    .entry(msg.tier)
                    .or_default()
                    .push_back(msg.clone());
                outcome.redelivered.push(msg);
            }
        }

        Ok(outcome)
    }

    async fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        let inner = self.inner.lock().await;
        let now = Utc::now();

        let mut depth = 0u64;
        let mut per_tier = HashMap::new();
        let mut oldest: Option<DateTime<Utc>> = None;

        for tier in Tier::ALL {
            let len = inner.pending.get(&tier).map_or(0, |p| p.len()) as u64;
            depth += len;
            per_tier.insert(tier.to_string(), len);

            if let Some(front) = inner.pending.get(&tier).and_then(|p| p.front()) {
                oldest = Some(match oldest {
                    Some(t) if t <= front.enqueue_time => t,
                    _ => front.enqueue_time,
                });
            }
        }

        Ok(QueueSnapshot {
            depth,
            oldest_enqueue_age_secs: oldest.map(|t| (now - t).num_seconds()),
            in_flight: inner.leased.len() as u64,
            per_tier,
        })
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
