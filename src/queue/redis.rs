//! Redis-backed queue.
//!
//! Layout: one pending list per tier (`render:queue:<tier>`, LPUSH/RPOP so
//! the oldest message sits at the tail), a lease sorted-set
//! (`render:processing`) scored by visibility deadline, and a dead-letter
//! list (`render:dead`). Pop-and-lease is a single Lua script so a crash
//! between the two steps cannot lose a message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;

use super::{QueueError, QueueMessage, QueueSnapshot, ReapOutcome, RenderQueue, WeightedCycle};
use crate::models::job::Tier;

const PROCESSING_KEY: &str = "render:processing";
const DEAD_KEY: &str = "render:dead";

const DEQUEUE_SCRIPT: &str = r#"
local payload = redis.call('RPOP', KEYS[1])
if not payload then
  return false
end
redis.call('ZADD', KEYS[2], ARGV[1], payload)
return payload
"#;

fn tier_key(tier: Tier) -> String {
    format!("render:queue:{tier}")
}

pub struct RedisQueue {
    client: redis::Client,
    cycle: WeightedCycle,
    visibility_timeout: chrono::Duration,
    max_deliveries: u32,
    dequeue_script: redis::Script,
}

impl RedisQueue {
    pub fn new(
        redis_url: &str,
        weights: &[(Tier, u32)],
        visibility_timeout_secs: u64,
        max_deliveries: u32,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            cycle: WeightedCycle::new(weights),
            visibility_timeout: chrono::Duration::seconds(visibility_timeout_secs as i64),
            max_deliveries,
            dequeue_script: redis::Script::new(DEQUEUE_SCRIPT),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }
}

#[async_trait]
impl RenderQueue for RedisQueue {
    async fn enqueue(&self, msg: QueueMessage) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(&msg).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(tier_key(msg.tier), &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<QueueMessage>, QueueError> {
        let mut conn = self.conn().await?;
        let deadline = Utc::now() + self.visibility_timeout;

        for tier in self.cycle.candidates() {
            let raw: Option<String> = self
                .dequeue_script
                .key(tier_key(tier))
                .key(PROCESSING_KEY)
                .arg(deadline.timestamp())
                .invoke_async(&mut conn)
                .await
                .map_err(QueueError::Redis)?;

            if let Some(raw) = raw {
                let mut msg: QueueMessage =
                    serde_json::from_str(&raw).map_err(QueueError::Serialize)?;
                msg.visibility_deadline = Some(deadline);
                self.cycle.advance();
                return Ok(Some(msg));
            }
        }

        Ok(None)
    }

    async fn ack(&self, msg: &QueueMessage) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        // The wire payload excludes the lease deadline, so this matches the
        // member stored at dequeue byte for byte.
        let payload = serde_json::to_string(msg).map_err(QueueError::Serialize)?;
        conn.zrem::<_, _, ()>(PROCESSING_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<ReapOutcome, QueueError> {
        let mut conn = self.conn().await?;
        let expired: Vec<String> = conn
            .zrangebyscore(PROCESSING_KEY, "-inf", now.timestamp())
            .await
            .map_err(QueueError::Redis)?;

        let mut outcome = ReapOutcome::default();
        for raw in expired {
            // Claim the member before acting on it; a concurrent reaper or a
            // late ack may have removed it already.
            let removed: i64 = conn
                .zrem(PROCESSING_KEY, &raw)
                .await
                .map_err(QueueError::Redis)?;
            if removed == 0 {
                continue;
            }

            let mut msg: QueueMessage =
                serde_json::from_str(&raw).map_err(QueueError::Serialize)?;
            msg.delivery_count += 1;
            let payload = serde_json::to_string(&msg).map_err(QueueError::Serialize)?;

            if msg.delivery_count > self.max_deliveries {
                conn.lpush::<_, _, ()>(DEAD_KEY, &payload)
                    .await
                    .map_err(QueueError::Redis)?;
                outcome.dead_lettered.push(msg);
            } else {
                conn.lpush::<_, _, ()>(tier_key(msg.tier), &payload)
                    .await
                    .map_err(QueueError::Redis)?;
                outcome.redelivered.push(msg);
            }
        }

        Ok(outcome)
    }

    async fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        let mut conn = self.conn().await?;
        let now = Utc::now();

        let mut depth = 0u64;
        let mut per_tier = std::collections::HashMap::new();
        let mut oldest: Option<DateTime<Utc>> = None;

        for tier in Tier::ALL {
            let key = tier_key(tier);
            let len: u64 = conn.llen(&key).await.map_err(QueueError::Redis)?;
            depth += len;
            per_tier.insert(tier.to_string(), len);

            // Oldest message sits at the tail of its partition.
            if len > 0 {
                let tail: Option<String> =
                    conn.lindex(&key, -1).await.map_err(QueueError::Redis)?;
                if let Some(raw) = tail {
                    let msg: QueueMessage =
                        serde_json::from_str(&raw).map_err(QueueError::Serialize)?;
                    oldest = Some(match oldest {
                        Some(t) if t <= msg.enqueue_time => t,
                        _ => msg.enqueue_time,
                    });
                }
            }
        }

        let in_flight: u64 = conn
            .zcard(PROCESSING_KEY)
            .await
            .map_err(QueueError::Redis)?;

        Ok(QueueSnapshot {
            depth,
            oldest_enqueue_age_secs: oldest.map(|t| (now - t).num_seconds()),
            in_flight,
            per_tier,
        })
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}
