use serde::Deserialize;

use crate::models::job::Tier;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue
    pub redis_url: String,

    /// Base URL of the render engine service
    pub render_engine_url: String,

    /// Output bucket name
    pub output_bucket: String,

    /// S3-compatible endpoint URL for the output store
    pub output_endpoint: String,

    /// Output store access key ID
    pub output_access_key: String,

    /// Output store secret access key
    pub output_secret_key: String,

    /// Bearer token granting access to admin endpoints
    pub admin_token: String,

    /// Maximum execution attempts per job before it is failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Maximum queue deliveries per message before dead-lettering
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    /// Lease window for a dequeued message, in seconds
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Worker idle poll interval, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Reaper cycle interval, in seconds
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    /// Age past which a `running` job with an expired lease is reconciled
    /// back to `queued`, in seconds
    #[serde(default = "default_stale_running_secs")]
    pub stale_running_secs: i64,

    /// Weighted round-robin dequeue weights per tier. Every non-empty tier
    /// partition is served at least once per sum-of-weights dequeues.
    #[serde(default = "default_tier_weight_free")]
    pub tier_weight_free: u32,
    #[serde(default = "default_tier_weight_pro")]
    pub tier_weight_pro: u32,
    #[serde(default = "default_tier_weight_enterprise")]
    pub tier_weight_enterprise: u32,

    /// Per-owner in-flight job ceilings per tier
    #[serde(default = "default_quota_free")]
    pub quota_free: i32,
    #[serde(default = "default_quota_pro")]
    pub quota_pro: i32,
    #[serde(default = "default_quota_enterprise")]
    pub quota_enterprise: i32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_max_attempts() -> i32 {
    3
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_visibility_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_reap_interval_secs() -> u64 {
    30
}

fn default_stale_running_secs() -> i64 {
    300
}

fn default_tier_weight_free() -> u32 {
    1
}

fn default_tier_weight_pro() -> u32 {
    2
}

fn default_tier_weight_enterprise() -> u32 {
    4
}

fn default_quota_free() -> i32 {
    2
}

fn default_quota_pro() -> i32 {
    10
}

fn default_quota_enterprise() -> i32 {
    50
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn tier_weight(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Free => self.tier_weight_free,
            Tier::Pro => self.tier_weight_pro,
            Tier::Enterprise => self.tier_weight_enterprise,
        }
    }

    pub fn quota_ceiling(&self, tier: Tier) -> i32 {
        match tier {
            Tier::Free => self.quota_free,
            Tier::Pro => self.quota_pro,
            Tier::Enterprise => self.quota_enterprise,
        }
    }

    pub fn tier_weights(&self) -> Vec<(Tier, u32)> {
        Tier::ALL
            .iter()
            .map(|&tier| (tier, self.tier_weight(tier)))
            .collect()
    }
}
