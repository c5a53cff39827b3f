use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use crate::error::EngineError;

fn default_horizon_days() -> u32 {
    7
}
fn default_granularity() -> i64 {
    30
}
fn default_duration() -> i64 {
    30
}
fn default_confidence_threshold() -> f64 {
    0.6
}
fn default_tier_change_confirm_threshold() -> f64 {
    0.8
}
fn default_remote_timeout_secs() -> u64 {
    10
}
fn default_snapshot_max_age_secs() -> u64 {
    300
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_tier_threshold() -> f64 {
    0.7
}

/// Immutable engine configuration, threaded into the pipeline at
/// construction. Loaded from `qzwhatnext.toml` merged with `QZWN_`-prefixed
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Rebuild window length; one of 7, 14 or 30 days.
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u32,
    /// Scheduling slot size in minutes.
    #[serde(default = "default_granularity")]
    pub scheduling_granularity: i64,
    /// Default task duration in minutes.
    #[serde(default = "default_duration")]
    pub duration_default: i64,
    /// Minimum inference confidence to accept an attribute proposal.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Minimum inference confidence to auto-apply a tier change; below it the
    /// change is staged for user confirmation.
    #[serde(default = "default_tier_change_confirm_threshold")]
    pub tier_change_confirm_threshold: f64,
    /// Per-call deadline for the inference adapter, in seconds.
    #[serde(default = "default_remote_timeout_secs")]
    pub inference_timeout_secs: u64,
    /// Per-call deadline for availability reads and calendar writes.
    #[serde(default = "default_remote_timeout_secs")]
    pub remote_timeout_secs: u64,
    /// Staleness tolerance for the last availability snapshot on provider
    /// outage, in seconds.
    #[serde(default = "default_snapshot_max_age_secs")]
    pub availability_snapshot_max_age_secs: u64,
    /// Retry budget for remote calls (exponential backoff with cap).
    #[serde(default = "default_retry_attempts")]
    pub remote_retry_attempts: u32,
    /// risk_score cutoff for tier 2.
    #[serde(default = "default_tier_threshold")]
    pub risk_tier_threshold: f64,
    /// impact_score cutoff for tier 3.
    #[serde(default = "default_tier_threshold")]
    pub impact_tier_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            horizon_days: default_horizon_days(),
            scheduling_granularity: default_granularity(),
            duration_default: default_duration(),
            confidence_threshold: default_confidence_threshold(),
            tier_change_confirm_threshold: default_tier_change_confirm_threshold(),
            inference_timeout_secs: default_remote_timeout_secs(),
            remote_timeout_secs: default_remote_timeout_secs(),
            availability_snapshot_max_age_secs: default_snapshot_max_age_secs(),
            remote_retry_attempts: default_retry_attempts(),
            risk_tier_threshold: default_tier_threshold(),
            impact_tier_threshold: default_tier_threshold(),
        }
    }
}

impl EngineConfig {
    pub fn load() -> Result<Self, figment::Error> {
        let config: EngineConfig = Figment::new()
            .merge(Toml::file("qzwhatnext.toml"))
            .merge(Env::prefixed("QZWN_"))
            .extract()?;
        Ok(config)
    }

    /// Rejects option combinations the engine cannot honour.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !matches!(self.horizon_days, 7 | 14 | 30) {
            return Err(EngineError::InvalidInput(format!(
                "horizon_days must be 7, 14 or 30, got {}",
                self.horizon_days
            )));
        }
        if self.scheduling_granularity <= 0 {
            return Err(EngineError::InvalidInput(
                "scheduling_granularity must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold)
            || !(0.0..=1.0).contains(&self.tier_change_confirm_threshold)
        {
            return Err(EngineError::InvalidInput(
                "confidence thresholds must lie in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    pub fn horizon(&self) -> chrono::Duration {
        chrono::Duration::days(self.horizon_days as i64)
    }

    pub fn granularity(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.scheduling_granularity)
    }

    pub fn inference_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn remote_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.remote_timeout_secs)
    }

    pub fn availability_snapshot_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.availability_snapshot_max_age_secs as i64)
    }
}
