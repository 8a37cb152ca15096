//! Engine configuration.
//!
//! Every field has a default, so a config file only needs the values it
//! overrides:
//!
//! ```json
//! { "batchSize": 25, "retry": { "baseDelayMs": 250 } }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BackfillError, Result};

/// Linear backoff: attempt `n` waits `n × base_delay` before retrying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Records per page.
    pub batch_size: usize,
    /// The eligibility probe reads up to twice this many records.
    pub probe_sample_size: usize,
    /// Eligible records the probe keeps for partition selection.
    pub eligible_sample_limit: usize,
    pub discovery_attempts: usize,
    pub discovery_page_size: usize,
    /// Eligible records collected per discovery attempt before picking.
    pub discovery_pick_limit: usize,
    /// Upper bound on records read when looking for an alternative seed.
    pub alternative_scan_limit: usize,
    pub max_selection_attempts: usize,
    /// Runaway guard for `process_all_batches`.
    pub max_batches: usize,
    pub cache_ttl_secs: u64,
    pub random_seed: Option<u64>,
    pub debug_mode: bool,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            probe_sample_size: 100,
            eligible_sample_limit: 10,
            discovery_attempts: 5,
            discovery_page_size: 50,
            discovery_pick_limit: 5,
            alternative_scan_limit: 500,
            max_selection_attempts: 3,
            max_batches: 1000,
            cache_ttl_secs: 300,
            random_seed: None,
            debug_mode: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| BackfillError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BackfillError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batchSize", self.batch_size),
            ("probeSampleSize", self.probe_sample_size),
            ("discoveryAttempts", self.discovery_attempts),
            ("discoveryPageSize", self.discovery_page_size),
            ("discoveryPickLimit", self.discovery_pick_limit),
            ("alternativeScanLimit", self.alternative_scan_limit),
            ("maxSelectionAttempts", self.max_selection_attempts),
            ("maxBatches", self.max_batches),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(BackfillError::Config(format!("{name} must be greater than 0")));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(BackfillError::Config(
                "retry.maxAttempts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_batches, 1000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay_for(2), Duration::from_millis(2000));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{"batchSize": 25, "retry": {"baseDelayMs": 5}}"#)
                .unwrap();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.retry.base_delay_ms, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.probe_sample_size, 100);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = EngineConfig::from_json_str(r#"{"batchSize": 0}"#).unwrap_err();
        assert!(matches!(err, BackfillError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"debugMode": true, "randomSeed": 7}}"#).unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert!(config.debug_mode);
        assert_eq!(config.random_seed, Some(7));
    }
}
