//! Configuration for the sync engine.

use casesync_model::{DEFAULT_GRACE_MS, DEFAULT_SKEW_BUFFER_MS};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Effective data owner; keys the snapshot, deletions and settings.
    pub owner_id: String,
    /// User performing edits and deletions.
    pub actor_id: String,
    /// Remote endpoint, if one is configured.
    pub remote_url: Option<String>,
    /// Lead a local record needs to beat its remote copy.
    pub merge_skew_buffer: Duration,
    /// Grace added to a tombstone before a later edit resurrects a record.
    pub tombstone_grace: Duration,
    /// How far back remote tombstones are fetched.
    pub tombstone_window: Duration,
    /// Age after which synced attachment content is evicted remotely.
    pub retention_window: Duration,
    /// Quiescence after a local edit before an automatic sync.
    pub auto_sync_debounce: Duration,
    /// Coalescing window for remote change notifications.
    pub change_debounce: Duration,
    /// Upload loop period.
    pub upload_interval: Duration,
    /// Download loop period.
    pub download_interval: Duration,
    /// Retention sweep period.
    pub sweep_interval: Duration,
    /// Retry configuration.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration with default timings.
    pub fn new(owner_id: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            actor_id: actor_id.into(),
            remote_url: None,
            merge_skew_buffer: Duration::from_millis(DEFAULT_SKEW_BUFFER_MS as u64),
            tombstone_grace: Duration::from_millis(DEFAULT_GRACE_MS as u64),
            tombstone_window: Duration::from_secs(30 * 24 * 60 * 60),
            retention_window: Duration::from_secs(24 * 60 * 60),
            auto_sync_debounce: Duration::from_secs(3),
            change_debounce: Duration::from_secs(1),
            upload_interval: Duration::from_secs(10),
            download_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60 * 60),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the remote endpoint.
    #[must_use]
    pub fn with_remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    /// Sets the merge skew buffer.
    #[must_use]
    pub fn with_merge_skew_buffer(mut self, buffer: Duration) -> Self {
        self.merge_skew_buffer = buffer;
        self
    }

    /// Sets the tombstone grace period.
    #[must_use]
    pub fn with_tombstone_grace(mut self, grace: Duration) -> Self {
        self.tombstone_grace = grace;
        self
    }

    /// Sets the tombstone fetch window.
    #[must_use]
    pub fn with_tombstone_window(mut self, window: Duration) -> Self {
        self.tombstone_window = window;
        self
    }

    /// Sets the attachment retention window.
    #[must_use]
    pub fn with_retention_window(mut self, window: Duration) -> Self {
        self.retention_window = window;
        self
    }

    /// Sets the auto-sync debounce.
    #[must_use]
    pub fn with_auto_sync_debounce(mut self, debounce: Duration) -> Self {
        self.auto_sync_debounce = debounce;
        self
    }

    /// Sets the change-notification debounce.
    #[must_use]
    pub fn with_change_debounce(mut self, debounce: Duration) -> Self {
        self.change_debounce = debounce;
        self
    }

    /// Sets the upload, download and sweep periods.
    #[must_use]
    pub fn with_attachment_intervals(
        mut self,
        upload: Duration,
        download: Duration,
        sweep: Duration,
    ) -> Self {
        self.upload_interval = upload;
        self.download_interval = download;
        self.sweep_interval = sweep;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) fn skew_buffer_ms(&self) -> i64 {
        millis(self.merge_skew_buffer)
    }

    pub(crate) fn grace_ms(&self) -> i64 {
        millis(self.tombstone_grace)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("", "")
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // up to 25%
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Per-owner user settings, persisted on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Whether local edits trigger automatic syncs.
    pub auto_sync: bool,
    /// Completion time of the last successful full sync.
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            auto_sync: true,
            last_synced_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_timings() {
        let config = SyncConfig::new("owner", "actor");
        assert_eq!(config.skew_buffer_ms(), 1_000);
        assert_eq!(config.grace_ms(), 2_000);
        assert_eq!(config.tombstone_window, Duration::from_secs(2_592_000));
        assert_eq!(config.retention_window, Duration::from_secs(86_400));
        assert_eq!(config.auto_sync_debounce, Duration::from_secs(3));
        assert!(config.remote_url.is_none());
    }

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("o", "a")
            .with_remote_url("https://db.example.com")
            .with_auto_sync_debounce(Duration::from_millis(50))
            .with_attachment_intervals(
                Duration::from_millis(1),
                Duration::from_millis(2),
                Duration::from_millis(3),
            );
        assert_eq!(config.remote_url.as_deref(), Some("https://db.example.com"));
        assert_eq!(config.auto_sync_debounce, Duration::from_millis(50));
        assert_eq!(config.download_interval, Duration::from_millis(2));
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }

    #[test]
    fn settings_default_to_auto_sync() {
        let settings: SyncSettings = serde_json::from_str("{}").unwrap();
        assert!(settings.auto_sync);
        assert!(settings.last_synced_at.is_none());
    }
}
