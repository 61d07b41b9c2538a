//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use zonesync_protocol::ZoneId;

/// Conventional service attribute names, used when an entity carries no
/// explicit annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultAttributeNames {
    /// Remote record name.
    pub record_name: String,
    /// Remote owner name.
    pub owner_name: String,
    /// Encoded remote system fields.
    pub record_data: String,
    /// Deletion tombstone flag.
    pub marked_for_deletion: String,
}

impl Default for DefaultAttributeNames {
    fn default() -> Self {
        Self {
            record_name: "recordName".into(),
            owner_name: "ownerName".into(),
            record_data: "recordData".into(),
            marked_for_deletion: "markedForDeletion".into(),
        }
    }
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Name of the zone the engine manages in the private scope.
    pub zone_name: String,
    /// Metadata key the token ledger is stored under.
    pub metadata_key_tokens: String,
    /// Transaction origin whose commits are pushed.
    pub push_context_name: String,
    /// Transaction origin used when applying pulled changes.
    pub pull_context_name: String,
    /// Transaction origin used for push bookkeeping.
    pub sync_context_name: String,
    /// Conventional service attribute names.
    pub attributes: DefaultAttributeNames,
    /// Retry configuration for transient pull failures.
    pub retry: RetryConfig,
    /// Number of scopes pulled in parallel.
    pub pull_concurrency: usize,
    /// Directory for staged asset files. Defaults to the system temp dir.
    pub asset_staging_dir: Option<PathBuf>,
    /// Interval for automatic pushes. Disabled when `None`.
    pub auto_push_interval: Option<Duration>,
}

impl SyncConfig {
    /// Creates a configuration managing the given zone.
    pub fn new(zone_name: impl Into<String>) -> Self {
        Self {
            zone_name: zone_name.into(),
            metadata_key_tokens: "ZoneSyncTokens".into(),
            push_context_name: "ZoneSyncPushContext".into(),
            pull_context_name: "ZoneSyncPullContext".into(),
            sync_context_name: "ZoneSyncContext".into(),
            attributes: DefaultAttributeNames::default(),
            retry: RetryConfig::default(),
            pull_concurrency: 2,
            asset_staging_dir: None,
            auto_push_interval: None,
        }
    }

    /// Sets the metadata key of the token ledger.
    pub fn with_metadata_key(mut self, key: impl Into<String>) -> Self {
        self.metadata_key_tokens = key.into();
        self
    }

    /// Sets the transaction origin whose commits are pushed.
    pub fn with_push_context_name(mut self, name: impl Into<String>) -> Self {
        self.push_context_name = name.into();
        self
    }

    /// Sets the conventional service attribute names.
    pub fn with_attributes(mut self, attributes: DefaultAttributeNames) -> Self {
        self.attributes = attributes;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the number of scopes pulled in parallel.
    pub fn with_pull_concurrency(mut self, concurrency: usize) -> Self {
        self.pull_concurrency = concurrency;
        self
    }

    /// Sets the directory for staged asset files.
    pub fn with_asset_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.asset_staging_dir = Some(dir.into());
        self
    }

    /// Enables automatic pushes at a fixed interval.
    pub fn with_auto_push_interval(mut self, interval: Duration) -> Self {
        self.auto_push_interval = Some(interval);
        self
    }

    /// The zone the engine manages in the private scope.
    pub fn private_zone(&self) -> ZoneId {
        ZoneId::owned(self.zone_name.clone())
    }

    /// Checks the configuration for values the engine cannot work with.
    pub fn validate(&self) -> SyncResult<()> {
        let names = [
            ("zone name", &self.zone_name),
            ("token metadata key", &self.metadata_key_tokens),
            ("push context name", &self.push_context_name),
            ("pull context name", &self.pull_context_name),
            ("sync context name", &self.sync_context_name),
        ];
        for (what, value) in names {
            if value.trim().is_empty() {
                return Err(SyncError::configuration(format!("{what} must not be empty")));
            }
        }
        if self.push_context_name == self.sync_context_name
            || self.push_context_name == self.pull_context_name
        {
            return Err(SyncError::configuration(
                "push context name must differ from the engine's own context names",
            ));
        }
        if self.pull_concurrency == 0 {
            return Err(SyncError::configuration("pull concurrency must be at least 1"));
        }
        if self.auto_push_interval == Some(Duration::ZERO) {
            return Err(SyncError::configuration("auto push interval must be non-zero"));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("ZoneSync")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts. `None` retries until cancelled.
    pub max_attempts: Option<u32>,
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
    /// Creates a configuration that retries until cancelled.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with a fixed attempt budget.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns true if attempt number `attempt` (0-indexed) may run.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% on top
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.zone_name, "ZoneSync");
        assert_eq!(config.metadata_key_tokens, "ZoneSyncTokens");
        assert_eq!(config.attributes.record_name, "recordName");
        assert_eq!(config.attributes.marked_for_deletion, "markedForDeletion");
        assert!(config.retry.max_attempts.is_none());
        assert_eq!(config.private_zone(), ZoneId::owned("ZoneSync"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("Notes")
            .with_metadata_key("NotesTokens")
            .with_pull_concurrency(1)
            .with_asset_staging_dir("/tmp/staging")
            .with_auto_push_interval(Duration::from_secs(5));

        assert_eq!(config.zone_name, "Notes");
        assert_eq!(config.metadata_key_tokens, "NotesTokens");
        assert_eq!(config.pull_concurrency, 1);
        assert_eq!(config.asset_staging_dir, Some(PathBuf::from("/tmp/staging")));
        assert_eq!(config.auto_push_interval, Some(Duration::from_secs(5)));
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(SyncConfig::new("").validate().is_err());
        assert!(SyncConfig::default()
            .with_pull_concurrency(0)
            .validate()
            .is_err());
        assert!(SyncConfig::default()
            .with_push_context_name("ZoneSyncContext")
            .validate()
            .is_err());
        assert!(SyncConfig::default()
            .with_auto_push_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn retry_attempt_budget() {
        assert!(RetryConfig::unbounded().allows_attempt(u32::MAX - 1));
        let bounded = RetryConfig::unbounded().with_max_attempts(3);
        assert!(bounded.allows_attempt(2));
        assert!(!bounded.allows_attempt(3));
        assert!(!RetryConfig::no_retry().allows_attempt(1));
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::unbounded()
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
        let config = RetryConfig::unbounded()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(1_000), Duration::from_secs(5));
    }
}
