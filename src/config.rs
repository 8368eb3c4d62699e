//! Configuration types.

use std::time::Duration;

use crate::error::{ConfigError, Error};

/// Engine loop timing.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sleep after a tick that reported remaining work.
    pub active_delay: Duration,
    /// Sleep after a tick that reported no remaining work.
    pub idle_delay: Duration,
    /// Sleep after a failed tick before resuming.
    pub recovery_delay: Duration,
    /// How long `request_freeze` waits for every loop to park.
    pub freeze_timeout: Duration,
    /// How long a parked loop iteration waits for `unfreeze`.
    pub parked_timeout: Duration,
    /// Upper bound on polling for loop termination in `stop`.
    pub stop_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            active_delay: Duration::from_millis(10),
            idle_delay: Duration::from_millis(120),
            recovery_delay: Duration::from_secs(3),
            freeze_timeout: Duration::from_secs(3),
            parked_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Operation scheduler sizing and timeouts.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker loops (grow-only).
    pub max_workers: usize,
    /// Cap on concurrently executing pending operations.
    pub max_concurrent_operations: usize,
    /// Executing pending operations are evicted after this long.
    pub pending_timeout: Duration,
    /// A running named-queue head is evicted after this long.
    pub queue_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            max_concurrent_operations: 2,
            pending_timeout: Duration::from_secs(30),
            queue_timeout: Duration::from_secs(15),
        }
    }
}

/// State checkpoint timing and restore behaviour.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Minimum spacing between unforced saves.
    pub save_interval: Duration,
    /// Save blackout after a restore or a declined restore.
    pub reset_interval: Duration,
    /// Summaries older than this force a metadata write.
    pub forced_timestamp_age: Duration,
    /// Kind tag every restored stack must start with.
    pub root_kind: String,
    /// Collapse immediately repeated kinds while restoring.
    pub collapse_duplicate_kinds: bool,
    /// Upper bound on waiting for one restored unit's navigation.
    pub navigation_timeout: Duration,
    /// Delay before each restored unit is navigated to.
    pub entry_settle_delay: Duration,
    /// Extra delay after the first restored unit.
    pub first_entry_settle_delay: Duration,
    /// Extra delay after the last restored unit.
    pub last_entry_settle_delay: Duration,
    /// Summaries younger than this restore without prompting.
    pub automatic_restore_window: Duration,
    /// Summaries younger than this prompt before restoring.
    pub prompt_restore_window: Duration,
    /// Saving is disabled once the failure score exceeds this value.
    pub save_failure_cutoff: Option<u32>,
    /// Root-relative area holding all checkpoint keys.
    pub state_area: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            save_interval: Duration::from_secs(3),
            reset_interval: Duration::from_secs(7),
            forced_timestamp_age: Duration::from_secs(120),
            root_kind: "m".to_string(),
            collapse_duplicate_kinds: true,
            navigation_timeout: Duration::from_secs(4),
            entry_settle_delay: Duration::from_millis(50),
            first_entry_settle_delay: Duration::from_millis(300),
            last_entry_settle_delay: Duration::from_millis(70),
            automatic_restore_window: Duration::from_secs(12 * 60),
            prompt_restore_window: Duration::from_secs(20 * 3600),
            save_failure_cutoff: Some(20),
            state_area: "State".to_string(),
        }
    }
}

/// Navigation stack behaviour.
#[derive(Debug, Clone)]
pub struct NavigationConfig {
    /// Removed units stay activated this long before final deactivation.
    pub deactivation_delay: Duration,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            deactivation_delay: Duration::from_secs(5),
        }
    }
}

/// All core configuration.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    pub checkpoint: CheckpointConfig,
    pub navigation: NavigationConfig,
}

impl CoreConfig {
    /// Build a configuration from defaults plus `STATEKEEP_*` environment overrides.
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from defaults plus overrides resolved by `lookup`.
    pub fn from_lookup<F>(lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = millis(&lookup, "STATEKEEP_ENGINE_ACTIVE_DELAY_MS")? {
            config.engine.active_delay = v;
        }
        if let Some(v) = millis(&lookup, "STATEKEEP_ENGINE_IDLE_DELAY_MS")? {
            config.engine.idle_delay = v;
        }
        if let Some(v) = millis(&lookup, "STATEKEEP_ENGINE_RECOVERY_DELAY_MS")? {
            config.engine.recovery_delay = v;
        }
        if let Some(v) = number(&lookup, "STATEKEEP_SCHEDULER_WORKERS")? {
            if v == 0 {
                return Err(Error::Config(ConfigError::InvalidValue {
                    key: "STATEKEEP_SCHEDULER_WORKERS".to_string(),
                    message: "must be at least 1".to_string(),
                }));
            }
            config.scheduler.max_workers = v;
        }
        if let Some(v) = number(&lookup, "STATEKEEP_SCHEDULER_MAX_CONCURRENT")? {
            config.scheduler.max_concurrent_operations = v;
        }
        if let Some(v) = millis(&lookup, "STATEKEEP_CHECKPOINT_SAVE_INTERVAL_MS")? {
            config.checkpoint.save_interval = v;
        }
        if let Some(kind) = lookup("STATEKEEP_CHECKPOINT_ROOT_KIND") {
            if kind.trim().is_empty() {
                return Err(Error::Config(ConfigError::InvalidValue {
                    key: "STATEKEEP_CHECKPOINT_ROOT_KIND".to_string(),
                    message: "must not be empty".to_string(),
                }));
            }
            config.checkpoint.root_kind = kind;
        }

        Ok(config)
    }
}

fn number<F>(lookup: &F, key: &str) -> Result<Option<usize>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}' is not a number: {e}"),
            }),
    }
}

fn millis<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(number(lookup, key)?.map(|ms| Duration::from_millis(ms as u64)))
}
