use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: u32 = 5;
pub const DEFAULT_MAX_WORKERS: usize = 3;

pub const BATCH_SIZE_VAR: &str = "BOOKMARK_JOBS_BATCH_SIZE";
pub const MAX_WORKERS_VAR: &str = "BOOKMARK_JOBS_MAX_WORKERS";
pub const POLL_INTERVAL_VAR: &str = "BOOKMARK_JOBS_POLL_INTERVAL_MS";

/// Process-wide worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// How many jobs to claim per drain cycle.
    pub batch_size: u32,
    /// How many jobs may execute at the same time.
    pub max_workers: usize,
    /// Only used by `JobRunner::run`. `None` means drain-to-empty only.
    pub poll_interval: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_workers: DEFAULT_MAX_WORKERS,
            poll_interval: None,
        }
    }
}

impl RunnerConfig {
    pub fn new(batch_size: u32, max_workers: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_workers: max_workers.max(1),
            poll_interval: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Read settings from the environment. Missing, unparsable or zero values fall back to the
    /// defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let batch_size = positive(&lookup, BATCH_SIZE_VAR).unwrap_or(DEFAULT_BATCH_SIZE);
        let max_workers = positive(&lookup, MAX_WORKERS_VAR).unwrap_or(DEFAULT_MAX_WORKERS);
        let poll_interval = positive::<u64, _>(&lookup, POLL_INTERVAL_VAR).map(Duration::from_millis);
        Self {
            batch_size,
            max_workers,
            poll_interval,
        }
    }
}

fn positive<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr + PartialEq + Default,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) if value != T::default() => Some(value),
        _ => {
            tracing::warn!(key, value = %raw, "Ignoring invalid setting, using default");
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = RunnerConfig::from_lookup(lookup(&[]));
        assert_eq!(RunnerConfig::default(), config);
    }

    #[test]
    fn reads_values() {
        let config = RunnerConfig::from_lookup(lookup(&[
            (BATCH_SIZE_VAR, "20"),
            (MAX_WORKERS_VAR, " 8 "),
            (POLL_INTERVAL_VAR, "250"),
        ]));
        assert_eq!(20, config.batch_size);
        assert_eq!(8, config.max_workers);
        assert_eq!(Some(Duration::from_millis(250)), config.poll_interval);
    }

    #[test]
    fn zero_and_garbage_fall_back() {
        let config = RunnerConfig::from_lookup(lookup(&[
            (BATCH_SIZE_VAR, "0"),
            (MAX_WORKERS_VAR, "many"),
            (POLL_INTERVAL_VAR, "-5"),
        ]));
        assert_eq!(DEFAULT_BATCH_SIZE, config.batch_size);
        assert_eq!(DEFAULT_MAX_WORKERS, config.max_workers);
        assert_eq!(None, config.poll_interval);
    }
}
