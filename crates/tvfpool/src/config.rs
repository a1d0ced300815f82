//! Pool configuration: defaults, builder methods and environment overrides.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name}: cannot parse '{value}'")]
    Invalid { name: &'static str, value: String },
    #[error("pool_size must be at least 1")]
    ZeroPoolSize,
    #[error("pool_size {pool_size} exceeds max_pool_size {max_limit}")]
    PoolSizeAboveLimit { pool_size: usize, max_limit: usize },
    #[error("{0} must be non-zero")]
    ZeroInterval(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// One child process per worker.
    Process,
    /// In-process tasks.
    Local,
}

impl std::str::FromStr for WorkerMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "local" => Ok(Self::Local),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub pool_size: usize,
    /// Hard ceiling for `resize`; also the number of workers started.
    pub max_limit: usize,
    pub poll_interval: Duration,
    /// `None` disables idle-session reaping.
    pub idle_timeout: Option<Duration>,
    pub reap_interval: Duration,
    pub worker_mode: WorkerMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_limit: 16,
            poll_interval: Duration::from_millis(100),
            idle_timeout: Some(Duration::from_secs(300)),
            reap_interval: Duration::from_secs(5),
            worker_mode: WorkerMode::Process,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    pub fn with_max_limit(mut self, n: usize) -> Self {
        self.max_limit = n;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_worker_mode(mut self, mode: WorkerMode) -> Self {
        self.worker_mode = mode;
        self
    }

    /// Defaults overridden by `TVF_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(
            name: &'static str,
            lookup: &impl Fn(&str) -> Option<String>,
        ) -> Result<Option<T>, ConfigError> {
            match lookup(name) {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::Invalid { name, value }),
            }
        }

        let mut config = Self::default();
        if let Some(n) = parse("TVF_POOL_SIZE", &lookup)? {
            config.pool_size = n;
        }
        if let Some(n) = parse("TVF_MAX_POOL_SIZE", &lookup)? {
            config.max_limit = n;
        }
        if let Some(ms) = parse("TVF_POLL_INTERVAL_MS", &lookup)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>("TVF_IDLE_TIMEOUT_SECS", &lookup)? {
            config.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse("TVF_REAP_INTERVAL_SECS", &lookup)? {
            config.reap_interval = Duration::from_secs(secs);
        }
        if let Some(mode) = parse("TVF_WORKER_MODE", &lookup)? {
            config.worker_mode = mode;
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::ZeroPoolSize);
        }
        if self.pool_size > self.max_limit {
            return Err(ConfigError::PoolSizeAboveLimit {
                pool_size: self.pool_size,
                max_limit: self.max_limit,
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("poll_interval"));
        }
        if self.reap_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("reap_interval"));
        }
        Ok(())
    }
}
