//! Orchestrator tuning knobs.
//!
//! All the constants the two production features hard-coded independently
//! (batch size, cooldown, attempt caps, call timeout) live here as one
//! parameterized configuration, with named profiles for the observed text
//! and narration tunings.

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Environment variable overriding the batch size.
pub const BATCH_SIZE_ENV_VAR: &str = "CHAPTERFLOW_BATCH_SIZE";
/// Environment variable overriding the inter-batch cooldown (seconds).
pub const COOLDOWN_SECS_ENV_VAR: &str = "CHAPTERFLOW_COOLDOWN_SECS";
/// Environment variable overriding the per-item attempt cap.
pub const MAX_ATTEMPTS_ENV_VAR: &str = "CHAPTERFLOW_MAX_ATTEMPTS";

/// Configuration for one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Jobs launched concurrently per batch.
    /// Small on purpose: the upstream generation service is rate-limited.
    pub batch_size: usize,

    /// Pause between batches. Interruptible by a stop request.
    pub cooldown: Duration,

    /// Automatic attempts allowed per item before it is reported as
    /// terminally failed. A manual retry grants a fresh budget.
    pub max_attempts: u32,

    /// Fixed delay between attempts on the same item. Deliberately not
    /// exponential, matching observed production behavior, but tunable.
    pub retry_delay: Duration,

    /// Per-call timeout. Generation backends are slow; a timeout is folded
    /// into the ordinary failure path.
    pub call_timeout: Duration,

    /// Interval between poll-endpoint requests.
    pub poll_interval: Duration,

    /// Push-channel connection attempts before degrading to poll-only.
    pub push_reconnect_attempts: u32,

    /// Delay between push-channel connection attempts.
    pub push_reconnect_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::narration()
    }
}

impl OrchestratorConfig {
    /// Tuning observed for chapter text generation.
    pub fn text() -> Self {
        Self {
            batch_size: 3,
            cooldown: Duration::from_secs(60),
            max_attempts: 3,
            retry_delay: Duration::from_secs(10),
            call_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(5),
            push_reconnect_attempts: 5,
            push_reconnect_delay: Duration::from_secs(2),
        }
    }

    /// Tuning observed for audio narration generation; the upstream audio
    /// service is the more expensive of the two.
    pub fn narration() -> Self {
        Self {
            batch_size: 2,
            cooldown: Duration::from_secs(150),
            max_attempts: 5,
            retry_delay: Duration::from_secs(10),
            call_timeout: Duration::from_secs(180),
            poll_interval: Duration::from_secs(5),
            push_reconnect_attempts: 5,
            push_reconnect_delay: Duration::from_secs(2),
        }
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the inter-batch cooldown.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Sets the per-item attempt cap.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the fixed delay between attempts.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Sets the per-call timeout.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the push reconnect bound.
    pub fn with_push_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.push_reconnect_attempts = attempts;
        self
    }

    /// Sets the delay between push reconnect attempts.
    pub fn with_push_reconnect_delay(mut self, delay: Duration) -> Self {
        self.push_reconnect_delay = delay;
        self
    }

    /// Apply environment-variable overrides for the operational knobs.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(batch_size) = env_parse::<usize>(BATCH_SIZE_ENV_VAR) {
            self.batch_size = batch_size.max(1);
        }
        if let Some(secs) = env_parse::<u64>(COOLDOWN_SECS_ENV_VAR) {
            self.cooldown = Duration::from_secs(secs);
        }
        if let Some(max_attempts) = env_parse::<u32>(MAX_ATTEMPTS_ENV_VAR) {
            self.max_attempts = max_attempts.max(1);
        }
        self
    }

    /// Load overrides from a TOML file on top of the given base profile.
    ///
    /// Only the fields present in the file are overridden.
    pub fn from_file(base: Self, path: &Path) -> Result<Self, config::ConfigError> {
        let overrides: FileOverrides = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        Ok(overrides.apply(base))
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    env::var(var).ok().and_then(|value| value.parse().ok())
}

/// Optional overrides as they appear in a TOML config file.
#[derive(Debug, Default, Deserialize)]
struct FileOverrides {
    batch_size: Option<usize>,
    cooldown_secs: Option<u64>,
    max_attempts: Option<u32>,
    retry_delay_secs: Option<u64>,
    call_timeout_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    push_reconnect_attempts: Option<u32>,
}

impl FileOverrides {
    fn apply(self, mut base: OrchestratorConfig) -> OrchestratorConfig {
        if let Some(batch_size) = self.batch_size {
            base.batch_size = batch_size.max(1);
        }
        if let Some(secs) = self.cooldown_secs {
            base.cooldown = Duration::from_secs(secs);
        }
        if let Some(max_attempts) = self.max_attempts {
            base.max_attempts = max_attempts.max(1);
        }
        if let Some(secs) = self.retry_delay_secs {
            base.retry_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = self.call_timeout_secs {
            base.call_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.poll_interval_secs {
            base.poll_interval = Duration::from_secs(secs);
        }
        if let Some(attempts) = self.push_reconnect_attempts {
            base.push_reconnect_attempts = attempts;
        }
        base
    }
}
