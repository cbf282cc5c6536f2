//! Runtime configuration.
//!
//! A plain builder, not an external config crate: runtime options live
//! behind hand-rolled structs with `with_*` methods and a `build()`
//! validation pass.

use crate::backoff::BackoffPolicy;
use crate::error::ValidationError;
use std::collections::HashMap;
use std::time::Duration;

/// How a queue's concurrency limit and pause state are configured.
#[derive(Debug, Clone, Copy)]
pub struct QueueOpts {
    pub limit: usize,
    pub paused: bool,
}

impl QueueOpts {
    pub fn new(limit: usize) -> Self {
        Self { limit, paused: false }
    }

    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }
}

impl From<usize> for QueueOpts {
    fn from(limit: usize) -> Self {
        QueueOpts::new(limit)
    }
}

/// Engine-wide testing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestingMode {
    #[default]
    Disabled,
    Inline,
    Manual,
}

/// Which maintenance plugins run, and with what tuning.
#[derive(Debug, Clone, Default)]
pub struct PluginOpts {
    pub pruner: Option<PrunerOpts>,
    pub lifeline: Option<LifelineOpts>,
    pub reindexer: Option<ReindexerOpts>,
    pub cron: Option<CronOpts>,
}

#[derive(Debug, Clone)]
pub struct PrunerOpts {
    pub interval: Duration,
    pub max_age: chrono::Duration,
    pub limit: i64,
}

impl Default for PrunerOpts {
    fn default() -> Self {
        Self {
            interval: crate::plugins::pruner::DEFAULT_INTERVAL,
            max_age: crate::plugins::pruner::DEFAULT_MAX_AGE,
            limit: crate::plugins::pruner::DEFAULT_LIMIT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifelineOpts {
    pub interval: Duration,
    pub rescue_after: chrono::Duration,
}

impl Default for LifelineOpts {
    fn default() -> Self {
        Self {
            interval: crate::plugins::lifeline::DEFAULT_INTERVAL,
            rescue_after: crate::plugins::lifeline::DEFAULT_RESCUE_AFTER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReindexerOpts {
    pub interval: Duration,
}

impl Default for ReindexerOpts {
    fn default() -> Self {
        Self {
            interval: crate::plugins::reindexer::DEFAULT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CronOpts {
    pub entries: Vec<crate::cron::CronEntry>,
    /// Default timezone for entries that don't set their own; entries
    /// may still override it individually.
    pub timezone: Option<chrono_tz::Tz>,
}

/// Fully validated, immutable configuration for one Oban instance.
#[derive(Debug, Clone)]
pub struct Config {
    pub node: String,
    pub queues: HashMap<String, QueueOpts>,
    pub plugins: PluginOpts,
    pub prefix: String,
    pub shutdown_grace_period: Duration,
    pub stage_interval: Duration,
    pub dispatch_cooldown: Duration,
    pub backoff: BackoffPolicy,
    pub election_interval: Duration,
    pub election_boost: u32,
    pub testing: TestingMode,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    node: Option<String>,
    queues: HashMap<String, QueueOpts>,
    plugins: PluginOpts,
    prefix: Option<String>,
    shutdown_grace_period: Option<Duration>,
    stage_interval: Option<Duration>,
    dispatch_cooldown: Option<Duration>,
    backoff: Option<BackoffPolicy>,
    election_interval: Option<Duration>,
    election_boost: Option<u32>,
    testing: TestingMode,
}

impl ConfigBuilder {
    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn queue(mut self, name: impl Into<String>, opts: impl Into<QueueOpts>) -> Self {
        self.queues.insert(name.into(), opts.into());
        self
    }

    pub fn plugins(mut self, plugins: PluginOpts) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn shutdown_grace_period(mut self, d: Duration) -> Self {
        self.shutdown_grace_period = Some(d);
        self
    }

    pub fn stage_interval(mut self, d: Duration) -> Self {
        self.stage_interval = Some(d);
        self
    }

    pub fn dispatch_cooldown(mut self, d: Duration) -> Self {
        self.dispatch_cooldown = Some(d);
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn election(mut self, interval: Duration, boost: u32) -> Self {
        self.election_interval = Some(interval);
        self.election_boost = Some(boost);
        self
    }

    pub fn testing(mut self, mode: TestingMode) -> Self {
        self.testing = mode;
        self
    }

    /// Validates and freezes the configuration: `queues` non-empty unless
    /// `testing = manual`, `prefix` a valid identifier,
    /// `shutdown_grace_period > 0`, `dispatch_cooldown >= 0`.
    pub fn build(self) -> Result<Config, ValidationError> {
        if self.queues.is_empty() && self.testing != TestingMode::Manual {
            return Err(ValidationError::new(
                "queues must be non-empty unless testing = manual".into(),
            ));
        }

        let prefix = self.prefix.unwrap_or_else(|| "public".to_string());
        if prefix.is_empty()
            || !prefix
                .chars()
                .next()
                .map(|c| c.is_ascii_alphabetic() || c == '_')
                .unwrap_or(false)
            || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ValidationError::new(format!(
                "prefix {prefix:?} is not a valid identifier"
            )));
        }

        let shutdown_grace_period = self
            .shutdown_grace_period
            .unwrap_or(Duration::from_secs(15));
        if shutdown_grace_period.is_zero() {
            return Err(ValidationError::new(
                "shutdown_grace_period must be > 0".into(),
            ));
        }

        // dispatch_cooldown >= 0 holds unconditionally for Duration.
        let dispatch_cooldown = self
            .dispatch_cooldown
            .unwrap_or(crate::producer::DEFAULT_DISPATCH_COOLDOWN);

        Ok(Config {
            node: self.node.unwrap_or_else(default_node_name),
            queues: self.queues,
            plugins: self.plugins,
            prefix,
            shutdown_grace_period,
            stage_interval: self
                .stage_interval
                .unwrap_or(crate::stager::DEFAULT_STAGE_INTERVAL),
            dispatch_cooldown,
            backoff: self.backoff.unwrap_or_default(),
            election_interval: self
                .election_interval
                .unwrap_or(crate::peer::DEFAULT_ELECTION_INTERVAL),
            election_boost: self.election_boost.unwrap_or(crate::peer::DEFAULT_BOOST),
            testing: self.testing,
        })
    }
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "oban@localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_queues_unless_manual_testing() {
        let err = Config::builder().build().unwrap_err();
        assert!(err.to_string().contains("queues"));

        let ok = Config::builder().testing(TestingMode::Manual).build();
        assert!(ok.is_ok());
    }

    #[test]
    fn rejects_invalid_prefix() {
        let err = Config::builder()
            .queue("default", 10)
            .prefix("1nvalid")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("prefix"));
    }

    #[test]
    fn rejects_zero_shutdown_grace_period() {
        let err = Config::builder()
            .queue("default", 10)
            .shutdown_grace_period(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("shutdown_grace_period"));
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::builder().queue("default", 10).build().unwrap();
        assert_eq!(config.prefix, "public");
        assert_eq!(config.shutdown_grace_period, Duration::from_secs(15));
    }
}
