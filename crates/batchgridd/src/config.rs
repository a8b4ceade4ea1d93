//! batchgridd.toml configuration.
//!
//! Every section is optional and falls back to its defaults, except that
//! at least one `[[scheduler.levels]]` entry and a predictor endpoint are
//! required.
//!
//! ```toml
//! [store]
//! data_dir = "/var/lib/batchgrid"
//!
//! [heartbeat]
//! listen = "0.0.0.0:50052"
//!
//! [autoscaler]
//! interval_secs = 15
//! policy = { kind = "exp_workload", max_step = 32 }
//!
//! [[scheduler.levels]]
//! policy = "duration"
//! timeout_secs = 60
//! bin_capacity = 3600
//!
//! [predictor]
//! endpoint = "127.0.0.1:50051"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use batchgrid_autoscale::{AutoscalerConfig, PolicySpec};
use batchgrid_cluster::{ClusterSpec, LocalPlatformConfig};
use batchgrid_scheduler::LevelConfig;
use batchgrid_state::Platform;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub store: StoreConfig,
    pub heartbeat: HeartbeatConfig,
    pub pool: PoolConfig,
    pub autoscaler: AutoscalerConfig,
    pub recovery: RecoveryConfig,
    pub scheduler: SchedulerConfig,
    pub predictor: PredictorConfig,
    pub platform: PlatformConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub file_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/batchgrid"),
            file_name: "batchgrid.redb".into(),
        }
    }
}

impl StoreConfig {
    pub fn path(&self) -> PathBuf {
        self.data_dir.join(&self.file_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub listen: SocketAddr,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 50052)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub liveliness_interval_secs: u64,
    /// Clusters silent for longer than this are evicted.
    pub liveliness_timeout_secs: u64,
    pub monitor_interval_secs: u64,
    /// Shape of every newly deployed cluster.
    pub cluster: ClusterSpec,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            liveliness_interval_secs: 30,
            liveliness_timeout_secs: 120,
            monitor_interval_secs: 10,
            cluster: ClusterSpec::default(),
        }
    }
}

/// Autoscaler binding for clusters adopted from heartbeats. Fields left
/// out of `[recovery]` take the recovery defaults: proportional policy,
/// downscaling disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub interval_secs: u64,
    pub backoff_secs: u64,
    pub allow_downscale: bool,
    pub policy: PolicySpec,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        AutoscalerConfig::recovery().into()
    }
}

impl From<AutoscalerConfig> for RecoveryConfig {
    fn from(config: AutoscalerConfig) -> Self {
        Self {
            interval_secs: config.interval_secs,
            backoff_secs: config.backoff_secs,
            allow_downscale: config.allow_downscale,
            policy: config.policy,
        }
    }
}

impl RecoveryConfig {
    pub fn autoscaler(&self) -> AutoscalerConfig {
        AutoscalerConfig {
            interval_secs: self.interval_secs,
            backoff_secs: self.backoff_secs,
            allow_downscale: self.allow_downscale,
            policy: self.policy.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub levels: Vec<LevelConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// `host:port` of the predictor service.
    pub endpoint: String,
    pub timeout_secs: u64,
    /// Refuse to start when the predictor health check fails. When false
    /// the daemon starts anyway and jobs get zero duration estimates.
    pub required: bool,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:50051".into(),
            timeout_secs: 10,
            required: true,
        }
    }
}

impl PredictorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub kind: Platform,
    pub local: LocalPlatformConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            kind: Platform::Local,
            local: LocalPlatformConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler.levels.is_empty() {
            bail!("at least one [[scheduler.levels]] entry is required");
        }
        if self.predictor.endpoint.trim().is_empty() {
            bail!("predictor.endpoint must not be empty");
        }
        if self.pool.liveliness_interval_secs == 0 || self.pool.monitor_interval_secs == 0 {
            bail!("pool intervals must be positive");
        }
        if self.autoscaler.interval_secs == 0 || self.recovery.interval_secs == 0 {
            bail!("autoscaler interval_secs must be positive");
        }
        self.autoscaler
            .policy
            .validate()
            .context("invalid [autoscaler] policy")?;
        self.recovery
            .policy
            .validate()
            .context("invalid [recovery] policy")?;
        if self.platform.kind != Platform::Local {
            bail!("no driver available for platform {}", self.platform.kind);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchgrid_scheduler::PackingPolicy;

    const FULL: &str = r#"
[store]
data_dir = "/tmp/bg"

[heartbeat]
listen = "127.0.0.1:6000"

[pool]
liveliness_timeout_secs = 90
cluster = { workers = 3, min_elastic_nodes = 1 }

[autoscaler]
interval_secs = 5
allow_downscale = false
policy = { kind = "timeout", period = 4 }

[recovery]
policy = { kind = "exp_workload" }

[[scheduler.levels]]
policy = "count"
bin_capacity = 5

[[scheduler.levels]]
timeout_secs = 120
high_performance = true

[predictor]
endpoint = "predictor:50051"

[platform]
kind = "local"
local = { time_scale = 0.5 }
"#;

    #[test]
    fn parses_every_section() {
        let config = DaemonConfig::from_toml(FULL).unwrap();
        assert_eq!(config.store.path(), PathBuf::from("/tmp/bg/batchgrid.redb"));
        assert_eq!(config.heartbeat.listen.port(), 6000);
        assert_eq!(config.pool.liveliness_timeout_secs, 90);
        assert_eq!(config.pool.liveliness_interval_secs, 30);
        assert_eq!(config.pool.cluster.workers, 3);
        assert_eq!(config.autoscaler.interval_secs, 5);
        assert!(!config.autoscaler.allow_downscale);
        assert!(matches!(config.autoscaler.policy, PolicySpec::Timeout(ref t) if t.period == 4));
        assert_eq!(config.recovery.policy, PolicySpec::default());
        // Unset fields keep the recovery defaults.
        assert!(!config.recovery.allow_downscale);
        assert_eq!(config.recovery.autoscaler().interval_secs, 15);
        assert_eq!(config.scheduler.levels.len(), 2);
        assert_eq!(config.scheduler.levels[0].policy, PackingPolicy::Count);
        assert!(config.scheduler.levels[1].high_performance);
        assert_eq!(config.predictor.endpoint, "predictor:50051");
        assert_eq!(config.platform.local.time_scale, 0.5);
        config.validate().unwrap();
    }

    #[test]
    fn defaults_need_levels() {
        let config = DaemonConfig::from_toml("").unwrap();
        assert_eq!(config.recovery, RecoveryConfig::default());
        assert!(!config.recovery.allow_downscale);
        assert_eq!(config.recovery.autoscaler(), AutoscalerConfig::recovery());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("scheduler.levels"));
    }

    #[test]
    fn predictor_is_required_by_default() {
        let config = DaemonConfig::from_toml(FULL).unwrap();
        assert!(config.predictor.required);
        let lenient =
            DaemonConfig::from_toml("[predictor]\nrequired = false\n").unwrap();
        assert!(!lenient.predictor.required);
    }

    #[test]
    fn empty_predictor_endpoint_is_fatal() {
        let mut config = DaemonConfig::from_toml(FULL).unwrap();
        config.predictor.endpoint = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unsupported_platform_is_fatal() {
        let mut config = DaemonConfig::from_toml(FULL).unwrap();
        config.platform.kind = Platform::Dataproc;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_policy_kind_fails_to_parse() {
        let content = "[autoscaler]\npolicy = { kind = \"magic\" }\n";
        assert!(DaemonConfig::from_toml(content).is_err());
    }
}
