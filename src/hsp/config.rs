//! Orchestrator-wide configuration.
//!
//! Follows this codebase's `CloudLLMConfig`: a plain struct with a
//! hand-written `Default`, no file-parsing in the core library. An
//! additive TOML-file layer is available behind the `config-file` feature
//! for the `service` binary, but the library's public config type never
//! requires a file to exist.

use crate::hsp::coordinator::FailurePolicy;
use std::time::Duration;

/// Every tunable named in the orchestrator's design: bus connection
/// parameters, registry staleness, lifecycle timeouts, scheduling limits,
/// and knowledge-ingestion thresholds.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub bus_endpoint: String,
    pub reconnect_min_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub advertisement_staleness_ttl: Duration,
    pub eviction_poll_interval: Duration,
    pub spawn_timeout: Duration,
    pub kill_grace_period: Duration,
    pub health_poll_interval: Duration,
    pub unhealthy_threshold: u32,
    pub max_in_flight_subtasks: usize,
    pub subtask_deadline: Duration,
    pub project_deadline: Duration,
    pub failure_policy: FailurePolicy,
    pub trust_floor: f64,
    pub novelty_bonus: f64,
    pub duplicate_epsilon: f64,
    pub ingestion_floor: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bus_endpoint: "local://in-process".to_string(),
            reconnect_min_backoff: Duration::from_millis(500),
            reconnect_max_backoff: Duration::from_secs(30),
            advertisement_staleness_ttl: Duration::from_secs(60),
            eviction_poll_interval: Duration::from_secs(20),
            spawn_timeout: Duration::from_secs(15),
            kill_grace_period: Duration::from_secs(5),
            health_poll_interval: Duration::from_secs(30),
            unhealthy_threshold: 3,
            max_in_flight_subtasks: 8,
            subtask_deadline: Duration::from_secs(30),
            project_deadline: Duration::from_secs(300),
            failure_policy: FailurePolicy::Strict,
            trust_floor: 0.5,
            novelty_bonus: 0.05,
            duplicate_epsilon: 0.01,
            ingestion_floor: 0.2,
        }
    }
}

/// Deployment-file overrides layered on top of [`OrchestratorConfig::default`].
///
/// Only present behind the `config-file` feature: the library itself never
/// requires a file on disk, but the `service` binary benefits from one.
#[cfg(feature = "config-file")]
pub mod file {
    use super::OrchestratorConfig;
    use serde::Deserialize;
    use std::path::Path;
    use std::time::Duration;

    #[derive(Debug, Deserialize, Default)]
    struct RawOverrides {
        bus_endpoint: Option<String>,
        advertisement_staleness_ttl_secs: Option<u64>,
        spawn_timeout_secs: Option<u64>,
        max_in_flight_subtasks: Option<usize>,
        trust_floor: Option<f64>,
    }

    /// Read a TOML file and apply whichever fields it sets on top of the
    /// built-in defaults. Unset fields keep their default value.
    pub fn load(path: &Path) -> Result<OrchestratorConfig, String> {
        let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let overrides: RawOverrides = toml::from_str(&contents).map_err(|e| e.to_string())?;

        let mut config = OrchestratorConfig::default();
        if let Some(endpoint) = overrides.bus_endpoint {
            config.bus_endpoint = endpoint;
        }
        if let Some(secs) = overrides.advertisement_staleness_ttl_secs {
            config.advertisement_staleness_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.spawn_timeout_secs {
            config.spawn_timeout = Duration::from_secs(secs);
        }
        if let Some(cap) = overrides.max_in_flight_subtasks {
            config.max_in_flight_subtasks = cap;
        }
        if let Some(floor) = overrides.trust_floor {
            config.trust_floor = floor;
        }
        Ok(config)
    }
}
