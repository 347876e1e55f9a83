//! The Agent Lifecycle Manager: spawns specialist agent processes on demand
//! and waits for them to prove they're ready instead of guessing with a
//! fixed sleep.
//!
//! The spawn-then-poll shape is carried over from this codebase's
//! `loom-cli` backend auto-start helper, which spawns a child process and
//! polls until it answers. Here the poll target is the
//! [`ServiceRegistry`](crate::hsp::registry::ServiceRegistry) observing the
//! spawned agent's own advertisement, rather than a raw socket connect — the
//! readiness signal the domain actually cares about.

use crate::hsp::clock::Clock;
use crate::hsp::config::OrchestratorConfig;
use crate::hsp::error::LifecycleError;
use crate::hsp::registry::ServiceRegistry;
use log::{info, warn};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

/// Default budget for a spawned agent to show up in the registry before
/// [`AgentLifecycleManager::ensure_running`] gives up.
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(15);
/// Cadence at which `ensure_running` polls the registry while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Default cadence for periodic health checks on a running agent.
pub const DEFAULT_HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Consecutive failed health polls before an agent is declared unhealthy.
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;

/// How to start a specialist agent process of a given kind.
#[derive(Debug, Clone)]
pub struct LaunchRecipe {
    pub executable: String,
    pub args: Vec<String>,
}

impl LaunchRecipe {
    pub fn new(executable: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
        }
    }
}

/// Bookkeeping for one process this manager spawned.
pub struct AgentProcessRecord {
    pub agent_id: String,
    child: Child,
    consecutive_failures: u32,
}

/// Spawns, health-polls, and reaps specialist agent processes. Agents the
/// registry already knows about (because they were started out-of-band) are
/// never spawned twice: [`AgentLifecycleManager::ensure_running`] checks the
/// registry first.
pub struct AgentLifecycleManager {
    registry: Arc<ServiceRegistry>,
    clock: Arc<dyn Clock>,
    recipes: RwLock<HashMap<String, LaunchRecipe>>,
    processes: RwLock<HashMap<String, AgentProcessRecord>>,
    spawn_timeout: Duration,
    health_poll_interval: Duration,
    unhealthy_threshold: u32,
}

impl AgentLifecycleManager {
    pub fn new(registry: Arc<ServiceRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            clock,
            recipes: RwLock::new(HashMap::new()),
            processes: RwLock::new(HashMap::new()),
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
            health_poll_interval: DEFAULT_HEALTH_POLL_INTERVAL,
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
        }
    }

    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    /// Apply the relevant fields of an [`OrchestratorConfig`] to this manager.
    pub fn with_config(mut self, config: &OrchestratorConfig) -> Self {
        self.spawn_timeout = config.spawn_timeout;
        self.health_poll_interval = config.health_poll_interval;
        self.unhealthy_threshold = config.unhealthy_threshold;
        self
    }

    /// Register how to launch the specialist that offers `capability_name`.
    /// Recipes are keyed directly by capability name: there is exactly one
    /// way this manager knows to bring a given capability online.
    pub async fn register_recipe(&self, capability_name: impl Into<String>, recipe: LaunchRecipe) {
        self.recipes.write().await.insert(capability_name.into(), recipe);
    }

    /// Ensure a specialist offering `capability_name` is reachable: if the
    /// registry already has a live (non-stale) advertisement for it, return
    /// that agent's id without spawning anything. Otherwise spawn from the
    /// registered recipe and wait for it to advertise, up to `spawn_timeout`.
    /// Returns the id of the agent now serving the capability.
    pub async fn ensure_running(&self, capability_name: &str) -> Result<String, LifecycleError> {
        if let Ok(ranked) = self.registry.find_by_name(capability_name).await {
            return Ok(ranked[0].advertisement.agent_id.clone());
        }

        let recipe = self
            .recipes
            .read()
            .await
            .get(capability_name)
            .cloned()
            .ok_or_else(|| LifecycleError::NoLaunchRecipe {
                capability_name: capability_name.to_string(),
            })?;

        let agent_id = format!("{}-{}", capability_name, uuid::Uuid::new_v4());
        info!("spawning agent {} ({})", agent_id, recipe.executable);

        let child = Command::new(&recipe.executable)
            .args(&recipe.args)
            .env("HSP_AGENT_ID", &agent_id)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LifecycleError::SpawnFailed(e.to_string()))?;

        self.processes.write().await.insert(
            agent_id.clone(),
            AgentProcessRecord {
                agent_id: agent_id.clone(),
                child,
                consecutive_failures: 0,
            },
        );

        self.wait_for_advertisement(capability_name).await?;
        Ok(agent_id)
    }

    async fn wait_for_advertisement(&self, capability_name: &str) -> Result<(), LifecycleError> {
        let deadline = self.clock.now() + chrono::Duration::from_std(self.spawn_timeout).unwrap();
        loop {
            if self.registry.find_by_name(capability_name).await.is_ok() {
                return Ok(());
            }
            if self.clock.now() >= deadline {
                return Err(LifecycleError::ReadinessTimeout {
                    agent_id: capability_name.to_string(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Check whether a tracked process has exited. A clean or dirty exit
    /// both count as one health-poll failure; three consecutive failures
    /// mark the agent unhealthy.
    pub async fn poll_health(&self, agent_id: &str) -> Result<(), LifecycleError> {
        let mut processes = self.processes.write().await;
        let record = processes
            .get_mut(agent_id)
            .ok_or_else(|| LifecycleError::Unhealthy {
                agent_id: agent_id.to_string(),
            })?;

        match record.child.try_wait() {
            Ok(None) => {
                record.consecutive_failures = 0;
                Ok(())
            }
            Ok(Some(_)) | Err(_) => {
                record.consecutive_failures += 1;
                if record.consecutive_failures >= self.unhealthy_threshold {
                    warn!("agent {} unhealthy after {} failed polls", agent_id, record.consecutive_failures);
                    Err(LifecycleError::Unhealthy {
                        agent_id: agent_id.to_string(),
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn health_poll_interval(&self) -> Duration {
        self.health_poll_interval
    }

    /// Terminate one tracked agent process. Its registry entry is left alone:
    /// the registry learns of agents and their departures over the bus, not
    /// by the lifecycle manager reaching into it directly, so a killed
    /// process's advertisement simply ages out via the background eviction
    /// task once it stops being refreshed.
    pub async fn shutdown(&self, agent_id: &str) -> Result<(), LifecycleError> {
        if let Some(mut record) = self.processes.write().await.remove(agent_id) {
            let _ = record.child.kill().await;
        }
        Ok(())
    }

    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.processes.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.shutdown(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsp::clock::SystemClock;
    use crate::hsp::messages::CapabilityAdvertisement;
    use crate::hsp::trust::ConstantTrustPolicy;

    fn lifecycle() -> AgentLifecycleManager {
        let registry = Arc::new(ServiceRegistry::new(
            Arc::new(ConstantTrustPolicy::default()),
            Arc::new(SystemClock),
        ));
        AgentLifecycleManager::new(registry, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn ensure_running_skips_spawn_when_already_advertised() {
        let lm = lifecycle();
        lm.registry
            .advertise(
                CapabilityAdvertisement::new("c1", "already-running", "arithmetic", "1.0.0"),
                "already-running",
            )
            .await;
        // No recipe registered at all; if this tried to spawn it would fail with NoLaunchRecipe.
        let agent_id = lm.ensure_running("arithmetic").await.unwrap();
        assert_eq!(agent_id, "already-running");
    }

    #[tokio::test]
    async fn ensure_running_without_a_recipe_fails_fast() {
        let lm = lifecycle();
        let err = lm.ensure_running("weather").await.unwrap_err();
        assert!(matches!(err, LifecycleError::NoLaunchRecipe { .. }));
    }

    #[tokio::test]
    async fn ensure_running_times_out_if_spawned_agent_never_advertises() {
        let lm = lifecycle().with_spawn_timeout(Duration::from_millis(200));
        lm.register_recipe("never-advertised", LaunchRecipe::new("sleep", vec!["5".to_string()]))
            .await;
        let err = lm.ensure_running("never-advertised").await.unwrap_err();
        assert!(matches!(err, LifecycleError::ReadinessTimeout { .. }));
        lm.shutdown_all().await;
    }
}
