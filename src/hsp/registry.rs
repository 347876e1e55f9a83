//! The Service Registry: a live, trust-weighted index of advertised
//! capabilities.
//!
//! Shaped after this codebase's `ToolRegistry`: a `HashMap`-backed store
//! guarded by an async lock, with upsert/remove/find methods and a
//! background task doing periodic cleanup (there it's nothing in
//! particular; here it's staleness eviction).

use crate::hsp::bus::BusConnector;
use crate::hsp::clock::Clock;
use crate::hsp::config::OrchestratorConfig;
use crate::hsp::error::RegistryError;
use crate::hsp::messages::{Availability, CapabilityAdvertisement};
use crate::hsp::trust::TrustPolicy;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Default time-to-live for an advertisement since its last refresh before
/// the registry considers it stale and evicts it.
pub const DEFAULT_STALENESS_TTL: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct Entry {
    advertisement: CapabilityAdvertisement,
    last_seen: DateTime<Utc>,
    /// The agent that handed us this advertisement, which may differ from
    /// `advertisement.agent_id` if it arrived relayed rather than direct.
    /// Trust is computed from this, not from the advertisement's own claim.
    direct_sender_id: String,
}

/// A capability advertisement plus the trust score it was ranked with.
#[derive(Debug, Clone)]
pub struct RankedCapability {
    pub advertisement: CapabilityAdvertisement,
    pub trust: f64,
}

/// Keeps the live set of advertised capabilities, keyed by
/// `(agent_id, capability_id)`. Re-advertising the same key refreshes its
/// `last_seen` timestamp rather than creating a duplicate entry.
pub struct ServiceRegistry {
    entries: RwLock<HashMap<(String, String), Entry>>,
    trust_policy: Arc<dyn TrustPolicy>,
    clock: Arc<dyn Clock>,
    staleness_ttl: Duration,
}

impl ServiceRegistry {
    pub fn new(trust_policy: Arc<dyn TrustPolicy>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            trust_policy,
            clock,
            staleness_ttl: DEFAULT_STALENESS_TTL,
        }
    }

    pub fn with_staleness_ttl(mut self, ttl: Duration) -> Self {
        self.staleness_ttl = ttl;
        self
    }

    /// Apply the relevant fields of an [`OrchestratorConfig`] to this registry.
    pub fn with_config(mut self, config: &OrchestratorConfig) -> Self {
        self.staleness_ttl = config.advertisement_staleness_ttl;
        self
    }

    /// Insert or refresh an advertisement. Keyed by `(agent_id, capability_id)`
    /// so the same agent re-advertising the same capability updates in place.
    ///
    /// `direct_sender_id` is whoever handed us this advertisement on the wire,
    /// which may not be `advertisement.agent_id` if it arrived relayed through
    /// another agent. Trust is always computed from the direct sender.
    pub async fn advertise(&self, advertisement: CapabilityAdvertisement, direct_sender_id: impl Into<String>) {
        let key = (
            advertisement.agent_id.clone(),
            advertisement.capability_id.clone(),
        );
        let entry = Entry {
            advertisement,
            last_seen: self.clock.now(),
            direct_sender_id: direct_sender_id.into(),
        };
        self.entries.write().await.insert(key, entry);
    }

    pub async fn withdraw(&self, agent_id: &str, capability_id: &str) {
        self.entries
            .write()
            .await
            .remove(&(agent_id.to_string(), capability_id.to_string()));
    }

    /// Remove every advertisement made by `agent_id`, e.g. on agent shutdown.
    pub async fn withdraw_all_for_agent(&self, agent_id: &str) {
        self.entries
            .write()
            .await
            .retain(|(owner, _), _| owner != agent_id);
    }

    /// Drop advertisements whose `last_seen` is older than the staleness TTL.
    /// Returns how many were evicted, for logging at the call site.
    pub async fn evict_stale(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.staleness_ttl;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            now.signed_duration_since(entry.last_seen)
                .to_std()
                .map(|age| age < ttl)
                .unwrap_or(true)
        });
        before - entries.len()
    }

    pub async fn list_all(&self) -> Vec<CapabilityAdvertisement> {
        self.entries
            .read()
            .await
            .values()
            .map(|e| e.advertisement.clone())
            .collect()
    }

    /// Find every online advertisement matching `capability_id`, ranked by
    /// trust (desc), then version (desc), then capability id (lexicographic)
    /// as a deterministic final tie-break.
    pub async fn find_by_id(&self, capability_id: &str) -> Result<Vec<RankedCapability>, RegistryError> {
        let matches = self.rank(|ad| ad.capability_id == capability_id).await;
        if matches.is_empty() {
            return Err(RegistryError::CapabilityNotFound {
                filter: format!("id={}", capability_id),
            });
        }
        Ok(matches)
    }

    /// Find every online advertisement whose `name` matches, same ranking as
    /// [`ServiceRegistry::find_by_id`].
    pub async fn find_by_name(&self, name: &str) -> Result<Vec<RankedCapability>, RegistryError> {
        let matches = self.rank(|ad| ad.name == name).await;
        if matches.is_empty() {
            return Err(RegistryError::CapabilityNotFound {
                filter: format!("name={}", name),
            });
        }
        Ok(matches)
    }

    async fn rank(&self, predicate: impl Fn(&CapabilityAdvertisement) -> bool) -> Vec<RankedCapability> {
        let entries = self.entries.read().await;
        let mut matches: Vec<RankedCapability> = entries
            .values()
            .filter(|e| e.advertisement.availability == Availability::Online)
            .filter(|e| predicate(&e.advertisement))
            .map(|e| RankedCapability {
                trust: self.trust_policy.trust_of(&e.direct_sender_id),
                advertisement: e.advertisement.clone(),
            })
            .collect();

        matches.sort_by(|a, b| {
            b.trust
                .partial_cmp(&a.trust)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.advertisement.version.cmp(&a.advertisement.version))
                .then_with(|| a.advertisement.capability_id.cmp(&b.advertisement.capability_id))
        });
        matches
    }

    /// Spawn a background task that calls [`ServiceRegistry::evict_stale`] on
    /// a cadence of roughly a third of the staleness TTL, so an agent that
    /// vanishes without withdrawing eventually falls out of discovery on its
    /// own. Safe to call at most once per registry; callers own ensuring that.
    pub fn spawn_eviction_task(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let interval = (registry.staleness_ttl / 3).max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let evicted = registry.evict_stale().await;
                if evicted > 0 {
                    debug!("evicted {} stale advertisement(s)", evicted);
                }
            }
        });
    }

    /// Subscribe to `topic` on `bus` and advertise every capability
    /// advertisement that arrives on it, attributing trust to the envelope's
    /// sender rather than to whatever agent_id the advertisement itself
    /// claims. Runs until the subscription ends; callers `tokio::spawn` this.
    pub async fn run_bus_listener(&self, bus: Arc<BusConnector>, topic: &str) {
        let mut inbox = match bus.subscribe(topic).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("registry bus listener failed to subscribe to {}: {}", topic, e);
                return;
            }
        };
        while let Some(envelope) = inbox.recv().await {
            match serde_json::from_value::<CapabilityAdvertisement>(envelope.payload.clone()) {
                Ok(ad) => self.advertise(ad, envelope.sender_id.clone()).await,
                Err(e) => warn!("dropped malformed capability advertisement: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsp::clock::SystemClock;
    use crate::hsp::trust::ConstantTrustPolicy;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(
            Arc::new(ConstantTrustPolicy::default().with_override("trusted", 0.9)),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn find_by_name_returns_empty_set_as_not_found() {
        let reg = registry();
        let err = reg.find_by_name("arithmetic").await.unwrap_err();
        assert!(matches!(err, RegistryError::CapabilityNotFound { .. }));
    }

    #[tokio::test]
    async fn higher_trust_ranks_first() {
        let reg = registry();
        reg.advertise(CapabilityAdvertisement::new("c1", "untrusted", "arithmetic", "1.0.0"), "untrusted")
            .await;
        reg.advertise(CapabilityAdvertisement::new("c2", "trusted", "arithmetic", "1.0.0"), "trusted")
            .await;

        let ranked = reg.find_by_name("arithmetic").await.unwrap();
        assert_eq!(ranked[0].advertisement.agent_id, "trusted");
    }

    #[tokio::test]
    async fn trust_follows_the_direct_sender_not_the_advertisement_owner() {
        let reg = registry();
        // A capability "owned" by an untrusted agent, but relayed to us by a
        // trusted one, should rank as trusted.
        reg.advertise(
            CapabilityAdvertisement::new("c1", "untrusted", "arithmetic", "1.0.0"),
            "trusted",
        )
        .await;
        let ranked = reg.find_by_name("arithmetic").await.unwrap();
        assert_eq!(ranked[0].trust, 0.9);
    }

    #[tokio::test]
    async fn offline_advertisements_are_excluded() {
        let reg = registry();
        reg.advertise(CapabilityAdvertisement::new("c1", "a1", "arithmetic", "1.0.0").offline(), "a1")
            .await;
        let err = reg.find_by_name("arithmetic").await.unwrap_err();
        assert!(matches!(err, RegistryError::CapabilityNotFound { .. }));
    }

    #[tokio::test]
    async fn re_advertising_same_key_does_not_duplicate() {
        let reg = registry();
        reg.advertise(CapabilityAdvertisement::new("c1", "a1", "arithmetic", "1.0.0"), "a1").await;
        reg.advertise(CapabilityAdvertisement::new("c1", "a1", "arithmetic", "1.0.1"), "a1").await;
        assert_eq!(reg.list_all().await.len(), 1);
    }

    #[tokio::test]
    async fn withdraw_all_for_agent_removes_only_that_agents_entries() {
        let reg = registry();
        reg.advertise(CapabilityAdvertisement::new("c1", "a1", "arithmetic", "1.0.0"), "a1").await;
        reg.advertise(CapabilityAdvertisement::new("c2", "a2", "weather", "1.0.0"), "a2").await;
        reg.withdraw_all_for_agent("a1").await;
        let remaining = reg.list_all().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].agent_id, "a2");
    }

    #[tokio::test]
    async fn background_eviction_task_removes_stale_entries_without_manual_calls() {
        let reg = Arc::new(registry().with_staleness_ttl(Duration::from_millis(50)));
        reg.advertise(CapabilityAdvertisement::new("c1", "a1", "arithmetic", "1.0.0"), "a1")
            .await;
        reg.spawn_eviction_task();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(reg.list_all().await.is_empty());
    }
}
