//! Peer trust scoring, used by the Registry to order/filter discovery results
//! and by the Knowledge Ingestor to weight incoming facts.
//!
//! The trust formula itself is left open by design: [`TrustPolicy`] is a
//! collaborator trait, following this codebase's convention of putting
//! pluggable behavior behind a trait with a sensible default implementation
//! rather than hard-coding a single formula.

use std::collections::HashMap;

/// Scores an agent's trustworthiness in `[0.0, 1.0]`.
pub trait TrustPolicy: Send + Sync {
    fn trust_of(&self, agent_id: &str) -> f64;
}

/// Returns a fixed score for unknown agents, with explicit per-agent overrides.
///
/// This is the default policy: every agent starts at 0.5 trust until an
/// operator (or a future reputation mechanism) records something different.
#[derive(Debug, Clone)]
pub struct ConstantTrustPolicy {
    default_trust: f64,
    overrides: HashMap<String, f64>,
}

impl ConstantTrustPolicy {
    pub fn new(default_trust: f64) -> Self {
        Self {
            default_trust: default_trust.clamp(0.0, 1.0),
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, agent_id: impl Into<String>, trust: f64) -> Self {
        self.overrides.insert(agent_id.into(), trust.clamp(0.0, 1.0));
        self
    }
}

impl Default for ConstantTrustPolicy {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl TrustPolicy for ConstantTrustPolicy {
    fn trust_of(&self, agent_id: &str) -> f64 {
        self.overrides
            .get(agent_id)
            .copied()
            .unwrap_or(self.default_trust)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_agent_gets_default_trust() {
        let policy = ConstantTrustPolicy::default();
        assert_eq!(policy.trust_of("stranger"), 0.5);
    }

    #[test]
    fn override_wins_over_default() {
        let policy = ConstantTrustPolicy::default().with_override("vetted-agent", 0.9);
        assert_eq!(policy.trust_of("vetted-agent"), 0.9);
        assert_eq!(policy.trust_of("other"), 0.5);
    }

    #[test]
    fn scores_are_clamped() {
        let policy = ConstantTrustPolicy::new(1.5);
        assert_eq!(policy.trust_of("x"), 1.0);
    }
}
