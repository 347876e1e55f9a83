//! Hand-rolled error types for each component, following this codebase's
//! convention of implementing `Display` and `std::error::Error` directly
//! instead of pulling in an error-derive crate.

use std::fmt;

/// Transport-level failures: disconnects, send failures, exhausted reconnects.
#[derive(Debug)]
pub enum BusError {
    NotConnected,
    SendFailed(String),
    ReconnectExhausted { attempts: u32 },
    CorrelationTimeout { message_id: String },
    /// A `requires_ack` publish exhausted its resend attempts without a
    /// matching acknowledgement ever arriving.
    Nacked { message_id: String },
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::NotConnected => write!(f, "bus connector is not connected"),
            BusError::SendFailed(reason) => write!(f, "send failed: {}", reason),
            BusError::ReconnectExhausted { attempts } => {
                write!(f, "gave up reconnecting after {} attempts", attempts)
            }
            BusError::CorrelationTimeout { message_id } => {
                write!(f, "timed out waiting for a response to {}", message_id)
            }
            BusError::Nacked { message_id } => {
                write!(f, "message {} was never acknowledged after every resend attempt", message_id)
            }
        }
    }
}

impl std::error::Error for BusError {}

/// Discovery failures from the Service Registry.
#[derive(Debug)]
pub enum RegistryError {
    CapabilityNotFound { filter: String },
    StaleAdvertisement { capability_id: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::CapabilityNotFound { filter } => {
                write!(f, "no capability matched filter {}", filter)
            }
            RegistryError::StaleAdvertisement { capability_id } => {
                write!(f, "advertisement {} exceeded its staleness ttl", capability_id)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Failures spawning or monitoring a specialist agent process.
#[derive(Debug)]
pub enum LifecycleError {
    NoLaunchRecipe { capability_name: String },
    SpawnFailed(String),
    ReadinessTimeout { agent_id: String },
    Unhealthy { agent_id: String },
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::NoLaunchRecipe { capability_name } => {
                write!(f, "no launch recipe registered for capability {}", capability_name)
            }
            LifecycleError::SpawnFailed(reason) => write!(f, "spawn failed: {}", reason),
            LifecycleError::ReadinessTimeout { agent_id } => {
                write!(f, "agent {} did not become ready before its spawn timeout", agent_id)
            }
            LifecycleError::Unhealthy { agent_id } => {
                write!(f, "agent {} failed consecutive health polls", agent_id)
            }
        }
    }
}

impl std::error::Error for LifecycleError {}

/// Planning, scheduling, and dispatch failures from the Project Coordinator.
#[derive(Debug)]
pub enum CoordinatorError {
    PlanningFailed(String),
    CyclicDependency { subtask: String },
    DuplicateSubtaskName { name: String },
    UnknownDependency { subtask: String, dependency: String },
    ParameterSubstitutionFailed { subtask: String, reference: String },
    SubtaskFailed { subtask: String, reason: String },
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::PlanningFailed(reason) => write!(f, "planning failed: {}", reason),
            CoordinatorError::CyclicDependency { subtask } => {
                write!(f, "dependency cycle detected at subtask {}", subtask)
            }
            CoordinatorError::DuplicateSubtaskName { name } => {
                write!(f, "subtask name {} is used more than once in the plan", name)
            }
            CoordinatorError::UnknownDependency { subtask, dependency } => write!(
                f,
                "subtask {} depends on {}, which is not in the plan",
                subtask, dependency
            ),
            CoordinatorError::ParameterSubstitutionFailed { subtask, reference } => write!(
                f,
                "subtask {} references unresolved output {}",
                subtask, reference
            ),
            CoordinatorError::SubtaskFailed { subtask, reason } => {
                write!(f, "subtask {} failed: {}", subtask, reason)
            }
        }
    }
}

impl std::error::Error for CoordinatorError {}

/// Fact-ingestion failures: contradictions and quarantine due to low trust.
#[derive(Debug)]
pub enum IngestError {
    Contradiction { semantic_key: String },
    Quarantined { fact_id: String, effective_confidence: f64 },
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Contradiction { semantic_key } => {
                write!(f, "contradictory facts for semantic key {}", semantic_key)
            }
            IngestError::Quarantined {
                fact_id,
                effective_confidence,
            } => write!(
                f,
                "fact {} quarantined, effective confidence {:.3} below floor",
                fact_id, effective_confidence
            ),
        }
    }
}

impl std::error::Error for IngestError {}

/// Crate-wide error, aggregating every component's error type.
///
/// Downstream callers who only want one `?`-friendly error type can convert
/// into this via the `From` impls below, rather than matching on each
/// component error individually.
#[derive(Debug)]
pub enum OrchestratorError {
    Bus(BusError),
    Registry(RegistryError),
    Lifecycle(LifecycleError),
    Coordinator(CoordinatorError),
    Ingest(IngestError),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::Bus(e) => write!(f, "{}", e),
            OrchestratorError::Registry(e) => write!(f, "{}", e),
            OrchestratorError::Lifecycle(e) => write!(f, "{}", e),
            OrchestratorError::Coordinator(e) => write!(f, "{}", e),
            OrchestratorError::Ingest(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<BusError> for OrchestratorError {
    fn from(e: BusError) -> Self {
        OrchestratorError::Bus(e)
    }
}

impl From<RegistryError> for OrchestratorError {
    fn from(e: RegistryError) -> Self {
        OrchestratorError::Registry(e)
    }
}

impl From<LifecycleError> for OrchestratorError {
    fn from(e: LifecycleError) -> Self {
        OrchestratorError::Lifecycle(e)
    }
}

impl From<CoordinatorError> for OrchestratorError {
    fn from(e: CoordinatorError) -> Self {
        OrchestratorError::Coordinator(e)
    }
}

impl From<IngestError> for OrchestratorError {
    fn from(e: IngestError) -> Self {
        OrchestratorError::Ingest(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_errors_convert_into_the_aggregate() {
        let e: OrchestratorError = BusError::NotConnected.into();
        assert!(e.to_string().contains("not connected"));

        let e: OrchestratorError = RegistryError::CapabilityNotFound {
            filter: "name=arithmetic".to_string(),
        }
        .into();
        assert!(e.to_string().contains("arithmetic"));
    }

    #[test]
    fn display_messages_are_informative() {
        let e = LifecycleError::ReadinessTimeout {
            agent_id: "agent-1".to_string(),
        };
        assert!(e.to_string().contains("agent-1"));
    }
}
