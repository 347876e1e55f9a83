// src/lib.rs

pub mod hsp;

pub use hsp::{
    AgentLifecycleManager, BusConnector, Envelope, FailurePolicy, IngestOutcome,
    KnowledgeIngestor, OrchestratorError, ProjectCoordinator, ProjectOutcome, ServiceRegistry,
    SpecialistAgentRuntime,
};
