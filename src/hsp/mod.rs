//! A distributed multi-agent orchestrator: capability discovery over a
//! pub/sub bus, DAG-scheduled project coordination, and trust-weighted fact
//! ingestion.

pub mod bus;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod knowledge;
pub mod lifecycle;
pub mod local_transport;
pub mod messages;
pub mod registry;
pub mod runtime;
pub mod trust;

#[cfg(feature = "service")]
pub mod service;

pub use bus::{BusConnector, BusTransport};
pub use coordinator::{FailurePolicy, ProjectCoordinator, ProjectOutcome};
pub use envelope::Envelope;
pub use error::OrchestratorError;
pub use knowledge::{IngestOutcome, KnowledgeIngestor};
pub use lifecycle::AgentLifecycleManager;
pub use registry::ServiceRegistry;
pub use runtime::SpecialistAgentRuntime;
