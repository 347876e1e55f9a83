//! Typed payloads carried inside an [`Envelope`](crate::hsp::envelope::Envelope).
//!
//! These mirror the data model in the specification this crate implements:
//! capability advertisements, task requests/results, and facts. They're kept
//! deliberately flat and serde-friendly, the same way [`ToolMetadata`] and
//! [`ToolResult`] are shaped in this codebase's tool layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Availability state of a capability advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Online,
    Offline,
    Degraded,
    Maintenance,
}

/// A broadcast announcement that an agent provides a named, versioned capability.
///
/// # Example
///
/// ```
/// use hsp_orchestrator::hsp::messages::{CapabilityAdvertisement, Availability};
///
/// let ad = CapabilityAdvertisement::new("cap-1", "agent-1", "arithmetic", "1.0.0")
///     .with_description("Evaluates arithmetic expressions")
///     .with_tag("math");
/// assert_eq!(ad.availability, Availability::Online);
/// assert!(ad.tags.contains(&"math".to_string()));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityAdvertisement {
    pub capability_id: String,
    pub agent_id: String,
    pub name: String,
    pub description: String,
    pub version: semver::Version,
    pub input_schema_ref: Option<String>,
    pub input_example: Option<serde_json::Value>,
    pub output_schema_ref: Option<String>,
    pub output_example: Option<serde_json::Value>,
    pub availability: Availability,
    pub tags: Vec<String>,
    pub access_policy_id: Option<String>,
    pub data_formats: Vec<String>,
}

impl CapabilityAdvertisement {
    pub fn new(
        capability_id: impl Into<String>,
        agent_id: impl Into<String>,
        name: impl Into<String>,
        version: &str,
    ) -> Self {
        Self {
            capability_id: capability_id.into(),
            agent_id: agent_id.into(),
            name: name.into(),
            description: String::new(),
            version: semver::Version::parse(version).unwrap_or(semver::Version::new(0, 0, 0)),
            input_schema_ref: None,
            input_example: None,
            output_schema_ref: None,
            output_example: None,
            availability: Availability::Online,
            tags: Vec::new(),
            access_policy_id: None,
            data_formats: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn offline(mut self) -> Self {
        self.availability = Availability::Offline;
        self
    }
}

/// Either a specific capability, or a lookup by human name. Exactly one side
/// of a [`TaskRequest`] is populated with this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CapabilityFilter {
    Id(String),
    Name(String),
}

/// A parameter value in a [`TaskRequest`]: either a literal JSON value, or a
/// dependency reference of the shape `<output_of_subtask:name>` that the
/// Coordinator resolves before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Literal(serde_json::Value),
    DependencyRef(String),
}

const DEPENDENCY_REF_PREFIX: &str = "<output_of_subtask:";
const DEPENDENCY_REF_SUFFIX: &str = ">";

/// Topic capability advertisements are published to. Specialists publish here
/// instead of calling the registry in-process, and the registry subscribes to
/// this same topic to learn about them.
pub const ADVERTISEMENTS_TOPIC: &str = "hsp/capabilities/advertisements/all";

impl ParamValue {
    /// Parse a raw string value, recognizing the dependency-reference shape.
    pub fn from_str_value(s: &str) -> Self {
        match dependency_ref_name(s) {
            Some(name) => ParamValue::DependencyRef(name.to_string()),
            None => ParamValue::Literal(serde_json::Value::String(s.to_string())),
        }
    }
}

/// Extract the subtask name from a `<output_of_subtask:name>` string, if it matches.
pub fn dependency_ref_name(s: &str) -> Option<&str> {
    s.strip_prefix(DEPENDENCY_REF_PREFIX)
        .and_then(|rest| rest.strip_suffix(DEPENDENCY_REF_SUFFIX))
}

/// A request to execute one task, routed to a capability by id or by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub request_id: String,
    pub requester_id: String,
    pub target_agent_id: Option<String>,
    pub capability_filter: CapabilityFilter,
    pub parameters: HashMap<String, serde_json::Value>,
    pub requested_output_format: Option<String>,
    pub priority: u8,
    pub deadline: Option<DateTime<Utc>>,
    pub callback_address: String,
}

impl TaskRequest {
    pub fn new(
        request_id: impl Into<String>,
        requester_id: impl Into<String>,
        capability_filter: CapabilityFilter,
        callback_address: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            requester_id: requester_id.into(),
            target_agent_id: None,
            capability_filter,
            parameters: HashMap::new(),
            requested_output_format: None,
            priority: 3,
            deadline: None,
            callback_address: callback_address.into(),
        }
    }

    pub fn with_parameters(mut self, parameters: HashMap<String, serde_json::Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Terminal or in-flight status of a [`TaskResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failure,
    InProgress,
    Queued,
    Rejected,
}

/// Structured error information attached to a failed or rejected [`TaskResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    pub context: Option<serde_json::Value>,
}

impl ErrorDetails {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: None,
        }
    }
}

/// The outcome of executing a [`TaskRequest`].
///
/// `payload` and `error` are mutually exclusive per `status`: callers should
/// construct these via [`TaskResult::success`] / [`TaskResult::failure`]
/// rather than the struct literal, to preserve that invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub result_id: String,
    pub request_id: String,
    pub executing_agent_id: String,
    pub status: TaskStatus,
    pub payload: Option<serde_json::Value>,
    pub output_format: Option<String>,
    pub error: Option<ErrorDetails>,
    pub completed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
    pub retries: u32,
}

impl TaskResult {
    pub fn success(
        result_id: impl Into<String>,
        request_id: impl Into<String>,
        executing_agent_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            result_id: result_id.into(),
            request_id: request_id.into(),
            executing_agent_id: executing_agent_id.into(),
            status: TaskStatus::Success,
            payload: Some(payload),
            output_format: None,
            error: None,
            completed_at: Utc::now(),
            execution_time_ms: 0,
            retries: 0,
        }
    }

    pub fn failure(
        result_id: impl Into<String>,
        request_id: impl Into<String>,
        executing_agent_id: impl Into<String>,
        error: ErrorDetails,
    ) -> Self {
        Self {
            result_id: result_id.into(),
            request_id: request_id.into(),
            executing_agent_id: executing_agent_id.into(),
            status: TaskStatus::Failure,
            payload: None,
            output_format: None,
            error: Some(error),
            completed_at: Utc::now(),
            execution_time_ms: 0,
            retries: 0,
        }
    }

    /// A subtask the Coordinator never dispatched, typically because one of
    /// its dependencies failed or was itself cancelled.
    pub fn rejected(
        result_id: impl Into<String>,
        request_id: impl Into<String>,
        executing_agent_id: impl Into<String>,
        error: ErrorDetails,
    ) -> Self {
        Self {
            result_id: result_id.into(),
            request_id: request_id.into(),
            executing_agent_id: executing_agent_id.into(),
            status: TaskStatus::Rejected,
            payload: None,
            output_format: None,
            error: Some(error),
            completed_at: Utc::now(),
            execution_time_ms: 0,
            retries: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

/// The content carried by a statement-bearing fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "statement_type", rename_all = "kebab-case")]
pub enum Statement {
    NaturalLanguage { text: String },
    SemanticTriple {
        subject: String,
        predicate: String,
        object: String,
    },
    StructuredDoc { doc: serde_json::Value },
}

/// A normalized `(subject, predicate, object)` key used to detect semantic
/// duplicates even when two facts carry different ids or originating phrasing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SemanticKey {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

/// A single inbound assertion, as carried on the wire (`fact/1.0`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub fact_id: String,
    pub statement: Statement,
    pub originating_agent_id: String,
    pub upstream_source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub observed_at: Option<DateTime<Utc>>,
    pub confidence_score: f64,
    pub weight: f64,
    pub context: HashMap<String, serde_json::Value>,
    pub tags: Vec<String>,
}

impl Fact {
    pub fn triple(
        fact_id: impl Into<String>,
        originating_agent_id: impl Into<String>,
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
        confidence_score: f64,
    ) -> Self {
        Self {
            fact_id: fact_id.into(),
            statement: Statement::SemanticTriple {
                subject: subject.into(),
                predicate: predicate.into(),
                object: object.into(),
            },
            originating_agent_id: originating_agent_id.into(),
            upstream_source: None,
            created_at: Utc::now(),
            observed_at: None,
            confidence_score: confidence_score.clamp(0.0, 1.0),
            weight: 1.0,
            context: HashMap::new(),
            tags: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_ref_parses_subtask_name() {
        assert_eq!(dependency_ref_name("<output_of_subtask:t1>"), Some("t1"));
        assert_eq!(dependency_ref_name("not a ref"), None);
    }

    #[test]
    fn param_value_from_str_recognizes_dependency_ref() {
        match ParamValue::from_str_value("<output_of_subtask:fetch>") {
            ParamValue::DependencyRef(name) => assert_eq!(name, "fetch"),
            _ => panic!("expected dependency ref"),
        }
        match ParamValue::from_str_value("plain string") {
            ParamValue::Literal(serde_json::Value::String(s)) => assert_eq!(s, "plain string"),
            _ => panic!("expected literal"),
        }
    }

    #[test]
    fn task_result_success_and_failure_are_mutually_exclusive() {
        let ok = TaskResult::success("r1", "req1", "agent1", serde_json::json!({"v": 1}));
        assert!(ok.payload.is_some());
        assert!(ok.error.is_none());

        let err = TaskResult::failure("r2", "req1", "agent1", ErrorDetails::new("E", "boom"));
        assert!(err.payload.is_none());
        assert!(err.error.is_some());

        let rejected = TaskResult::rejected("r3", "req1", "coordinator", ErrorDetails::new("E", "cancelled"));
        assert_eq!(rejected.status, TaskStatus::Rejected);
        assert!(!rejected.is_success());
    }

    #[test]
    fn capability_advertisement_builder() {
        let ad = CapabilityAdvertisement::new("c1", "a1", "arithmetic", "1.0.0").with_tag("math");
        assert_eq!(ad.tags, vec!["math".to_string()]);
        assert_eq!(ad.version, semver::Version::new(1, 0, 0));
    }
}
