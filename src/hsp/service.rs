//! Feature-gated HTTP surface for submitting and polling projects.
//!
//! Mirrors the teacher's optional `mcp-server` feature: `axum` + `tower`
//! routes wrapping the library's own types, gated so a pure library
//! consumer never pulls in an HTTP stack it doesn't need.

use crate::hsp::coordinator::ProjectCoordinator;
use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
struct ProjectStatus {
    project_id: String,
    answer: Option<String>,
    subtask_count: usize,
    succeeded_count: usize,
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    query: String,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    project_id: String,
}

struct AppState {
    coordinator: Arc<ProjectCoordinator>,
    statuses: RwLock<HashMap<String, ProjectStatus>>,
}

/// Build the axum router for project submission (`POST /projects`) and
/// status polling (`GET /projects/:id`), backed by the given coordinator.
pub fn router(coordinator: Arc<ProjectCoordinator>) -> Router {
    let state = Arc::new(AppState {
        coordinator,
        statuses: RwLock::new(HashMap::new()),
    });

    Router::new()
        .route("/projects", post(submit_project))
        .route("/projects/{id}", axum::routing::get(get_project_status))
        .with_state(state)
}

async fn submit_project(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitRequest>,
) -> Json<SubmitResponse> {
    let project_id = Uuid::new_v4().to_string();
    let response = SubmitResponse {
        project_id: project_id.clone(),
    };

    let state2 = state.clone();
    let pid = project_id.clone();
    tokio::spawn(async move {
        let outcome = state2.coordinator.handle_project(&request.query).await;
        let status = match outcome {
            Ok(outcome) => ProjectStatus {
                project_id: pid.clone(),
                succeeded_count: outcome
                    .subtask_results
                    .values()
                    .filter(|r| r.is_success())
                    .count(),
                subtask_count: outcome.subtask_results.len(),
                answer: outcome.answer,
            },
            Err(e) => ProjectStatus {
                project_id: pid.clone(),
                answer: None,
                subtask_count: 0,
                succeeded_count: 0,
            }
            .with_error(e.to_string()),
        };
        state2.statuses.write().await.insert(pid, status);
    });

    Json(response)
}

impl ProjectStatus {
    fn with_error(mut self, reason: String) -> Self {
        self.answer = Some(format!("error: {}", reason));
        self
    }
}

async fn get_project_status(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectStatus>, axum::http::StatusCode> {
    state
        .statuses
        .read()
        .await
        .get(&project_id)
        .cloned()
        .map(Json)
        .ok_or(axum::http::StatusCode::NOT_FOUND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsp::bus::BusConnector;
    use crate::hsp::clock::SystemClock;
    use crate::hsp::gateway::StubLlmGateway;
    use crate::hsp::lifecycle::AgentLifecycleManager;
    use crate::hsp::local_transport::{LocalBroker, LocalBusTransport};
    use crate::hsp::registry::ServiceRegistry;
    use crate::hsp::trust::ConstantTrustPolicy;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn build_router() -> Router {
        let broker = LocalBroker::new();
        let transport = Arc::new(LocalBusTransport::new(broker));
        let bus = Arc::new(BusConnector::new("coordinator", transport));
        bus.connect().await.unwrap();
        let registry = Arc::new(ServiceRegistry::new(
            Arc::new(ConstantTrustPolicy::default()),
            Arc::new(SystemClock),
        ));
        let lifecycle = Arc::new(AgentLifecycleManager::new(registry.clone(), Arc::new(SystemClock)));
        let coordinator = Arc::new(ProjectCoordinator::new(
            Arc::new(StubLlmGateway),
            registry,
            lifecycle,
            bus,
        ));
        router(coordinator)
    }

    #[tokio::test]
    async fn submitting_a_project_returns_a_project_id() {
        let app = build_router().await;
        let request = Request::builder()
            .method("POST")
            .uri("/projects")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"query": "nonexistent-capability"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn polling_an_unknown_project_id_is_not_found() {
        let app = build_router().await;
        let request = Request::builder()
            .method("GET")
            .uri("/projects/does-not-exist")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }
}
