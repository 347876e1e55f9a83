//! The Specialist Agent Runtime: the advertise/subscribe/dispatch/emit loop
//! every specialist embeds, so a specialist implementation only has to
//! provide the handler closure.
//!
//! Mirrors this codebase's per-agent setup in `Orchestration` plus the
//! `ToolProtocol::execute` dispatch shape from the tool layer: a single
//! trait method takes a typed request and returns a typed result, and the
//! runtime is responsible for everything around that call.

use crate::hsp::bus::BusConnector;
use crate::hsp::envelope::Envelope;
use crate::hsp::messages::{
    CapabilityAdvertisement, ErrorDetails, TaskRequest, TaskResult, ADVERTISEMENTS_TOPIC,
};
use async_trait::async_trait;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// The work a specialist actually does: take a request's parameters and
/// produce a result payload.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, request: &TaskRequest) -> Result<serde_json::Value, String>;
}

/// Runs the advertise/subscribe/dispatch/emit loop for one specialist agent.
///
/// Advertisements go out over the bus rather than straight into a
/// [`ServiceRegistry`](crate::hsp::registry::ServiceRegistry): this runtime
/// has no registry dependency at all, so a specialist running in its own
/// process talks to the registry the same way it talks to every other
/// agent, as a peer on the bus.
pub struct SpecialistAgentRuntime {
    bus: Arc<BusConnector>,
    advertisement: CapabilityAdvertisement,
    handler: Arc<dyn TaskHandler>,
    readvertise_interval: Duration,
}

impl SpecialistAgentRuntime {
    pub fn new(
        bus: Arc<BusConnector>,
        advertisement: CapabilityAdvertisement,
        handler: Arc<dyn TaskHandler>,
        staleness_ttl: Duration,
    ) -> Self {
        Self {
            bus,
            advertisement,
            handler,
            readvertise_interval: staleness_ttl / 2,
        }
    }

    /// Advertise once, then process inbound task requests until the
    /// subscription stream ends (e.g. on shutdown), re-advertising on a
    /// timer so the registry never lets this agent go stale while it's
    /// alive.
    pub async fn run(&self) {
        self.publish_advertisement().await;
        info!(
            "specialist {} advertised capability {}",
            self.advertisement.agent_id, self.advertisement.name
        );

        let topic = format!("hsp/tasks/{}", self.advertisement.agent_id);
        let mut inbound = match self.bus.subscribe(&topic).await {
            Ok(sub) => sub,
            Err(e) => {
                error!("specialist {} failed to subscribe to {}: {}", self.advertisement.agent_id, topic, e);
                return;
            }
        };

        let mut readvertise = tokio::time::interval(self.readvertise_interval);
        readvertise.tick().await; // first tick fires immediately; already advertised above.

        loop {
            tokio::select! {
                maybe_envelope = inbound.recv() => {
                    match maybe_envelope {
                        Some(envelope) => self.dispatch(envelope).await,
                        None => break,
                    }
                }
                _ = readvertise.tick() => {
                    self.publish_advertisement().await;
                }
            }
        }

        let offline = self.advertisement.clone().offline();
        let envelope = Envelope::publish(
            offline.agent_id.clone(),
            ADVERTISEMENTS_TOPIC,
            "capability-advertisement/1.0",
            serde_json::to_value(&offline).unwrap(),
        );
        let _ = self.bus.publish(envelope).await;
        info!("specialist {} shutting down, advertisement withdrawn", self.advertisement.agent_id);
    }

    /// Publish this specialist's capability advertisement to the
    /// well-known advertisements topic. Any `ServiceRegistry` listening on
    /// that topic picks it up the same way it would pick up a relayed
    /// advertisement from another agent.
    async fn publish_advertisement(&self) {
        let envelope = Envelope::publish(
            self.advertisement.agent_id.clone(),
            ADVERTISEMENTS_TOPIC,
            "capability-advertisement/1.0",
            serde_json::to_value(&self.advertisement).unwrap(),
        );
        if let Err(e) = self.bus.publish(envelope).await {
            error!(
                "specialist {} failed to publish advertisement: {}",
                self.advertisement.agent_id, e
            );
        }
    }

    async fn dispatch(&self, envelope: Envelope) {
        let request: TaskRequest = match serde_json::from_value(envelope.payload.clone()) {
            Ok(req) => req,
            Err(e) => {
                warn!("specialist {} dropped malformed task request: {}", self.advertisement.agent_id, e);
                return;
            }
        };

        let _ = self.bus.ack(&envelope).await;

        let result = match self.handler.handle(&request).await {
            Ok(payload) => TaskResult::success(
                Uuid::new_v4().to_string(),
                request.request_id.clone(),
                self.advertisement.agent_id.clone(),
                payload,
            ),
            Err(reason) => TaskResult::failure(
                Uuid::new_v4().to_string(),
                request.request_id.clone(),
                self.advertisement.agent_id.clone(),
                ErrorDetails::new("EXECUTION_FAILED", reason),
            ),
        };

        let response = Envelope::response(
            self.advertisement.agent_id.clone(),
            envelope.sender_id.clone(),
            envelope.message_id.clone(),
            "task-result/1.0",
            serde_json::to_value(&result).unwrap(),
        );

        if let Err(e) = self.bus.publish(response).await {
            error!("specialist {} failed to publish result: {}", self.advertisement.agent_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsp::bus::BusTransport;
    use crate::hsp::local_transport::{LocalBroker, LocalBusTransport};
    use crate::hsp::messages::CapabilityFilter;

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn handle(&self, request: &TaskRequest) -> Result<serde_json::Value, String> {
            Ok(serde_json::to_value(&request.parameters).unwrap())
        }
    }

    #[tokio::test]
    async fn dispatch_publishes_a_success_result_for_a_valid_request() {
        let broker = LocalBroker::new();
        let specialist_transport = Arc::new(LocalBusTransport::new(broker.clone()));
        let caller_transport = Arc::new(LocalBusTransport::new(broker.clone()));
        specialist_transport.connect().await.unwrap();
        caller_transport.connect().await.unwrap();

        let specialist_bus = Arc::new(BusConnector::new("echo-agent", specialist_transport));
        specialist_bus.connect().await.unwrap();
        let caller_bus = Arc::new(BusConnector::new("caller", caller_transport));
        caller_bus.connect().await.unwrap();

        let advertisement = CapabilityAdvertisement::new("c1", "echo-agent", "echo", "1.0.0");
        let runtime = SpecialistAgentRuntime::new(
            specialist_bus.clone(),
            advertisement,
            Arc::new(EchoHandler),
            Duration::from_secs(60),
        );

        let runtime_handle = tokio::spawn(async move { runtime.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut params = std::collections::HashMap::new();
        params.insert("x".to_string(), serde_json::json!(1));
        let request = TaskRequest::new(
            "req-1",
            "caller",
            CapabilityFilter::Name("echo".to_string()),
            "caller",
        )
        .with_parameters(params.clone());

        let envelope = Envelope::request(
            "caller",
            "hsp/tasks/echo-agent",
            "task-request/1.0",
            serde_json::to_value(&request).unwrap(),
        );

        let response = caller_bus.request(envelope, Duration::from_secs(1)).await.unwrap();
        let result: TaskResult = serde_json::from_value(response.payload).unwrap();
        assert!(result.is_success());
        assert_eq!(result.payload.unwrap()["x"], serde_json::json!(1));

        runtime_handle.abort();
    }
}
