//! An in-process, single-binary reference implementation of [`BusTransport`].
//!
//! No concrete message-bus product is mandated; this transport exists so the
//! rest of the crate (and its tests) have something real to run against.
//! Topics are matched by exact string equality against the envelope's
//! `recipient` field, broadcast to every live subscriber of that topic.

use crate::hsp::bus::{BusTransport, Subscription};
use crate::hsp::envelope::Envelope;
use crate::hsp::error::BusError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Shared in-process message broker. Multiple [`LocalBusTransport`] handles
/// can share one broker to simulate multiple agents on the same bus.
#[derive(Default)]
pub struct LocalBroker {
    subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Envelope>>>>,
}

impl LocalBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn publish(&self, envelope: Envelope) {
        let subs = self.subscribers.read().await;
        if let Some(senders) = subs.get(&envelope.recipient) {
            for tx in senders {
                let _ = tx.send(envelope.clone());
            }
        }
    }

    async fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }
}

/// A [`BusTransport`] backed by a shared [`LocalBroker`]. `connect`/`disconnect`
/// only flip a local flag; there's no real socket to manage.
pub struct LocalBusTransport {
    broker: Arc<LocalBroker>,
    connected: AtomicBool,
}

impl LocalBusTransport {
    pub fn new(broker: Arc<LocalBroker>) -> Self {
        Self {
            broker,
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl BusTransport for LocalBusTransport {
    async fn connect(&self) -> Result<(), BusError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> Result<(), BusError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected);
        }
        self.broker.publish(envelope).await;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected);
        }
        Ok(self.broker.subscribe(topic).await)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
