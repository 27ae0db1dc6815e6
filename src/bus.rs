//! Abstract message-bus source the Ingest Orchestrator consumes, plus a
//! NATS-backed default adapter (§9: do not couple consumers to a
//! particular transport; concrete message-bus client is an external
//! collaborator).

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connect failed: {0}")]
    Connect(String),
    #[error("bus subscribe failed: {0}")]
    Subscribe(String),
}

pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Port the Ingest Orchestrator depends on. A concrete adapter owns the
/// subscription lifecycle and hands messages to the caller one at a time.
#[async_trait]
pub trait BusSource: Send + Sync {
    async fn recv(&mut self) -> Option<BusMessage>;
    async fn close(&mut self);
}

/// `async-nats`-backed adapter subscribing to the FANET topic grammar
/// `fb/b/{chipId}/f/{type}` (expressed with NATS wildcards as `fb.b.*.f.*`).
pub struct NatsBusSource {
    subscriber: async_nats::Subscriber,
}

impl NatsBusSource {
    pub async fn connect(url: &str, subject: &str) -> Result<Self, BusError> {
        let client = async_nats::connect(url).await.map_err(|e| BusError::Connect(e.to_string()))?;
        let subscriber = client.subscribe(subject.to_string()).await.map_err(|e| BusError::Subscribe(e.to_string()))?;
        Ok(Self { subscriber })
    }
}

#[async_trait]
impl BusSource for NatsBusSource {
    async fn recv(&mut self) -> Option<BusMessage> {
        let msg = self.subscriber.next().await?;
        Some(BusMessage {
            topic: msg.subject.to_string().replace('.', "/"),
            payload: msg.payload.to_vec(),
        })
    }

    async fn close(&mut self) {
        let _ = self.subscriber.unsubscribe().await;
    }
}
