//! Transport contract implemented by every backend.
//!
//! Transports are registered with the bus at build time, started in
//! registration order and stopped/disposed in reverse. At start each
//! transport receives a [`TransportContext`] wiring it to the consumer
//! pipeline and the pending-request registry of its owning bus.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::BusError;
use crate::headers::Headers;
use crate::message::AnyMessage;
use crate::pending::PendingRequestStore;
use crate::pipeline::ConsumerPipeline;
use crate::producer::ProducerSpec;
use crate::serializer::{Envelope, Payload, Serializer};

/// Everything the producer pipeline hands a transport for one message.
pub struct ProduceRequest {
    pub type_name: &'static str,
    pub message: AnyMessage,
    pub path: String,
    pub payload: Payload,
    pub headers: Headers,
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for ProduceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProduceRequest")
            .field("type_name", &self.type_name)
            .field("path", &self.path)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// Bus services handed to a transport when it starts.
#[derive(Clone)]
pub struct TransportContext {
    pub pipeline: Arc<ConsumerPipeline>,
    pub pending: Arc<PendingRequestStore>,
    /// Reply-to address of the owning bus.
    pub bus_instance: Arc<str>,
}

/// Delivery side of request/response: routes a reply envelope back to the
/// pending registry of the bus the request originated from.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver_reply(&self, request_id: &str, envelope: Envelope) -> Result<(), BusError>;
}

/// A backend that actually delivers messages.
#[async_trait]
pub trait Transport: ReplySink {
    /// Unique transport name referenced by the routing table.
    fn name(&self) -> &str;

    /// Producer registrations this transport owns, aggregated into the
    /// routing table at bus build.
    fn producer_specs(&self) -> Vec<Arc<ProducerSpec>>;

    /// The payload serializer configured for this transport.
    fn serializer(&self) -> Arc<dyn Serializer>;

    /// Hand one serialized message to the backend.
    async fn produce(&self, request: ProduceRequest) -> Result<(), BusError>;

    /// Wire the transport to its bus and begin accepting messages.
    async fn start(&self, ctx: TransportContext) -> anyhow::Result<()>;

    /// Stop accepting messages. In-flight work is drained by the bus.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Release backend resources. Called once, after stop.
    async fn dispose(&self) -> anyhow::Result<()>;
}
