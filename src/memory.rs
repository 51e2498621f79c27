//! In-process memory transport.
//!
//! Implements the full transport contract against the owning bus itself:
//! producing looks up the consumers subscribed to the path and runs each one
//! through the consumer pipeline on the caller's task, in subscription
//! order. Replies settle the bus's pending registry synchronously.
//!
//! With serialization disabled (the default) handlers observe the
//! producer's original value. Enabling serialization round-trips the whole
//! envelope through the wire codec, giving value semantics to headers and
//! payload alike.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tracing::debug;

use crate::consumer::ConsumerSpec;
use crate::error::BusError;
use crate::headers::{decode_envelope, encode_envelope};
use crate::producer::ProducerSpec;
use crate::serializer::{CodecSerializer, Envelope, NullSerializer, Payload, Serializer};
use crate::transport::{ProduceRequest, ReplySink, Transport, TransportContext};

/// Loopback transport delivering messages to in-process consumers.
pub struct MemoryTransport {
    name: Arc<str>,
    serialize_on_loopback: bool,
    /// Per-message scopes default off for the memory transport.
    scope_default: bool,

    producer_specs: Vec<Arc<ProducerSpec>>,
    consumers: HashMap<String, Vec<Arc<ConsumerSpec>>>,
    serializer: Arc<dyn Serializer>,
    ctx: ArcSwapOption<TransportContext>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport").finish_non_exhaustive()
    }
}

impl MemoryTransport {
    #[must_use]
    pub fn builder(name: impl Into<String>) -> MemoryTransportBuilder {
        MemoryTransportBuilder {
            name: name.into(),
            enable_serialization: false,
            producers: Vec::new(),
            consumers: Vec::new(),
        }
    }

    /// Build the envelope one consumer will observe.
    fn loopback_envelope(&self, request: &ProduceRequest) -> Result<Envelope, BusError> {
        if self.serialize_on_loopback {
            let Some(bytes) = request.payload.as_bytes() else {
                return Err(BusError::serialization(
                    request.type_name,
                    "serialization enabled but payload is a loopback sentinel",
                ));
            };
            // Round-trip the full envelope so the consumer side observes a
            // value copy of the headers as well as the payload.
            let encoded = encode_envelope(&request.headers, bytes)?;
            let (headers, payload) = decode_envelope(&encoded)?;
            Ok(Envelope {
                headers,
                payload: Payload::Bytes(payload),
            })
        } else {
            Ok(Envelope {
                headers: request.headers.clone(),
                payload: request.payload.clone(),
            })
        }
    }
}

#[async_trait]
impl ReplySink for MemoryTransport {
    async fn deliver_reply(&self, request_id: &str, envelope: Envelope) -> Result<(), BusError> {
        let Some(ctx) = self.ctx.load_full() else {
            return Err(BusError::BusStopped);
        };
        if !ctx.pending.settle(request_id, envelope) {
            debug!(transport = %self.name, request_id, "reply matched no pending request");
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn producer_specs(&self) -> Vec<Arc<ProducerSpec>> {
        self.producer_specs.clone()
    }

    fn serializer(&self) -> Arc<dyn Serializer> {
        self.serializer.clone()
    }

    async fn produce(&self, request: ProduceRequest) -> Result<(), BusError> {
        let Some(ctx) = self.ctx.load_full() else {
            return Err(BusError::BusStopped);
        };
        let Some(consumers) = self.consumers.get(&request.path) else {
            debug!(transport = %self.name, path = %request.path, "no consumers subscribed");
            return Ok(());
        };
        // Sequential fan-out on the caller's task preserves produce order
        // per path. Consumer-mode handler failures propagate to the caller;
        // an in-process loopback has no dead-letter channel to divert to.
        for spec in consumers {
            let envelope = self.loopback_envelope(&request)?;
            ctx.pipeline
                .process(
                    spec,
                    envelope,
                    self.serializer.as_ref(),
                    self,
                    self.scope_default,
                    request.cancel.clone(),
                )
                .await?;
        }
        Ok(())
    }

    async fn start(&self, ctx: TransportContext) -> anyhow::Result<()> {
        self.ctx.store(Some(Arc::new(ctx)));
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.ctx.store(None);
        Ok(())
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        self.ctx.store(None);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryTransportBuilder
// ---------------------------------------------------------------------------

/// Builder for [`MemoryTransport`].
pub struct MemoryTransportBuilder {
    name: String,
    enable_serialization: bool,
    producers: Vec<Arc<ProducerSpec>>,
    consumers: Vec<Arc<ConsumerSpec>>,
}

impl MemoryTransportBuilder {
    /// Toggle serialize-on-loopback. Off, handlers receive the original
    /// message instance; on, they receive a decoded clone.
    #[must_use]
    pub fn enable_serialization(mut self, enabled: bool) -> Self {
        self.enable_serialization = enabled;
        self
    }

    /// Register a producer spec on this transport.
    #[must_use]
    pub fn produce(mut self, spec: ProducerSpec) -> Self {
        self.producers.push(Arc::new(spec));
        self
    }

    /// Subscribe a consumer spec on this transport.
    #[must_use]
    pub fn consume(mut self, spec: ConsumerSpec) -> Self {
        self.consumers.push(Arc::new(spec));
        self
    }

    /// Finish the transport.
    ///
    /// # Errors
    ///
    /// `Configuration` when the same consumer type is subscribed twice on
    /// one path.
    pub fn build(self) -> Result<MemoryTransport, BusError> {
        let mut consumers: HashMap<String, Vec<Arc<ConsumerSpec>>> = HashMap::new();
        for spec in self.consumers {
            let subscribed = consumers.entry(spec.path.clone()).or_default();
            if subscribed
                .iter()
                .any(|existing| existing.consumer_type == spec.consumer_type)
            {
                return Err(BusError::Configuration(format!(
                    "consumer {} is subscribed twice on path {}",
                    spec.consumer_type_name, spec.path
                )));
            }
            subscribed.push(spec);
        }
        let serializer: Arc<dyn Serializer> = if self.enable_serialization {
            Arc::new(CodecSerializer)
        } else {
            Arc::new(NullSerializer)
        };
        Ok(MemoryTransport {
            name: Arc::from(self.name.as_str()),
            serialize_on_loopback: self.enable_serialization,
            scope_default: false,
            producer_specs: self.producers,
            consumers,
            serializer,
            ctx: ArcSwapOption::empty(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
