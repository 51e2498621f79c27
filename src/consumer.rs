//! Consumer contracts and specs.
//!
//! A [`ConsumerSpec`] binds a path to a handler type in one of two modes:
//! one-way (`Consumer`) or two-way (`RequestResponse`). Rust has no runtime
//! reflection, so the typed builder captures erased decode/invoke closures
//! while the message and handler types are statically known; at dispatch
//! time the pipeline only juggles `TypeId`s and `Arc<dyn Any>`.

use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{HookContext, MessageHook, MessageHooks};
use crate::error::BusError;
use crate::headers::Headers;
use crate::interceptor::BoxFuture;
use crate::message::{AnyMessage, DecodeFn, MessageCodec};

// ---------------------------------------------------------------------------
// Handler contracts
// ---------------------------------------------------------------------------

/// Per-message context handed to handlers: a read-only view of the inbound
/// headers, the path the message arrived on, and the caller's cancellation.
#[derive(Debug, Clone)]
pub struct ConsumerContext {
    pub path: String,
    pub headers: Headers,
    pub cancel: CancellationToken,
}

/// One-way message handler.
#[async_trait]
pub trait Consumer<M: Send + Sync + 'static>: Send + Sync {
    async fn on_message(&self, message: Arc<M>, ctx: &ConsumerContext) -> anyhow::Result<()>;
}

/// Two-way request handler producing a reply.
#[async_trait]
pub trait RequestHandler<Req: Send + Sync + 'static>: Send + Sync {
    type Response: Send + Sync + 'static;

    async fn on_request(
        &self,
        request: Arc<Req>,
        ctx: &ConsumerContext,
    ) -> anyhow::Result<Self::Response>;
}

// ---------------------------------------------------------------------------
// ConsumerSpec
// ---------------------------------------------------------------------------

/// Whether a subscription is one-way or request/response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerMode {
    Consumer,
    RequestResponse,
}

/// Erased dispatch closure: `(handler, message, ctx) -> response?`.
pub(crate) type InvokeFn = Arc<
    dyn Fn(AnyMessage, AnyMessage, ConsumerContext) -> BoxFuture<Result<Option<AnyMessage>, BusError>>
        + Send
        + Sync,
>;

/// One entry in a spec's invoker table: how to decode and dispatch one
/// concrete message type. The first invoker is the default; additional ones
/// are selected by the `MessageType` header for polymorphic subscriptions.
pub struct ConsumerInvoker {
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) decode: DecodeFn,
    pub(crate) invoke: InvokeFn,
}

impl ConsumerInvoker {
    fn for_consumer<M, H>() -> Self
    where
        M: Serialize + DeserializeOwned + Send + Sync + 'static,
        H: Consumer<M> + 'static,
    {
        let codec = MessageCodec::of::<M>();
        let message_type = codec.type_name;
        let invoke: InvokeFn = Arc::new(move |handler, message, ctx| {
            Box::pin(async move {
                let handler = handler.downcast::<H>().map_err(|_| {
                    BusError::Configuration(format!(
                        "resolved handler is not a {}",
                        std::any::type_name::<H>()
                    ))
                })?;
                let message = message.downcast::<M>().map_err(|_| {
                    BusError::Configuration(format!("decoded message is not a {message_type}"))
                })?;
                handler
                    .on_message(message, &ctx)
                    .await
                    .map_err(|e| BusError::Handler(e.to_string()))?;
                Ok(None)
            })
        });
        Self {
            type_id: codec.type_id,
            type_name: codec.type_name,
            decode: codec.decode,
            invoke,
        }
    }

    fn for_request<Req, H>() -> Self
    where
        Req: Serialize + DeserializeOwned + Send + Sync + 'static,
        H: RequestHandler<Req> + 'static,
    {
        let codec = MessageCodec::of::<Req>();
        let message_type = codec.type_name;
        let invoke: InvokeFn = Arc::new(move |handler, message, ctx| {
            Box::pin(async move {
                let handler = handler.downcast::<H>().map_err(|_| {
                    BusError::Configuration(format!(
                        "resolved handler is not a {}",
                        std::any::type_name::<H>()
                    ))
                })?;
                let request = message.downcast::<Req>().map_err(|_| {
                    BusError::Configuration(format!("decoded message is not a {message_type}"))
                })?;
                let response = handler
                    .on_request(request, &ctx)
                    .await
                    .map_err(|e| BusError::Handler(e.to_string()))?;
                Ok(Some(Arc::new(response) as AnyMessage))
            })
        });
        Self {
            type_id: codec.type_id,
            type_name: codec.type_name,
            decode: codec.decode,
            invoke,
        }
    }
}

/// An immutable subscription: path, mode, handler type, invoker table, and
/// per-message hooks. Built through [`ConsumerSpec::consumer`] or
/// [`ConsumerSpec::request_response`]; request/response specs carry their
/// response codec by construction.
pub struct ConsumerSpec {
    pub(crate) path: String,
    pub(crate) mode: ConsumerMode,
    pub(crate) consumer_type: TypeId,
    pub(crate) consumer_type_name: &'static str,
    pub(crate) invokers: Vec<ConsumerInvoker>,
    pub(crate) response: Option<MessageCodec>,
    /// Per-spec override of the transport's scope default.
    pub(crate) scope_enabled: Option<bool>,
    pub(crate) dispose_after_use: bool,
    pub(crate) hooks: MessageHooks,
}

impl ConsumerSpec {
    /// Subscribe a one-way consumer `H` for messages of type `M` on `path`.
    #[must_use]
    pub fn consumer<M, H>(path: impl Into<String>) -> ConsumerSpecBuilder<H>
    where
        M: Serialize + DeserializeOwned + Send + Sync + 'static,
        H: Consumer<M> + 'static,
    {
        ConsumerSpecBuilder {
            spec: Self {
                path: path.into(),
                mode: ConsumerMode::Consumer,
                consumer_type: TypeId::of::<H>(),
                consumer_type_name: std::any::type_name::<H>(),
                invokers: vec![ConsumerInvoker::for_consumer::<M, H>()],
                response: None,
                scope_enabled: None,
                dispose_after_use: false,
                hooks: MessageHooks::default(),
            },
            _handler: PhantomData,
        }
    }

    /// Subscribe a request handler `H` for requests of type `Req` on `path`.
    #[must_use]
    pub fn request_response<Req, H>(path: impl Into<String>) -> ConsumerSpecBuilder<H>
    where
        Req: Serialize + DeserializeOwned + Send + Sync + 'static,
        H: RequestHandler<Req> + 'static,
        H::Response: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        ConsumerSpecBuilder {
            spec: Self {
                path: path.into(),
                mode: ConsumerMode::RequestResponse,
                consumer_type: TypeId::of::<H>(),
                consumer_type_name: std::any::type_name::<H>(),
                invokers: vec![ConsumerInvoker::for_request::<Req, H>()],
                response: Some(MessageCodec::of::<H::Response>()),
                scope_enabled: None,
                dispose_after_use: false,
                hooks: MessageHooks::default(),
            },
            _handler: PhantomData,
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn mode(&self) -> ConsumerMode {
        self.mode
    }

    /// Pick the invoker for an inbound message: the `MessageType` header
    /// when it names a known entry, else the default (first) invoker.
    pub(crate) fn invoker_for(&self, message_type: Option<&str>) -> Option<&ConsumerInvoker> {
        message_type
            .and_then(|name| self.invokers.iter().find(|i| i.type_name == name))
            .or_else(|| self.invokers.first())
    }
}

// ---------------------------------------------------------------------------
// ConsumerSpecBuilder
// ---------------------------------------------------------------------------

/// Builder returned by the [`ConsumerSpec`] constructors.
pub struct ConsumerSpecBuilder<H> {
    spec: ConsumerSpec,
    _handler: PhantomData<H>,
}

impl<H: Send + Sync + 'static> ConsumerSpecBuilder<H> {
    /// Add a second message type dispatched to the same handler, selected at
    /// runtime by the `MessageType` header.
    #[must_use]
    pub fn also_handles<M>(mut self) -> Self
    where
        M: Serialize + DeserializeOwned + Send + Sync + 'static,
        H: Consumer<M>,
    {
        self.spec.invokers.push(ConsumerInvoker::for_consumer::<M, H>());
        self
    }

    /// Override the transport's per-message scope default.
    #[must_use]
    pub fn scope_enabled(mut self, enabled: bool) -> Self {
        self.spec.scope_enabled = Some(enabled);
        self
    }

    /// Release the handler instance right after each message instead of at
    /// scope teardown.
    #[must_use]
    pub fn dispose_after_use(mut self, dispose: bool) -> Self {
        self.spec.dispose_after_use = dispose;
        self
    }

    #[must_use]
    pub fn on_message_arrived(
        mut self,
        hook: impl Fn(&HookContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.spec.hooks.on_message_arrived = Some(Arc::new(hook) as MessageHook);
        self
    }

    #[must_use]
    pub fn on_message_expired(
        mut self,
        hook: impl Fn(&HookContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.spec.hooks.on_message_expired = Some(Arc::new(hook) as MessageHook);
        self
    }

    #[must_use]
    pub fn on_message_fault(
        mut self,
        hook: impl Fn(&HookContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.spec.hooks.on_message_fault = Some(Arc::new(hook) as MessageHook);
        self
    }

    #[must_use]
    pub fn on_message_finished(
        mut self,
        hook: impl Fn(&HookContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.spec.hooks.on_message_finished = Some(Arc::new(hook) as MessageHook);
        self
    }

    #[must_use]
    pub fn build(self) -> ConsumerSpec {
        self.spec
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
