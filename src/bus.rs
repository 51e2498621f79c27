//! The message bus: hybrid dispatch across transports, publish/send, and
//! lifecycle.
//!
//! A bus owns its transports in registration order. Build aggregates every
//! transport's producer specs into the routing table; produce and send
//! resolve the transport by the message's runtime type and delegate with no
//! extra interception at this layer. `start()` runs transports in
//! registration order (rolling back on failure), `stop()`/`dispose()` in
//! reverse.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{run_hook, BusConfig, HookContext};
use crate::error::BusError;
use crate::headers::{keys, now_millis, HeaderValue, Headers};
use crate::interceptor::{
    compose_produce_chain, ConsumerInterceptor, InterceptorRegistry, ProduceContext, ProduceNext,
    ProducerInterceptor,
};
use crate::message::{AnyMessage, DecodeFn, MessageCodec, TypeGraph};
use crate::pending::PendingRequestStore;
use crate::pipeline::ConsumerPipeline;
use crate::producer::ProducerSpec;
use crate::resolver::{DependencyResolver, HandlerRegistry};
use crate::routing::RoutingTable;
use crate::transport::{ProduceRequest, Transport, TransportContext};

/// Bus lifecycle states.
///
/// State machine: Built -> Started -> Draining -> Stopped -> Disposed.
/// A stopped bus may be started again; a disposed bus may not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Built,
    Started,
    Draining,
    Stopped,
    Disposed,
}

/// Per-call options for [`MessageBus::send_with`].
pub struct SendOptions {
    /// Override the producer spec's default path.
    pub path: Option<String>,
    /// Caller-supplied headers, preserved end-to-end.
    pub headers: Headers,
    /// Per-call timeout; takes precedence over the spec and bus defaults.
    pub timeout: Option<Duration>,
    /// Cancellation handle; triggering it settles the pending request with
    /// `Cancelled`. The transport produce is not retroactively cancelled.
    pub cancel: CancellationToken,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            path: None,
            headers: Headers::new(),
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// MessageBus
// ---------------------------------------------------------------------------

/// Handle to a built bus. Cheap to clone; all clones share one bus.
#[derive(Clone)]
pub struct MessageBus {
    pub(crate) inner: Arc<BusInner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus").finish_non_exhaustive()
    }
}

pub(crate) struct BusInner {
    pub(crate) config: BusConfig,
    /// Random per-bus identity scoping request ids and the reply-to address.
    pub(crate) instance_id: Arc<str>,
    transports: Vec<Arc<dyn Transport>>,
    by_name: HashMap<Arc<str>, Arc<dyn Transport>>,
    routing: RoutingTable,
    producer_specs: HashMap<TypeId, Arc<ProducerSpec>>,
    interceptors: Arc<InterceptorRegistry>,
    pub(crate) pending: Arc<PendingRequestStore>,
    pipeline: Arc<ConsumerPipeline>,
    state: ArcSwap<BusState>,
    next_request: AtomicU64,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl MessageBus {
    #[must_use]
    pub fn builder() -> BusBuilder {
        BusBuilder::new()
    }

    #[must_use]
    pub fn state(&self) -> BusState {
        **self.inner.state.load()
    }

    /// Publish a one-way message to its routed transport's default path.
    pub async fn publish<M>(&self, message: M) -> Result<(), BusError>
    where
        M: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.publish_to(message, None, Headers::new()).await
    }

    /// Publish with an explicit path and caller-supplied headers.
    pub async fn publish_to<M>(
        &self,
        message: M,
        path: Option<&str>,
        headers: Headers,
    ) -> Result<(), BusError>
    where
        M: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.inner
            .produce_event(
                Arc::new(message) as AnyMessage,
                MessageCodec::of::<M>(),
                path,
                headers,
                CancellationToken::new(),
            )
            .await
    }

    /// Issue a request and await its reply.
    pub async fn send<Req, Resp>(&self, request: Req) -> Result<Arc<Resp>, BusError>
    where
        Req: Serialize + DeserializeOwned + Send + Sync + 'static,
        Resp: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.send_with(request, SendOptions::default()).await
    }

    /// Issue a request with per-call path, headers, timeout, and
    /// cancellation.
    pub async fn send_with<Req, Resp>(
        &self,
        request: Req,
        options: SendOptions,
    ) -> Result<Arc<Resp>, BusError>
    where
        Req: Serialize + DeserializeOwned + Send + Sync + 'static,
        Resp: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let reply = self
            .inner
            .send_request(
                Arc::new(request) as AnyMessage,
                MessageCodec::of::<Req>(),
                MessageCodec::of::<Resp>().decode,
                options,
            )
            .await?;
        reply.downcast::<Resp>().map_err(|_| {
            BusError::Configuration(format!(
                "reply is not a {}",
                std::any::type_name::<Resp>()
            ))
        })
    }

    /// Start all transports in registration order and begin sweeping
    /// pending-request deadlines. A transport failure stops the transports
    /// already started, in reverse order, and surfaces the error.
    pub async fn start(&self) -> Result<(), BusError> {
        let inner = &self.inner;
        match **inner.state.load() {
            BusState::Built | BusState::Stopped => {}
            BusState::Started | BusState::Draining => return Ok(()),
            BusState::Disposed => return Err(BusError::BusStopped),
        }

        let ctx = TransportContext {
            pipeline: inner.pipeline.clone(),
            pending: inner.pending.clone(),
            bus_instance: inner.instance_id.clone(),
        };
        for (index, transport) in inner.transports.iter().enumerate() {
            if let Err(source) = transport.start(ctx.clone()).await {
                for started in inner.transports[..index].iter().rev() {
                    if let Err(error) = started.stop().await {
                        warn!(
                            transport = started.name(),
                            %error,
                            "failed to stop transport during start rollback"
                        );
                    }
                }
                return Err(BusError::Transport {
                    transport: transport.name().to_string(),
                    source,
                });
            }
        }

        let token = CancellationToken::new();
        let sweeper_token = token.clone();
        let store = inner.pending.clone();
        let granularity = inner.config.sweep_interval;
        let handle = tokio::spawn(async move {
            loop {
                let tick = store.sweep_tick(granularity);
                tokio::select! {
                    () = sweeper_token.cancelled() => break,
                    () = tokio::time::sleep(tick) => {
                        store.sweep(tokio::time::Instant::now());
                    }
                    // A shorter timeout was registered: recompute the tick.
                    () = store.deadline_changed() => {}
                }
            }
        });
        *inner.sweeper.lock() = Some((token, handle));

        inner.state.store(Arc::new(BusState::Started));
        debug!(bus = %inner.config.name, "bus started");
        Ok(())
    }

    /// Stop accepting produces, drain in-flight consumer invocations (up to
    /// the configured drain timeout), cancel outstanding requests with
    /// `BusStopped`, and stop transports in reverse registration order.
    pub async fn stop(&self) -> Result<(), BusError> {
        let inner = &self.inner;
        if **inner.state.load() != BusState::Started {
            return Ok(());
        }
        inner.state.store(Arc::new(BusState::Draining));

        let deadline = tokio::time::Instant::now() + inner.config.drain_timeout;
        while inner.pipeline.in_flight_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    in_flight = inner.pipeline.in_flight_count(),
                    "drain timeout expired with consumer work in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let sweeper = inner.sweeper.lock().take();
        if let Some((token, handle)) = sweeper {
            token.cancel();
            if let Err(error) = handle.await {
                warn!(%error, "pending-request sweeper failed");
            }
        }

        inner.pending.cancel_all_stopped();

        let mut first_error = None;
        for transport in inner.transports.iter().rev() {
            if let Err(source) = transport.stop().await {
                warn!(transport = transport.name(), error = %source, "transport stop failed");
                if first_error.is_none() {
                    first_error = Some(BusError::Transport {
                        transport: transport.name().to_string(),
                        source,
                    });
                }
            }
        }

        inner.state.store(Arc::new(BusState::Stopped));
        debug!(bus = %inner.config.name, "bus stopped");
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Release all transports. Best-effort: individual failures are logged
    /// and swallowed. Stops the bus first if it is still running.
    pub async fn dispose(&self) {
        if self.state() == BusState::Started {
            if let Err(error) = self.stop().await {
                warn!(%error, "stop during dispose failed");
            }
        }
        if self.state() == BusState::Disposed {
            return;
        }
        for transport in self.inner.transports.iter().rev() {
            if let Err(error) = transport.dispose().await {
                warn!(transport = transport.name(), %error, "transport dispose failed");
            }
        }
        self.inner.state.store(Arc::new(BusState::Disposed));
    }
}

// ---------------------------------------------------------------------------
// Produce internals
// ---------------------------------------------------------------------------

impl BusInner {
    fn ensure_started(&self) -> Result<(), BusError> {
        if **self.state.load() == BusState::Started {
            Ok(())
        } else {
            Err(BusError::BusStopped)
        }
    }

    fn resolve_target(
        &self,
        type_id: TypeId,
        type_name: &str,
        path: Option<&str>,
    ) -> Result<(Arc<ProducerSpec>, Arc<dyn Transport>), BusError> {
        let route = self
            .routing
            .resolve(type_id, type_name, path.unwrap_or("<default>"))?;
        let spec = self
            .producer_specs
            .get(&route.matched)
            .cloned()
            .ok_or_else(|| {
                BusError::Configuration(format!(
                    "route for {type_name} matched a type with no producer spec"
                ))
            })?;
        let transport = self
            .by_name
            .get(route.transport.as_ref())
            .cloned()
            .ok_or_else(|| {
                BusError::Configuration(format!(
                    "route for {type_name} names unknown transport {}",
                    route.transport
                ))
            })?;
        Ok((spec, transport))
    }

    /// Caller headers first, then the spec modifier, then the bus modifier.
    /// The `MessageType` hint is filled in last unless already present.
    fn compose_headers(
        &self,
        spec: &ProducerSpec,
        headers: &mut Headers,
        message: &AnyMessage,
        type_name: &'static str,
    ) {
        if let Some(modifier) = &spec.header_modifier {
            modifier(headers, message);
        }
        if let Some(modifier) = &self.config.header_modifier {
            modifier(headers, message);
        }
        if !headers.contains(keys::MESSAGE_TYPE) {
            headers.insert(keys::MESSAGE_TYPE, type_name);
        }
    }

    pub(crate) async fn produce_event(
        &self,
        message: AnyMessage,
        codec: MessageCodec,
        path: Option<&str>,
        mut headers: Headers,
        cancel: CancellationToken,
    ) -> Result<(), BusError> {
        self.ensure_started()?;
        let (spec, transport) = self.resolve_target(codec.type_id, codec.type_name, path)?;
        let path = path.map_or_else(|| spec.default_path.clone(), str::to_string);
        self.compose_headers(&spec, &mut headers, &message, codec.type_name);
        self.run_chain(codec, &spec, &transport, message, path, headers, cancel)
            .await
    }

    pub(crate) async fn send_request(
        &self,
        message: AnyMessage,
        codec: MessageCodec,
        response_decode: DecodeFn,
        options: SendOptions,
    ) -> Result<AnyMessage, BusError> {
        self.ensure_started()?;
        let (spec, transport) =
            self.resolve_target(codec.type_id, codec.type_name, options.path.as_deref())?;
        let path = options
            .path
            .map_or_else(|| spec.default_path.clone(), |p| p);
        let mut headers = options.headers;
        self.compose_headers(&spec, &mut headers, &message, codec.type_name);

        // Effective timeout: per-call > producer spec > bus default > none.
        let timeout = options
            .timeout
            .or(spec.timeout)
            .or(self.config.default_request_timeout);

        let request_id = format!(
            "{}-{}",
            self.instance_id,
            self.next_request.fetch_add(1, Ordering::Relaxed)
        );
        headers.insert(keys::REQUEST_ID, request_id.as_str());
        headers.insert(keys::REPLY_TO, self.instance_id.to_string());
        if let Some(timeout) = timeout {
            headers.insert(
                keys::EXPIRES,
                HeaderValue::Millis(now_millis() + timeout.as_millis() as u64),
            );
        }

        // Registered before the chain runs: a loopback transport may settle
        // the request synchronously inside the produce call.
        let mut receiver = self
            .pending
            .register(request_id.clone(), response_decode, timeout)?;

        let cancel = options.cancel;
        let chain = self.run_chain(
            codec,
            &spec,
            &transport,
            message,
            path,
            headers,
            cancel.clone(),
        );
        tokio::pin!(chain);
        let mut chain_done = false;

        // The chain runs on this task (loopback transports consume inline),
        // but settlement wins the race: a timeout or cancellation returns
        // immediately, abandoning whatever work the chain still had.
        loop {
            tokio::select! {
                settled = &mut receiver => {
                    return match settled {
                        Ok(result) => result,
                        // The registry was torn down under us.
                        Err(_) => Err(BusError::BusStopped),
                    };
                }
                produced = &mut chain, if !chain_done => {
                    if let Err(error) = produced {
                        self.pending.cancel(&request_id, BusError::Cancelled);
                        return Err(error);
                    }
                    chain_done = true;
                }
                () = cancel.cancelled() => {
                    self.pending.cancel(&request_id, BusError::Cancelled);
                    return Err(BusError::Cancelled);
                }
            }
        }
    }

    /// Serialize, wrap the transport hand-off in the producer interceptor
    /// chain, and run it. The `on_message_produced` hooks fire inside the
    /// innermost step, after a successful produce, so they observe the
    /// headers as the transport saw them.
    #[allow(clippy::too_many_arguments)]
    async fn run_chain(
        &self,
        codec: MessageCodec,
        spec: &Arc<ProducerSpec>,
        transport: &Arc<dyn Transport>,
        message: AnyMessage,
        path: String,
        headers: Headers,
        cancel: CancellationToken,
    ) -> Result<(), BusError> {
        let payload = transport.serializer().serialize(&codec, &message)?;
        let interceptors = self.interceptors.producers_for(codec.type_id).to_vec();

        let type_name = codec.type_name;
        let bus_name = self.config.name.clone();
        let spec_hook = spec.hooks.on_message_produced.clone();
        let bus_hook = self.config.hooks.on_message_produced.clone();
        let transport = transport.clone();
        let terminal: ProduceNext = Box::new(move |ctx| {
            Box::pin(async move {
                let ProduceContext {
                    message,
                    path,
                    headers,
                    cancel,
                    ..
                } = ctx;
                let hook_path = path.clone();
                let hook_headers = headers.clone();
                transport
                    .produce(ProduceRequest {
                        type_name,
                        message,
                        path,
                        payload,
                        headers,
                        cancel,
                    })
                    .await?;
                let hook_ctx = HookContext {
                    bus: &bus_name,
                    path: &hook_path,
                    message_type: type_name,
                    headers: &hook_headers,
                    expired_at: None,
                    now_millis: now_millis(),
                    error: None,
                };
                run_hook("on_message_produced", spec_hook.as_ref(), &hook_ctx);
                run_hook("on_message_produced", bus_hook.as_ref(), &hook_ctx);
                Ok(())
            })
        });

        let chain = compose_produce_chain(interceptors, terminal);
        chain(ProduceContext {
            message,
            message_type: type_name,
            path,
            headers,
            cancel,
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// BusBuilder
// ---------------------------------------------------------------------------

/// Builder for [`MessageBus`].
pub struct BusBuilder {
    config: BusConfig,
    transports: Vec<Arc<dyn Transport>>,
    resolver: Option<Arc<dyn DependencyResolver>>,
    producer_interceptors: HashMap<TypeId, Vec<Arc<dyn ProducerInterceptor>>>,
    consumer_interceptors: HashMap<TypeId, Vec<Arc<dyn ConsumerInterceptor>>>,
    graph: TypeGraph,
}

impl BusBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: BusConfig::default(),
            transports: Vec::new(),
            resolver: None,
            producer_interceptors: HashMap::new(),
            consumer_interceptors: HashMap::new(),
            graph: TypeGraph::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a transport. Registration order is start order; stop and
    /// dispose run in reverse.
    #[must_use]
    pub fn add_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transports.push(Arc::new(transport));
        self
    }

    /// Resolver handlers are looked up from. Defaults to an empty
    /// [`HandlerRegistry`].
    #[must_use]
    pub fn with_resolver(mut self, resolver: impl DependencyResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Register a producer interceptor for message type `M` (and, through
    /// declared parent edges, for types derived from `M`).
    #[must_use]
    pub fn add_producer_interceptor<M: 'static>(
        mut self,
        interceptor: impl ProducerInterceptor + 'static,
    ) -> Self {
        self.producer_interceptors
            .entry(TypeId::of::<M>())
            .or_default()
            .push(Arc::new(interceptor));
        self
    }

    /// Register a consumer interceptor for message type `M`.
    #[must_use]
    pub fn add_consumer_interceptor<M: 'static>(
        mut self,
        interceptor: impl ConsumerInterceptor + 'static,
    ) -> Self {
        self.consumer_interceptors
            .entry(TypeId::of::<M>())
            .or_default()
            .push(Arc::new(interceptor));
        self
    }

    /// Declare `B` as a base type of `M` for routing and interceptor lookup.
    #[must_use]
    pub fn declare_parent<M: 'static, B: 'static>(mut self) -> Self {
        self.graph.declare::<M, B>();
        self
    }

    /// Build the bus: aggregate producer specs into the routing table and
    /// wire up the shared pipeline. The bus still needs `start()`.
    ///
    /// # Errors
    ///
    /// `Configuration` when two transports share a name or claim the same
    /// message type.
    pub fn build(self) -> Result<MessageBus, BusError> {
        let mut graph = self.graph;
        for transport in &self.transports {
            for spec in transport.producer_specs() {
                for parent in &spec.parents {
                    graph.add_edge(spec.type_id, *parent);
                }
            }
        }

        let mut routing = RoutingTable::new(graph.clone());
        let mut producer_specs = HashMap::new();
        let mut by_name: HashMap<Arc<str>, Arc<dyn Transport>> = HashMap::new();
        for transport in &self.transports {
            let name: Arc<str> = Arc::from(transport.name());
            if by_name.insert(name.clone(), transport.clone()).is_some() {
                return Err(BusError::Configuration(format!(
                    "transport name {name} is registered twice"
                )));
            }
            for spec in transport.producer_specs() {
                routing.insert(spec.type_id, spec.type_name, name.clone())?;
                producer_specs.insert(spec.type_id, spec);
            }
        }

        let interceptors = Arc::new(InterceptorRegistry::new(
            self.producer_interceptors,
            self.consumer_interceptors,
            graph,
        ));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(HandlerRegistry::new()));

        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        let instance_id: Arc<str> = Arc::from(format!("{}-{suffix}", self.config.name).as_str());

        let pipeline = Arc::new(ConsumerPipeline::new(
            Arc::from(self.config.name.as_str()),
            self.config.hooks.clone(),
            resolver,
            interceptors.clone(),
            Arc::new(AtomicU64::new(0)),
        ));

        Ok(MessageBus {
            inner: Arc::new(BusInner {
                config: self.config,
                instance_id,
                transports: self.transports,
                by_name,
                routing,
                producer_specs,
                interceptors,
                pending: Arc::new(PendingRequestStore::new()),
                pipeline,
                state: ArcSwap::from_pointee(BusState::Built),
                next_request: AtomicU64::new(1),
                sweeper: Mutex::new(None),
            }),
        })
    }
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
