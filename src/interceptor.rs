//! Producer and consumer interceptors.
//!
//! An interceptor wraps one produce or consume invocation with a
//! `next`-style continuation: it may mutate headers, short-circuit by not
//! calling `next`, or transform the result. Interceptors are registered per
//! message type; lookup includes declared base types, most-derived first,
//! and is memoized after the first resolution.

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::error::BusError;
use crate::headers::Headers;
use crate::message::{AnyMessage, TypeGraph};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

// ---------------------------------------------------------------------------
// Contexts and continuations
// ---------------------------------------------------------------------------

/// State threaded through a producer interceptor chain. Ownership moves
/// through the chain so interceptors can mutate headers and path freely.
pub struct ProduceContext {
    pub message: AnyMessage,
    pub message_type: &'static str,
    pub path: String,
    pub headers: Headers,
    pub cancel: CancellationToken,
}

/// Continuation for the rest of a producer chain; the innermost step hands
/// the envelope to the transport.
pub type ProduceNext = Box<dyn FnOnce(ProduceContext) -> BoxFuture<Result<(), BusError>> + Send>;

#[async_trait]
pub trait ProducerInterceptor: Send + Sync {
    async fn intercept(&self, ctx: ProduceContext, next: ProduceNext) -> Result<(), BusError>;
}

/// State threaded through a consumer interceptor chain.
pub struct ConsumeContext {
    pub message: AnyMessage,
    pub message_type: &'static str,
    pub path: String,
    pub headers: Headers,
    pub cancel: CancellationToken,
}

/// Continuation for the rest of a consumer chain; the innermost step invokes
/// the handler and yields its response (if any).
pub type ConsumeNext =
    Box<dyn FnOnce(ConsumeContext) -> BoxFuture<Result<Option<AnyMessage>, BusError>> + Send>;

#[async_trait]
pub trait ConsumerInterceptor: Send + Sync {
    async fn intercept(
        &self,
        ctx: ConsumeContext,
        next: ConsumeNext,
    ) -> Result<Option<AnyMessage>, BusError>;
}

// ---------------------------------------------------------------------------
// Chain composition
// ---------------------------------------------------------------------------

/// Fold interceptors around a terminal continuation. The first interceptor
/// in the list runs outermost, so declared order is entry order and the
/// `next` continuations complete in reverse.
pub(crate) fn compose_produce_chain(
    interceptors: Vec<Arc<dyn ProducerInterceptor>>,
    terminal: ProduceNext,
) -> ProduceNext {
    let mut next = terminal;
    for interceptor in interceptors.into_iter().rev() {
        let inner = next;
        next = Box::new(move |ctx| {
            Box::pin(async move { interceptor.intercept(ctx, inner).await })
        });
    }
    next
}

pub(crate) fn compose_consume_chain(
    interceptors: Vec<Arc<dyn ConsumerInterceptor>>,
    terminal: ConsumeNext,
) -> ConsumeNext {
    let mut next = terminal;
    for interceptor in interceptors.into_iter().rev() {
        let inner = next;
        next = Box::new(move |ctx| {
            Box::pin(async move { interceptor.intercept(ctx, inner).await })
        });
    }
    next
}

// ---------------------------------------------------------------------------
// InterceptorRegistry
// ---------------------------------------------------------------------------

/// Message-type-indexed interceptor sets with a memoized base-chain cache.
///
/// Built once at bus build; per-type resolution happens at most once and is
/// served from the cache afterwards -- no per-message type walking.
pub struct InterceptorRegistry {
    producers: HashMap<TypeId, Vec<Arc<dyn ProducerInterceptor>>>,
    consumers: HashMap<TypeId, Vec<Arc<dyn ConsumerInterceptor>>>,
    graph: TypeGraph,
    producer_cache: DashMap<TypeId, Arc<[Arc<dyn ProducerInterceptor>]>>,
    consumer_cache: DashMap<TypeId, Arc<[Arc<dyn ConsumerInterceptor>]>>,
}

impl InterceptorRegistry {
    pub(crate) fn new(
        producers: HashMap<TypeId, Vec<Arc<dyn ProducerInterceptor>>>,
        consumers: HashMap<TypeId, Vec<Arc<dyn ConsumerInterceptor>>>,
        graph: TypeGraph,
    ) -> Self {
        Self {
            producers,
            consumers,
            graph,
            producer_cache: DashMap::new(),
            consumer_cache: DashMap::new(),
        }
    }

    /// Producer interceptors for `type_id`, including declared base types,
    /// most-derived first.
    pub(crate) fn producers_for(&self, type_id: TypeId) -> Arc<[Arc<dyn ProducerInterceptor>]> {
        if let Some(hit) = self.producer_cache.get(&type_id) {
            return hit.clone();
        }
        let resolved: Arc<[_]> = collect_for(&self.producers, &self.graph, type_id).into();
        self.producer_cache.insert(type_id, resolved.clone());
        resolved
    }

    /// Consumer interceptors for `type_id`, including declared base types,
    /// most-derived first.
    pub(crate) fn consumers_for(&self, type_id: TypeId) -> Arc<[Arc<dyn ConsumerInterceptor>]> {
        if let Some(hit) = self.consumer_cache.get(&type_id) {
            return hit.clone();
        }
        let resolved: Arc<[_]> = collect_for(&self.consumers, &self.graph, type_id).into();
        self.consumer_cache.insert(type_id, resolved.clone());
        resolved
    }
}

fn collect_for<I: ?Sized>(
    registered: &HashMap<TypeId, Vec<Arc<I>>>,
    graph: &TypeGraph,
    type_id: TypeId,
) -> Vec<Arc<I>> {
    let mut out = Vec::new();
    if let Some(exact) = registered.get(&type_id) {
        out.extend(exact.iter().cloned());
    }
    for level in graph.ancestor_levels(type_id) {
        for base in level {
            if let Some(list) = registered.get(&base) {
                out.extend(list.iter().cloned());
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
