//! Consumer pipeline: everything that happens to an inbound envelope.
//!
//! Order per message: deserialize, expiration check, scope acquisition,
//! arrival hook, handler resolution, interceptor chain, fault/finished
//! hooks, and -- for request/response -- reply delivery. Every exit path
//! releases the per-message scope (RAII) and emits hooks in declared order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{run_hook, HookContext, MessageHook, MessageHooks};
use crate::consumer::{ConsumerContext, ConsumerMode, ConsumerSpec};
use crate::error::BusError;
use crate::headers::{keys, now_millis, Headers};
use crate::interceptor::{compose_consume_chain, ConsumeContext, ConsumeNext, InterceptorRegistry};
use crate::message::AnyMessage;
use crate::resolver::{DependencyResolver, DependencyScope, RootScope};
use crate::serializer::{Envelope, Payload, Serializer};
use crate::transport::ReplySink;

// ---------------------------------------------------------------------------
// In-flight tracking
// ---------------------------------------------------------------------------

/// RAII guard counting one in-flight consumer invocation. The counter is
/// decremented on drop, including during unwinding.
pub(crate) struct InFlightGuard {
    counter: Arc<AtomicU64>,
}

impl InFlightGuard {
    fn new(counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// ConsumerPipeline
// ---------------------------------------------------------------------------

/// Shared consumer-side machinery handed to transports at start.
pub struct ConsumerPipeline {
    bus_name: Arc<str>,
    hooks: MessageHooks,
    resolver: Arc<dyn DependencyResolver>,
    interceptors: Arc<InterceptorRegistry>,
    in_flight: Arc<AtomicU64>,
}

impl ConsumerPipeline {
    pub(crate) fn new(
        bus_name: Arc<str>,
        hooks: MessageHooks,
        resolver: Arc<dyn DependencyResolver>,
        interceptors: Arc<InterceptorRegistry>,
        in_flight: Arc<AtomicU64>,
    ) -> Self {
        Self {
            bus_name,
            hooks,
            resolver,
            interceptors,
            in_flight,
        }
    }

    /// Run one envelope through the pipeline for one subscription.
    ///
    /// `scope_default` is the transport's per-message scope default, used
    /// when the spec does not override it.
    ///
    /// # Errors
    ///
    /// Decode failures, missing handler registrations, and (consumer mode)
    /// handler failures are surfaced to the transport. Request/response
    /// handler failures are relayed to the caller as an `Error` reply and
    /// are not errors here.
    pub async fn process(
        &self,
        spec: &ConsumerSpec,
        envelope: Envelope,
        serializer: &dyn Serializer,
        reply: &dyn ReplySink,
        scope_default: bool,
        cancel: CancellationToken,
    ) -> Result<(), BusError> {
        let _guard = InFlightGuard::new(self.in_flight.clone());
        let Envelope { headers, payload } = envelope;

        let invoker = spec
            .invoker_for(headers.get_str(keys::MESSAGE_TYPE))
            .ok_or_else(|| {
                BusError::Configuration(format!("consumer on {} has no invokers", spec.path))
            })?;

        // Deserialize. A failure here is fatal for the message: report it on
        // the reply channel when possible, never invoke the handler.
        let message = match serializer.deserialize(&invoker.decode, payload) {
            Ok(message) => message,
            Err(fault) => {
                error!(path = %spec.path, error = %fault, "failed to decode inbound message");
                if spec.mode == ConsumerMode::RequestResponse {
                    if let Some(request_id) = headers.get_str(keys::REQUEST_ID) {
                        self.deliver_error_reply(reply, request_id, &fault.to_string()).await;
                    }
                }
                return Err(fault);
            }
        };

        // Expiration is checked before any handler work. An expired message
        // is dropped without a reply, even in request/response mode.
        let now = now_millis();
        if let Some(expires) = headers.get_millis(keys::EXPIRES) {
            if now > expires {
                let ctx = self.hook_ctx(spec, invoker.type_name, &headers, Some(expires), now, None);
                self.run_hooks(
                    "on_message_expired",
                    spec.hooks.on_message_expired.as_ref(),
                    self.hooks.on_message_expired.as_ref(),
                    &ctx,
                );
                debug!(path = %spec.path, expires, now, "dropping expired message");
                return Ok(());
            }
        }

        // Scope is released on every exit path below via drop.
        let scope: Box<dyn DependencyScope> = if spec.scope_enabled.unwrap_or(scope_default) {
            self.resolver.create_scope()
        } else {
            Box::new(RootScope::new(self.resolver.clone()))
        };

        let ctx = self.hook_ctx(spec, invoker.type_name, &headers, None, now, None);
        self.run_hooks(
            "on_message_arrived",
            spec.hooks.on_message_arrived.as_ref(),
            self.hooks.on_message_arrived.as_ref(),
            &ctx,
        );

        let Some(handler) = scope.resolve(spec.consumer_type) else {
            return Err(BusError::Configuration(format!(
                "no {} registered in the dependency resolver",
                spec.consumer_type_name
            )));
        };

        // Interceptor chain: most-derived interceptors outermost, handler
        // invocation innermost.
        let invoke = invoker.invoke.clone();
        let terminal: ConsumeNext = Box::new(move |ctx: ConsumeContext| {
            let consumer_ctx = ConsumerContext {
                path: ctx.path,
                headers: ctx.headers,
                cancel: ctx.cancel,
            };
            invoke(handler, ctx.message, consumer_ctx)
        });
        let chain =
            compose_consume_chain(self.interceptors.consumers_for(invoker.type_id).to_vec(), terminal);
        let chain_ctx = ConsumeContext {
            message,
            message_type: invoker.type_name,
            path: spec.path.clone(),
            headers: headers.clone(),
            cancel,
        };

        let (response, response_error) = match chain(chain_ctx).await {
            Ok(response) => (response, None),
            Err(fault) => {
                let fault_text = fault.to_string();
                let ctx =
                    self.hook_ctx(spec, invoker.type_name, &headers, None, now, Some(&fault_text));
                self.run_hooks(
                    "on_message_fault",
                    spec.hooks.on_message_fault.as_ref(),
                    self.hooks.on_message_fault.as_ref(),
                    &ctx,
                );
                match spec.mode {
                    // Relayed to the caller through the reply below.
                    ConsumerMode::RequestResponse => (None, Some(fault_text)),
                    // Re-raised so the transport can apply its own
                    // dead-letter/retry policy.
                    ConsumerMode::Consumer => {
                        if spec.dispose_after_use {
                            scope.release(spec.consumer_type);
                        }
                        self.finished_hooks(spec, invoker.type_name, &headers, now);
                        return Err(fault);
                    }
                }
            }
        };

        if spec.dispose_after_use {
            scope.release(spec.consumer_type);
        }
        self.finished_hooks(spec, invoker.type_name, &headers, now);

        if spec.mode == ConsumerMode::RequestResponse {
            let Some(request_id) = headers.get_str(keys::REQUEST_ID) else {
                return Err(BusError::Configuration(format!(
                    "request/response message on {} is missing the RequestId header",
                    spec.path
                )));
            };
            let envelope = self.build_reply(spec, serializer, request_id, response, response_error)?;
            reply.deliver_reply(request_id, envelope).await?;
        }
        Ok(())
    }

    fn build_reply(
        &self,
        spec: &ConsumerSpec,
        serializer: &dyn Serializer,
        request_id: &str,
        response: Option<AnyMessage>,
        response_error: Option<String>,
    ) -> Result<Envelope, BusError> {
        let mut headers = Headers::new();
        headers.insert(keys::REQUEST_ID, request_id);
        let payload = if let Some(error_text) = response_error {
            headers.insert(keys::ERROR, error_text);
            Payload::Bytes(Bytes::new())
        } else if let Some(response) = response {
            let codec = spec.response.as_ref().ok_or_else(|| {
                BusError::Configuration(format!(
                    "request/response consumer on {} has no response codec",
                    spec.path
                ))
            })?;
            match serializer.serialize(codec, &response) {
                Ok(payload) => payload,
                Err(fault) => {
                    error!(path = %spec.path, error = %fault, "failed to encode reply");
                    headers.insert(keys::ERROR, fault.to_string());
                    Payload::Bytes(Bytes::new())
                }
            }
        } else {
            headers.insert(keys::ERROR, "handler produced no response");
            Payload::Bytes(Bytes::new())
        };
        Ok(Envelope { headers, payload })
    }

    async fn deliver_error_reply(&self, reply: &dyn ReplySink, request_id: &str, fault: &str) {
        let mut headers = Headers::new();
        headers.insert(keys::REQUEST_ID, request_id);
        headers.insert(keys::ERROR, fault);
        let envelope = Envelope {
            headers,
            payload: Payload::Bytes(Bytes::new()),
        };
        if let Err(error) = reply.deliver_reply(request_id, envelope).await {
            warn!(request_id, %error, "failed to deliver error reply");
        }
    }

    fn finished_hooks(&self, spec: &ConsumerSpec, message_type: &str, headers: &Headers, now: u64) {
        let ctx = self.hook_ctx(spec, message_type, headers, None, now, None);
        self.run_hooks(
            "on_message_finished",
            spec.hooks.on_message_finished.as_ref(),
            self.hooks.on_message_finished.as_ref(),
            &ctx,
        );
    }

    fn run_hooks(
        &self,
        name: &'static str,
        spec_hook: Option<&MessageHook>,
        bus_hook: Option<&MessageHook>,
        ctx: &HookContext<'_>,
    ) {
        run_hook(name, spec_hook, ctx);
        run_hook(name, bus_hook, ctx);
    }

    fn hook_ctx<'a>(
        &'a self,
        spec: &'a ConsumerSpec,
        message_type: &'a str,
        headers: &'a Headers,
        expired_at: Option<u64>,
        now: u64,
        error: Option<&'a str>,
    ) -> HookContext<'a> {
        HookContext {
            bus: &self.bus_name,
            path: &spec.path,
            message_type,
            headers,
            expired_at,
            now_millis: now,
            error,
        }
    }

    pub(crate) fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
