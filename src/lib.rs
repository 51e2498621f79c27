//! `polybus` — a message-bus core: typed publish and request/response over
//! pluggable transports behind one API, with routing by runtime message
//! type, producer/consumer interceptor chains, per-message dependency
//! scopes, and an in-process memory transport.

pub mod bus;
pub mod config;
pub mod consumer;
pub mod error;
pub mod headers;
pub mod interceptor;
pub mod memory;
pub mod message;
pub mod pending;
pub mod pipeline;
pub mod producer;
pub mod resolver;
pub mod routing;
pub mod serializer;
pub mod transport;

pub use bus::{BusBuilder, BusState, MessageBus, SendOptions};
pub use config::{BusConfig, HeaderModifier, HookContext, MessageHook, MessageHooks};
pub use consumer::{
    Consumer, ConsumerContext, ConsumerMode, ConsumerSpec, ConsumerSpecBuilder, RequestHandler,
};
pub use error::BusError;
pub use headers::{keys, HeaderValue, Headers};
pub use interceptor::{
    ConsumeContext, ConsumeNext, ConsumerInterceptor, ProduceContext, ProduceNext,
    ProducerInterceptor,
};
pub use memory::{MemoryTransport, MemoryTransportBuilder};
pub use message::{AnyMessage, MessageCodec, TypeGraph};
pub use pending::PendingRequestStore;
pub use pipeline::ConsumerPipeline;
pub use producer::{PathKind, ProducerSpec, ProducerSpecBuilder};
pub use resolver::{DependencyResolver, DependencyScope, HandlerRegistry};
pub use routing::RoutingTable;
pub use serializer::{CodecSerializer, Envelope, NullSerializer, Payload, Serializer};
pub use transport::{ProduceRequest, ReplySink, Transport, TransportContext};

/// End-to-end scenarios over the memory transport.
#[cfg(test)]
mod integration_tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    use crate::headers::now_millis;
    use crate::{
        keys, BusError, Consumer, ConsumerContext, ConsumerSpec, HandlerRegistry, HeaderValue,
        Headers, MemoryTransport, MessageBus, ProducerSpec, RequestHandler, SendOptions,
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        /// Not serialized: survives loopback only when the original
        /// instance is passed through.
        #[serde(skip)]
        local_tag: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct EchoReply {
        text: String,
    }

    #[derive(Default)]
    struct OrderRecorder {
        orders: Mutex<Vec<Order>>,
        instances: Mutex<Vec<usize>>,
        headers: Mutex<Vec<Headers>>,
    }

    #[async_trait]
    impl Consumer<Order> for OrderRecorder {
        async fn on_message(&self, message: Arc<Order>, ctx: &ConsumerContext) -> anyhow::Result<()> {
            self.orders.lock().push((*message).clone());
            self.instances.lock().push(Arc::as_ptr(&message) as usize);
            self.headers.lock().push(ctx.headers.clone());
            Ok(())
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl RequestHandler<Echo> for EchoHandler {
        type Response = EchoReply;

        async fn on_request(
            &self,
            request: Arc<Echo>,
            _ctx: &ConsumerContext,
        ) -> anyhow::Result<EchoReply> {
            Ok(EchoReply {
                text: request.text.clone(),
            })
        }
    }

    struct SlowEchoHandler {
        delay: Duration,
    }

    #[async_trait]
    impl RequestHandler<Echo> for SlowEchoHandler {
        type Response = EchoReply;

        async fn on_request(
            &self,
            request: Arc<Echo>,
            _ctx: &ConsumerContext,
        ) -> anyhow::Result<EchoReply> {
            tokio::time::sleep(self.delay).await;
            Ok(EchoReply {
                text: request.text.clone(),
            })
        }
    }

    // Scenario: publish to a path nobody subscribed to.
    #[tokio::test]
    async fn publish_with_no_consumers_succeeds() {
        let bus = MessageBus::builder()
            .add_transport(
                MemoryTransport::builder("memory")
                    .produce(ProducerSpec::topic::<Order>("orders").build())
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        bus.start().await.unwrap();

        bus.publish(Order { id: 1, local_tag: 0 }).await.unwrap();

        bus.stop().await.unwrap();
    }

    // Scenario: two consumers on one path, serialization enabled. Both see
    // an equal value, neither sees the original instance.
    #[tokio::test]
    async fn two_consumers_each_observe_a_distinct_equal_copy() {
        #[derive(Default)]
        struct SecondRecorder {
            orders: Mutex<Vec<Order>>,
            instances: Mutex<Vec<usize>>,
        }

        #[async_trait]
        impl Consumer<Order> for SecondRecorder {
            async fn on_message(
                &self,
                message: Arc<Order>,
                _ctx: &ConsumerContext,
            ) -> anyhow::Result<()> {
                self.orders.lock().push((*message).clone());
                self.instances.lock().push(Arc::as_ptr(&message) as usize);
                Ok(())
            }
        }

        let first = Arc::new(OrderRecorder::default());
        let second = Arc::new(SecondRecorder::default());

        struct TwoHandlerResolver {
            first: Arc<OrderRecorder>,
            second: Arc<SecondRecorder>,
        }
        impl crate::DependencyResolver for TwoHandlerResolver {
            fn resolve(&self, type_id: std::any::TypeId) -> Option<crate::AnyMessage> {
                if type_id == std::any::TypeId::of::<OrderRecorder>() {
                    Some(self.first.clone() as crate::AnyMessage)
                } else if type_id == std::any::TypeId::of::<SecondRecorder>() {
                    Some(self.second.clone() as crate::AnyMessage)
                } else {
                    None
                }
            }
            fn create_scope(&self) -> Box<dyn crate::DependencyScope> {
                Box::new(crate::resolver::RootScope::new(Arc::new(TwoHandlerResolver {
                    first: self.first.clone(),
                    second: self.second.clone(),
                })))
            }
        }

        let bus = MessageBus::builder()
            .with_resolver(TwoHandlerResolver {
                first: first.clone(),
                second: second.clone(),
            })
            .add_transport(
                MemoryTransport::builder("memory")
                    .enable_serialization(true)
                    .produce(ProducerSpec::topic::<Order>("orders").build())
                    .consume(ConsumerSpec::consumer::<Order, OrderRecorder>("orders").build())
                    .consume(ConsumerSpec::consumer::<Order, SecondRecorder>("orders").build())
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        bus.start().await.unwrap();

        bus.publish(Order { id: 7, local_tag: 99 }).await.unwrap();

        let expected = Order { id: 7, local_tag: 0 };
        assert_eq!(*first.orders.lock(), vec![expected.clone()]);
        assert_eq!(*second.orders.lock(), vec![expected]);

        // Serialization gives each consumer its own decoded instance; the
        // skipped field resetting to default proves the value round-trip.
        let first_ptr = first.instances.lock()[0];
        let second_ptr = second.instances.lock()[0];
        assert_ne!(first_ptr, second_ptr);

        bus.stop().await.unwrap();
    }

    // Serialization disabled: the handler observes the producer's instance.
    #[tokio::test]
    async fn loopback_without_serialization_passes_the_original() {
        let recorder = Arc::new(OrderRecorder::default());

        struct SharedResolver(Arc<OrderRecorder>);
        impl crate::DependencyResolver for SharedResolver {
            fn resolve(&self, type_id: std::any::TypeId) -> Option<crate::AnyMessage> {
                (type_id == std::any::TypeId::of::<OrderRecorder>())
                    .then(|| self.0.clone() as crate::AnyMessage)
            }
            fn create_scope(&self) -> Box<dyn crate::DependencyScope> {
                Box::new(crate::resolver::RootScope::new(Arc::new(SharedResolver(
                    self.0.clone(),
                ))))
            }
        }

        let bus = MessageBus::builder()
            .with_resolver(SharedResolver(recorder.clone()))
            .add_transport(
                MemoryTransport::builder("memory")
                    .produce(ProducerSpec::topic::<Order>("orders").build())
                    .consume(ConsumerSpec::consumer::<Order, OrderRecorder>("orders").build())
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        bus.start().await.unwrap();

        bus.publish(Order { id: 3, local_tag: 42 }).await.unwrap();

        // The skipped field survives only on the original instance.
        assert_eq!(recorder.orders.lock()[0].local_tag, 42);

        bus.stop().await.unwrap();
    }

    fn echo_bus<H>(handler: H, spec_timeout: Option<Duration>) -> MessageBus
    where
        H: RequestHandler<Echo, Response = EchoReply> + 'static,
    {
        let mut registry = HandlerRegistry::new();
        registry.register(handler);

        let mut producer = ProducerSpec::queue::<Echo>("echo");
        if let Some(timeout) = spec_timeout {
            producer = producer.timeout(timeout);
        }

        MessageBus::builder()
            .with_resolver(registry)
            .add_transport(
                MemoryTransport::builder("memory")
                    .produce(producer.build())
                    .consume(ConsumerSpec::request_response::<Echo, H>("echo").build())
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    // Scenario: request/response happy path.
    #[tokio::test]
    async fn send_completes_with_the_handler_reply() {
        let bus = echo_bus(EchoHandler, None);
        bus.start().await.unwrap();

        let reply: Arc<EchoReply> = bus
            .send(Echo {
                text: "hi".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(reply.text, "hi");
        assert!(bus.inner.pending.is_empty());

        bus.stop().await.unwrap();
    }

    // Scenario: handler outlives the timeout; the caller fails fast and the
    // registry is left clean.
    #[tokio::test]
    async fn send_times_out_within_the_expected_window() {
        let bus = echo_bus(
            SlowEchoHandler {
                delay: Duration::from_millis(400),
            },
            None,
        );
        bus.start().await.unwrap();

        let started = tokio::time::Instant::now();
        let err = bus
            .send_with::<Echo, EchoReply>(
                Echo {
                    text: "slow".to_string(),
                },
                SendOptions {
                    timeout: Some(Duration::from_millis(50)),
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, BusError::RequestTimeout { timeout_ms: 50 }));
        assert!(elapsed >= Duration::from_millis(50), "failed too early: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(150), "failed too late: {elapsed:?}");
        assert!(bus.inner.pending.is_empty());

        bus.stop().await.unwrap();
    }

    // Scenario: handler failure is relayed to the caller.
    #[tokio::test]
    async fn handler_failure_reaches_the_caller_as_handler_error() {
        struct Failing;

        #[async_trait]
        impl RequestHandler<Echo> for Failing {
            type Response = EchoReply;

            async fn on_request(
                &self,
                _request: Arc<Echo>,
                _ctx: &ConsumerContext,
            ) -> anyhow::Result<EchoReply> {
                Err(anyhow::anyhow!("nope"))
            }
        }

        let bus = echo_bus(Failing, None);
        bus.start().await.unwrap();

        let err = bus
            .send::<Echo, EchoReply>(Echo {
                text: "boom".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Handler(msg) if msg.contains("nope")));

        bus.stop().await.unwrap();
    }

    // Scenario: caller cancellation settles the request immediately.
    #[tokio::test]
    async fn cancellation_settles_the_request() {
        let bus = echo_bus(
            SlowEchoHandler {
                delay: Duration::from_millis(400),
            },
            None,
        );
        bus.start().await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = bus
            .send_with::<Echo, EchoReply>(
                Echo {
                    text: "never".to_string(),
                },
                SendOptions {
                    cancel,
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::Cancelled));
        assert!(bus.inner.pending.is_empty());

        bus.stop().await.unwrap();
    }

    // Scenario: expired on receipt -- handler skipped, hook fired once.
    #[tokio::test]
    async fn expired_message_skips_the_handler_and_fires_the_hook() {
        let recorder = Arc::new(OrderRecorder::default());
        let expirations: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));

        struct SharedResolver(Arc<OrderRecorder>);
        impl crate::DependencyResolver for SharedResolver {
            fn resolve(&self, type_id: std::any::TypeId) -> Option<crate::AnyMessage> {
                (type_id == std::any::TypeId::of::<OrderRecorder>())
                    .then(|| self.0.clone() as crate::AnyMessage)
            }
            fn create_scope(&self) -> Box<dyn crate::DependencyScope> {
                Box::new(crate::resolver::RootScope::new(Arc::new(SharedResolver(
                    self.0.clone(),
                ))))
            }
        }

        let seen = expirations.clone();
        let bus = MessageBus::builder()
            .with_resolver(SharedResolver(recorder.clone()))
            .add_transport(
                MemoryTransport::builder("memory")
                    .produce(ProducerSpec::topic::<Order>("orders").build())
                    .consume(
                        ConsumerSpec::consumer::<Order, OrderRecorder>("orders")
                            .on_message_expired(move |ctx| {
                                seen.lock()
                                    .push((ctx.expired_at.unwrap_or(0), ctx.now_millis));
                                Ok(())
                            })
                            .build(),
                    )
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        bus.start().await.unwrap();

        let expired_at = now_millis() - 1_000;
        let mut headers = Headers::new();
        headers.insert(keys::EXPIRES, HeaderValue::Millis(expired_at));
        bus.publish_to(Order { id: 9, local_tag: 0 }, None, headers)
            .await
            .unwrap();

        assert!(recorder.orders.lock().is_empty());
        let fired = expirations.lock();
        assert_eq!(fired.len(), 1);
        let (hook_expired_at, hook_now) = fired[0];
        assert_eq!(hook_expired_at, expired_at);
        assert!(hook_now > hook_expired_at);

        bus.stop().await.unwrap();
    }

    // Scenario: hybrid routing across two transports.
    #[tokio::test]
    async fn hybrid_bus_routes_each_type_to_its_transport() {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct TypeX {
            n: u32,
        }
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct TypeY {
            n: u32,
        }
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct TypeZ {
            n: u32,
        }

        struct CountingConsumer<T> {
            count: Arc<AtomicU32>,
            _marker: std::marker::PhantomData<T>,
        }

        #[async_trait]
        impl<T: Send + Sync + 'static> Consumer<T> for CountingConsumer<T> {
            async fn on_message(&self, _message: Arc<T>, _ctx: &ConsumerContext) -> anyhow::Result<()> {
                self.count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let x_count = Arc::new(AtomicU32::new(0));
        let y_count = Arc::new(AtomicU32::new(0));

        let mut registry = HandlerRegistry::new();
        registry.register(CountingConsumer::<TypeX> {
            count: x_count.clone(),
            _marker: std::marker::PhantomData,
        });
        registry.register(CountingConsumer::<TypeY> {
            count: y_count.clone(),
            _marker: std::marker::PhantomData,
        });

        let bus = MessageBus::builder()
            .with_resolver(registry)
            .add_transport(
                MemoryTransport::builder("transport-a")
                    .produce(ProducerSpec::topic::<TypeX>("xs").build())
                    .consume(
                        ConsumerSpec::consumer::<TypeX, CountingConsumer<TypeX>>("xs").build(),
                    )
                    .build()
                    .unwrap(),
            )
            .add_transport(
                MemoryTransport::builder("transport-b")
                    .produce(ProducerSpec::topic::<TypeY>("ys").build())
                    .consume(
                        ConsumerSpec::consumer::<TypeY, CountingConsumer<TypeY>>("ys").build(),
                    )
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        bus.start().await.unwrap();

        bus.publish(TypeX { n: 1 }).await.unwrap();
        bus.publish(TypeY { n: 2 }).await.unwrap();

        assert_eq!(x_count.load(Ordering::SeqCst), 1);
        assert_eq!(y_count.load(Ordering::SeqCst), 1);

        let err = bus.publish(TypeZ { n: 3 }).await.unwrap_err();
        assert!(matches!(err, BusError::Configuration(_)));
        assert!(format!("{err}").contains("TypeZ"));

        bus.stop().await.unwrap();
    }

    // Property: unknown headers survive the loopback envelope round-trip.
    #[tokio::test]
    async fn unknown_headers_are_preserved_end_to_end() {
        let recorder = Arc::new(OrderRecorder::default());

        struct SharedResolver(Arc<OrderRecorder>);
        impl crate::DependencyResolver for SharedResolver {
            fn resolve(&self, type_id: std::any::TypeId) -> Option<crate::AnyMessage> {
                (type_id == std::any::TypeId::of::<OrderRecorder>())
                    .then(|| self.0.clone() as crate::AnyMessage)
            }
            fn create_scope(&self) -> Box<dyn crate::DependencyScope> {
                Box::new(crate::resolver::RootScope::new(Arc::new(SharedResolver(
                    self.0.clone(),
                ))))
            }
        }

        let bus = MessageBus::builder()
            .with_resolver(SharedResolver(recorder.clone()))
            .add_transport(
                MemoryTransport::builder("memory")
                    .enable_serialization(true)
                    .produce(ProducerSpec::topic::<Order>("orders").build())
                    .consume(ConsumerSpec::consumer::<Order, OrderRecorder>("orders").build())
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        bus.start().await.unwrap();

        let mut headers = Headers::new();
        headers.insert("x-tenant", "acme");
        headers.insert("x-attempt", 2i64);
        bus.publish_to(Order { id: 5, local_tag: 0 }, None, headers)
            .await
            .unwrap();

        let observed = recorder.headers.lock();
        assert_eq!(observed[0].get_str("x-tenant"), Some("acme"));
        assert_eq!(observed[0].get_i64("x-attempt"), Some(2));

        bus.stop().await.unwrap();
    }

    // Property: per-message scopes are opened and dropped on every exit
    // path, including handler failure.
    #[tokio::test]
    async fn scopes_are_released_on_success_and_failure() {
        struct FlakyConsumer;

        #[async_trait]
        impl Consumer<Order> for FlakyConsumer {
            async fn on_message(&self, message: Arc<Order>, _ctx: &ConsumerContext) -> anyhow::Result<()> {
                if message.id % 2 == 0 {
                    Err(anyhow::anyhow!("even orders are rejected"))
                } else {
                    Ok(())
                }
            }
        }

        struct CountingResolver {
            created: Arc<AtomicU32>,
            dropped: Arc<AtomicU32>,
        }
        struct CountingScope {
            dropped: Arc<AtomicU32>,
        }
        impl crate::DependencyScope for CountingScope {
            fn resolve(&self, type_id: std::any::TypeId) -> Option<crate::AnyMessage> {
                (type_id == std::any::TypeId::of::<FlakyConsumer>())
                    .then(|| Arc::new(FlakyConsumer) as crate::AnyMessage)
            }
        }
        impl Drop for CountingScope {
            fn drop(&mut self) {
                self.dropped.fetch_add(1, Ordering::SeqCst);
            }
        }
        impl crate::DependencyResolver for CountingResolver {
            fn resolve(&self, _type_id: std::any::TypeId) -> Option<crate::AnyMessage> {
                None
            }
            fn create_scope(&self) -> Box<dyn crate::DependencyScope> {
                self.created.fetch_add(1, Ordering::SeqCst);
                Box::new(CountingScope {
                    dropped: self.dropped.clone(),
                })
            }
        }

        let created = Arc::new(AtomicU32::new(0));
        let dropped = Arc::new(AtomicU32::new(0));

        let bus = MessageBus::builder()
            .with_resolver(CountingResolver {
                created: created.clone(),
                dropped: dropped.clone(),
            })
            .add_transport(
                MemoryTransport::builder("memory")
                    .produce(ProducerSpec::topic::<Order>("orders").build())
                    .consume(
                        ConsumerSpec::consumer::<Order, FlakyConsumer>("orders")
                            .scope_enabled(true)
                            .build(),
                    )
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        bus.start().await.unwrap();

        bus.publish(Order { id: 1, local_tag: 0 }).await.unwrap();
        let err = bus.publish(Order { id: 2, local_tag: 0 }).await.unwrap_err();
        assert!(matches!(err, BusError::Handler(_)));

        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);

        bus.stop().await.unwrap();
    }

    // Property: interceptors run in declared order inward, reverse outward,
    // across both pipelines.
    #[tokio::test]
    async fn interceptors_wrap_produce_and_consume_in_order() {
        use crate::{ConsumeContext, ConsumeNext, ProduceContext, ProduceNext};

        struct ProduceTracer {
            label: &'static str,
            log: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl crate::ProducerInterceptor for ProduceTracer {
            async fn intercept(
                &self,
                ctx: ProduceContext,
                next: ProduceNext,
            ) -> Result<(), BusError> {
                self.log.lock().push(format!("produce:{}:in", self.label));
                let result = next(ctx).await;
                self.log.lock().push(format!("produce:{}:out", self.label));
                result
            }
        }

        struct ConsumeTracer {
            log: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl crate::ConsumerInterceptor for ConsumeTracer {
            async fn intercept(
                &self,
                ctx: ConsumeContext,
                next: ConsumeNext,
            ) -> Result<Option<crate::AnyMessage>, BusError> {
                self.log.lock().push("consume:in".to_string());
                let result = next(ctx).await;
                self.log.lock().push("consume:out".to_string());
                result
            }
        }

        struct LoggingConsumer {
            log: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl Consumer<Order> for LoggingConsumer {
            async fn on_message(&self, _message: Arc<Order>, _ctx: &ConsumerContext) -> anyhow::Result<()> {
                self.log.lock().push("handler".to_string());
                Ok(())
            }
        }

        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let mut registry = HandlerRegistry::new();
        registry.register(LoggingConsumer { log: log.clone() });

        let bus = MessageBus::builder()
            .with_resolver(registry)
            .add_producer_interceptor::<Order>(ProduceTracer {
                label: "outer",
                log: log.clone(),
            })
            .add_producer_interceptor::<Order>(ProduceTracer {
                label: "inner",
                log: log.clone(),
            })
            .add_consumer_interceptor::<Order>(ConsumeTracer { log: log.clone() })
            .add_transport(
                MemoryTransport::builder("memory")
                    .produce(ProducerSpec::topic::<Order>("orders").build())
                    .consume(
                        ConsumerSpec::consumer::<Order, LoggingConsumer>("orders").build(),
                    )
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        bus.start().await.unwrap();

        bus.publish(Order { id: 1, local_tag: 0 }).await.unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "produce:outer:in",
                "produce:inner:in",
                "consume:in",
                "handler",
                "consume:out",
                "produce:inner:out",
                "produce:outer:out",
            ]
        );

        bus.stop().await.unwrap();
    }

    // Producer-spec timeout applies when the call does not override it.
    #[tokio::test]
    async fn producer_spec_timeout_is_the_send_default() {
        let bus = echo_bus(
            SlowEchoHandler {
                delay: Duration::from_millis(400),
            },
            Some(Duration::from_millis(60)),
        );
        bus.start().await.unwrap();

        let err = bus
            .send::<Echo, EchoReply>(Echo {
                text: "slow".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::RequestTimeout { timeout_ms: 60 }));

        bus.stop().await.unwrap();
    }
}
