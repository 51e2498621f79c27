//! Producer specs: how one message type leaves the bus.
//!
//! A spec binds a message type to its default path, path kind, optional
//! request timeout, header modifier, and per-message hooks. Specs are
//! registered on a transport and immutable after build; routing aggregates
//! them into the bus-wide table.

use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{HeaderModifier, HookContext, MessageHook, MessageHooks};
use crate::headers::Headers;
use crate::message::{AnyMessage, MessageCodec};

/// Whether a path is fan-out (topic) or point-to-point (queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Topic,
    Queue,
}

/// Immutable producer registration for one message type.
pub struct ProducerSpec {
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) default_path: String,
    pub(crate) path_kind: PathKind,
    /// Request timeout for `send` on this type; overrides the bus default.
    pub(crate) timeout: Option<Duration>,
    pub(crate) codec: MessageCodec,
    pub(crate) header_modifier: Option<HeaderModifier>,
    pub(crate) hooks: MessageHooks,
    /// Declared base types, used by routing and interceptor lookup.
    pub(crate) parents: Vec<TypeId>,
}

impl ProducerSpec {
    /// Produce messages of type `M` to a topic.
    #[must_use]
    pub fn topic<M>(path: impl Into<String>) -> ProducerSpecBuilder<M>
    where
        M: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Self::builder(path, PathKind::Topic)
    }

    /// Produce messages of type `M` to a queue.
    #[must_use]
    pub fn queue<M>(path: impl Into<String>) -> ProducerSpecBuilder<M>
    where
        M: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Self::builder(path, PathKind::Queue)
    }

    fn builder<M>(path: impl Into<String>, path_kind: PathKind) -> ProducerSpecBuilder<M>
    where
        M: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let codec = MessageCodec::of::<M>();
        ProducerSpecBuilder {
            spec: Self {
                type_id: codec.type_id,
                type_name: codec.type_name,
                default_path: path.into(),
                path_kind,
                timeout: None,
                codec,
                header_modifier: None,
                hooks: MessageHooks::default(),
                parents: Vec::new(),
            },
            _message: PhantomData,
        }
    }
}

impl ProducerSpec {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[must_use]
    pub fn default_path(&self) -> &str {
        &self.default_path
    }

    #[must_use]
    pub fn path_kind(&self) -> PathKind {
        self.path_kind
    }
}

impl std::fmt::Debug for ProducerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerSpec")
            .field("type_name", &self.type_name)
            .field("default_path", &self.default_path)
            .field("path_kind", &self.path_kind)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Builder returned by [`ProducerSpec::topic`] and [`ProducerSpec::queue`].
pub struct ProducerSpecBuilder<M> {
    spec: ProducerSpec,
    _message: PhantomData<M>,
}

impl<M: 'static> ProducerSpecBuilder<M> {
    /// Request timeout for `send` calls on this type.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = Some(timeout);
        self
    }

    /// Mutate outbound headers for every message of this type.
    #[must_use]
    pub fn header_modifier(
        mut self,
        modifier: impl Fn(&mut Headers, &AnyMessage) + Send + Sync + 'static,
    ) -> Self {
        self.spec.header_modifier = Some(Arc::new(modifier) as HeaderModifier);
        self
    }

    /// Declare `B` as a base type of `M`: routes and interceptors registered
    /// for `B` also apply to `M`.
    #[must_use]
    pub fn parent<B: 'static>(mut self) -> Self {
        self.spec.parents.push(TypeId::of::<B>());
        self
    }

    #[must_use]
    pub fn on_message_produced(
        mut self,
        hook: impl Fn(&HookContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.spec.hooks.on_message_produced = Some(Arc::new(hook) as MessageHook);
        self
    }

    #[must_use]
    pub fn build(self) -> ProducerSpec {
        self.spec
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
