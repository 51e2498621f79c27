//! Type-erased message machinery.
//!
//! Rust has no runtime reflection, so everything the dispatch core needs to
//! know about a message type is captured eagerly at registration time:
//! a [`MessageCodec`] pairs erased MessagePack encode/decode closures with
//! the type's identity, and a [`TypeGraph`] records declared base-type
//! edges so routing and interceptor lookup can walk a supertype chain.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::BusError;

/// A type-erased message travelling through the bus.
pub type AnyMessage = Arc<dyn Any + Send + Sync>;

/// Erased payload encoder produced by [`MessageCodec::of`].
pub type EncodeFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<Bytes, BusError> + Send + Sync>;

/// Erased payload decoder produced by [`MessageCodec::of`].
pub type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<AnyMessage, BusError> + Send + Sync>;

// ---------------------------------------------------------------------------
// MessageCodec
// ---------------------------------------------------------------------------

/// Encode/decode pair for one concrete message type, captured at
/// registration time while the type is still statically known.
#[derive(Clone)]
pub struct MessageCodec {
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub encode: EncodeFn,
    pub decode: DecodeFn,
}

impl MessageCodec {
    /// Build the codec for `M` using the default MessagePack payload format.
    #[must_use]
    pub fn of<M>() -> Self
    where
        M: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let type_name = std::any::type_name::<M>();
        let encode: EncodeFn = Arc::new(move |message| {
            let message = message.downcast_ref::<M>().ok_or_else(|| {
                BusError::Configuration(format!(
                    "codec for {type_name} was handed a different message type"
                ))
            })?;
            rmp_serde::to_vec_named(message)
                .map(Bytes::from)
                .map_err(|e| BusError::serialization(type_name, e))
        });
        let decode: DecodeFn = Arc::new(move |bytes| {
            let value: M =
                rmp_serde::from_slice(bytes).map_err(|e| BusError::serialization(type_name, e))?;
            Ok(Arc::new(value) as AnyMessage)
        });
        Self {
            type_id: TypeId::of::<M>(),
            type_name,
            encode,
            decode,
        }
    }
}

impl std::fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCodec")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// TypeGraph
// ---------------------------------------------------------------------------

/// Declared base-type edges between message types.
///
/// Immutable after bus build; lookups walk ancestors breadth-first so the
/// most-derived match is found first. Cycles are tolerated (each node is
/// visited once).
#[derive(Debug, Clone, Default)]
pub struct TypeGraph {
    parents: HashMap<TypeId, Vec<TypeId>>,
}

impl TypeGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `child` should also match registrations for `parent`.
    pub fn add_edge(&mut self, child: TypeId, parent: TypeId) {
        let parents = self.parents.entry(child).or_default();
        if !parents.contains(&parent) {
            parents.push(parent);
        }
    }

    /// Typed convenience for [`TypeGraph::add_edge`].
    pub fn declare<M: 'static, B: 'static>(&mut self) {
        self.add_edge(TypeId::of::<M>(), TypeId::of::<B>());
    }

    /// Ancestors of `id` grouped by distance, nearest level first. The type
    /// itself is not included. Declaration order is preserved within a level.
    #[must_use]
    pub fn ancestor_levels(&self, id: TypeId) -> Vec<Vec<TypeId>> {
        let mut levels = Vec::new();
        let mut seen = vec![id];
        let mut frontier = vec![id];
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for node in &frontier {
                if let Some(parents) = self.parents.get(node) {
                    for parent in parents {
                        if !seen.contains(parent) {
                            seen.push(*parent);
                            next.push(*parent);
                        }
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            levels.push(next.clone());
            frontier = next;
        }
        levels
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
