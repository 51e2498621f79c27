//! Routing table: runtime message type to transport name.
//!
//! Built once at bus build and immutable afterwards. Lookup is exact match
//! first, then a breadth-first walk of the declared base-type graph,
//! most-specific level first; the first match wins and two matches at the
//! same depth are a configuration fault. Resolutions are memoized.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::BusError;
use crate::message::TypeGraph;

#[derive(Debug, Clone)]
struct RouteEntry {
    transport: Arc<str>,
    type_name: &'static str,
}

/// Result of a route lookup: the owning transport and the registered type
/// the lookup matched (the queried type itself, or a declared base).
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub transport: Arc<str>,
    pub matched: TypeId,
}

/// Message-type to transport-name resolver.
pub struct RoutingTable {
    routes: HashMap<TypeId, RouteEntry>,
    graph: TypeGraph,
    cache: DashMap<TypeId, ResolvedRoute>,
}

impl RoutingTable {
    pub(crate) fn new(graph: TypeGraph) -> Self {
        Self {
            routes: HashMap::new(),
            graph,
            cache: DashMap::new(),
        }
    }

    /// Register a route at build time. A second transport claiming the same
    /// message type is a configuration fault.
    pub(crate) fn insert(
        &mut self,
        type_id: TypeId,
        type_name: &'static str,
        transport: Arc<str>,
    ) -> Result<(), BusError> {
        if let Some(existing) = self.routes.get(&type_id) {
            return Err(BusError::Configuration(format!(
                "message type {type_name} is already routed to transport {}, cannot also route it to {transport}",
                existing.transport
            )));
        }
        self.routes.insert(
            type_id,
            RouteEntry {
                transport,
                type_name,
            },
        );
        Ok(())
    }

    /// Resolve the transport for a message type.
    ///
    /// # Errors
    ///
    /// `Configuration` when no route matches or when two declared bases at
    /// the same depth both carry a route.
    pub fn resolve(
        &self,
        type_id: TypeId,
        type_name: &str,
        path: &str,
    ) -> Result<ResolvedRoute, BusError> {
        if let Some(hit) = self.cache.get(&type_id) {
            return Ok(hit.clone());
        }
        let resolved = self.resolve_uncached(type_id, type_name, path)?;
        self.cache.insert(type_id, resolved.clone());
        Ok(resolved)
    }

    fn resolve_uncached(
        &self,
        type_id: TypeId,
        type_name: &str,
        path: &str,
    ) -> Result<ResolvedRoute, BusError> {
        if let Some(entry) = self.routes.get(&type_id) {
            return Ok(ResolvedRoute {
                transport: entry.transport.clone(),
                matched: type_id,
            });
        }
        for level in self.graph.ancestor_levels(type_id) {
            let matches: Vec<(TypeId, &RouteEntry)> = level
                .iter()
                .filter_map(|id| self.routes.get(id).map(|entry| (*id, entry)))
                .collect();
            match matches.as_slice() {
                [] => {}
                [(matched, entry)] => {
                    return Ok(ResolvedRoute {
                        transport: entry.transport.clone(),
                        matched: *matched,
                    })
                }
                several => {
                    let names: Vec<&str> =
                        several.iter().map(|(_, entry)| entry.type_name).collect();
                    return Err(BusError::Configuration(format!(
                        "route for {type_name} is ambiguous between equally specific bases: {}",
                        names.join(", ")
                    )));
                }
            }
        }
        Err(BusError::Configuration(format!(
            "no transport routes message type {type_name} (path {path:?})"
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
