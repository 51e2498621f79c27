//! Error taxonomy for the bus core.
//!
//! Configuration faults are never retried; serialization faults are fatal for
//! the message they occur on; transport faults wrap the backend's own error.

/// Errors surfaced by bus operations and transports.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Missing route, missing handler registration, duplicate subscription,
    /// or type/mode mismatch. Reported at build time where detectable,
    /// otherwise at first use.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Payload or envelope encode/decode failure.
    #[error("serialization failed for {type_name}: {reason}")]
    Serialization { type_name: String, reason: String },

    /// Backend I/O failure, already wrapped by the transport.
    #[error("transport {transport} failed: {source}")]
    Transport {
        transport: String,
        #[source]
        source: anyhow::Error,
    },

    /// A request deadline elapsed with no reply.
    #[error("request timed out after {timeout_ms}ms")]
    RequestTimeout { timeout_ms: u64 },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// User handler code failed. In request/response mode the message is
    /// relayed to the caller; in consumer mode it is re-raised to the
    /// transport.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Produce attempted while the bus is not started or is shutting down.
    #[error("bus is stopped")]
    BusStopped,
}

impl BusError {
    /// Shorthand for a serialization error on the given type.
    pub(crate) fn serialization(type_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Serialization {
            type_name: type_name.into(),
            reason: reason.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
