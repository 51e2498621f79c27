//! Bus-level configuration, message hooks, and header modifiers.
//!
//! Hooks are data, not subclassing: optional function values on the bus
//! config and on individual specs, invoked spec-level first, each call
//! guarded -- a failing hook is logged and never propagated.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::headers::Headers;
use crate::message::AnyMessage;

/// Mutates outbound headers given the message being produced. Applied after
/// caller-supplied headers: spec modifier first, then the bus modifier.
pub type HeaderModifier = Arc<dyn Fn(&mut Headers, &AnyMessage) + Send + Sync>;

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Context handed to message hooks.
#[derive(Debug)]
pub struct HookContext<'a> {
    /// Bus name.
    pub bus: &'a str,
    /// Path the message was produced to or consumed from.
    pub path: &'a str,
    /// Name of the runtime message type.
    pub message_type: &'a str,
    /// Headers as observed at the hook point.
    pub headers: &'a Headers,
    /// For expiration hooks: when the message expired.
    pub expired_at: Option<u64>,
    /// Wall-clock unix-millis at the hook point.
    pub now_millis: u64,
    /// For fault hooks: the error that was recorded.
    pub error: Option<&'a str>,
}

/// A best-effort observation callback. Failures are logged, never raised.
pub type MessageHook = Arc<dyn Fn(&HookContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Optional per-message observation points, available on bus config and on
/// producer/consumer specs.
#[derive(Clone, Default)]
pub struct MessageHooks {
    pub on_message_arrived: Option<MessageHook>,
    pub on_message_expired: Option<MessageHook>,
    pub on_message_fault: Option<MessageHook>,
    pub on_message_finished: Option<MessageHook>,
    pub on_message_produced: Option<MessageHook>,
}

impl fmt::Debug for MessageHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = |o: &Option<MessageHook>| if o.is_some() { "set" } else { "-" };
        f.debug_struct("MessageHooks")
            .field("on_message_arrived", &set(&self.on_message_arrived))
            .field("on_message_expired", &set(&self.on_message_expired))
            .field("on_message_fault", &set(&self.on_message_fault))
            .field("on_message_finished", &set(&self.on_message_finished))
            .field("on_message_produced", &set(&self.on_message_produced))
            .finish()
    }
}

/// Run one hook guarded: a failure is logged at `warn!` and swallowed.
pub(crate) fn run_hook(name: &str, hook: Option<&MessageHook>, ctx: &HookContext<'_>) {
    if let Some(hook) = hook {
        if let Err(error) = hook(ctx) {
            warn!(hook = name, %error, path = ctx.path, "message hook failed");
        }
    }
}

// ---------------------------------------------------------------------------
// BusConfig
// ---------------------------------------------------------------------------

/// Bus-level configuration.
pub struct BusConfig {
    /// Name of this bus, used in logs and diagnostics.
    pub name: String,
    /// Default request/response timeout when neither the call nor the
    /// producer spec provides one. `None` means no deadline.
    pub default_request_timeout: Option<Duration>,
    /// Upper bound on the pending-request sweeper tick. The effective tick
    /// is clamped to half of the smallest registered timeout.
    pub sweep_interval: Duration,
    /// How long `stop()` waits for in-flight consumer invocations to drain.
    pub drain_timeout: Duration,
    /// Bus-level header modifier, applied after the producer spec's.
    pub header_modifier: Option<HeaderModifier>,
    /// Bus-level hooks, invoked after spec-level hooks.
    pub hooks: MessageHooks,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: "polybus".to_string(),
            default_request_timeout: Some(Duration::from_secs(20)),
            sweep_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(5),
            header_modifier: None,
            hooks: MessageHooks::default(),
        }
    }
}

impl fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConfig")
            .field("name", &self.name)
            .field("default_request_timeout", &self.default_request_timeout)
            .field("sweep_interval", &self.sweep_interval)
            .field("drain_timeout", &self.drain_timeout)
            .field("header_modifier", &self.header_modifier.is_some())
            .field("hooks", &self.hooks)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
