//! Lifecycle hooks contributed by plugins.
//!
//! Each [`HookEvent`] maps to a priority-ordered list of handlers. Firing is a
//! plain iteration: blocking `Before` hooks can abort a call, everything else
//! only produces warnings.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatch::{DispatchError, Tier, ToolCategory};
use crate::plugin::Capabilities;

/// Events a hook can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    /// Before a tool of this category runs (after tier checks).
    Before(ToolCategory),
    /// After a tool of this category succeeded.
    After(ToolCategory),
    /// After the synchronizer published a new generation.
    SyncCompleted,
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Before(category) => write!(f, "before:{category}"),
            Self::After(category) => write!(f, "after:{category}"),
            Self::SyncCompleted => f.write_str("sync_completed"),
        }
    }
}

impl FromStr for HookEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "sync_completed" {
            return Ok(Self::SyncCompleted);
        }
        match s.split_once(':') {
            Some(("before", category)) => Ok(Self::Before(category.parse()?)),
            Some(("after", category)) => Ok(Self::After(category.parse()?)),
            _ => Err(format!(
                "unknown hook event '{s}' (expected before:<category>, after:<category>, or sync_completed)"
            )),
        }
    }
}

/// What a hook sees when it fires.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub event: HookEvent,
    pub tool: Option<&'a str>,
    pub tier: Option<Tier>,
    pub correlation_id: Option<&'a str>,
    pub arguments: Option<&'a Value>,
    pub result: Option<&'a Value>,
    pub kb: Option<&'a str>,
    pub generation: Option<u64>,
}

impl<'a> HookContext<'a> {
    #[must_use]
    pub fn sync(kb: &'a str, generation: u64) -> Self {
        Self {
            event: HookEvent::SyncCompleted,
            tool: None,
            tier: None,
            correlation_id: None,
            arguments: None,
            result: None,
            kb: Some(kb),
            generation: Some(generation),
        }
    }
}

/// A hook callback. Returning `Err` reports a failure message.
pub trait HookHandler: Send + Sync {
    /// Run the hook.
    ///
    /// # Errors
    ///
    /// Returns a human-readable failure message.
    fn call(&self, ctx: &HookContext<'_>) -> Result<(), String>;
}

impl<F> HookHandler for F
where
    F: Fn(&HookContext<'_>) -> Result<(), String> + Send + Sync,
{
    fn call(&self, ctx: &HookContext<'_>) -> Result<(), String> {
        self(ctx)
    }
}

/// A hook as contributed by a plugin.
#[derive(Clone)]
pub struct HookSpec {
    pub event: HookEvent,
    /// Lower runs first.
    pub priority: i32,
    /// Only meaningful for `Before` events.
    pub blocking: bool,
    pub handler: Arc<dyn HookHandler>,
}

impl HookSpec {
    pub fn new<F>(event: HookEvent, priority: i32, blocking: bool, handler: F) -> Self
    where
        F: Fn(&HookContext<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        Self::from_handler(event, priority, blocking, Arc::new(handler))
    }

    #[must_use]
    pub fn from_handler(event: HookEvent, priority: i32, blocking: bool, handler: Arc<dyn HookHandler>) -> Self {
        Self {
            event,
            priority,
            blocking,
            handler,
        }
    }
}

impl fmt::Debug for HookSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSpec")
            .field("event", &self.event)
            .field("priority", &self.priority)
            .field("blocking", &self.blocking)
            .finish_non_exhaustive()
    }
}

/// A hook in the merged capability set.
#[derive(Debug, Clone)]
pub struct RegisteredHook {
    pub plugin: String,
    pub spec: HookSpec,
    /// Registration order, used to break priority ties.
    pub seq: usize,
}

fn run(hook: &RegisteredHook, ctx: &HookContext<'_>) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(|| hook.spec.handler.call(ctx))) {
        Ok(result) => result,
        Err(_) => Err("hook panicked".to_string()),
    }
}

/// Fire `Before` hooks. A failing blocking hook aborts with `HookFailure`;
/// non-blocking failures come back as warnings.
///
/// # Errors
///
/// Returns `DispatchError::HookFailure` for the first blocking hook that fails.
pub fn fire_before(capabilities: &Capabilities, ctx: &HookContext<'_>) -> Result<Vec<String>, DispatchError> {
    let mut warnings = Vec::new();
    for hook in capabilities.hooks(ctx.event) {
        if let Err(message) = run(hook, ctx) {
            if hook.spec.blocking {
                tracing::warn!(plugin = %hook.plugin, event = %ctx.event, %message, "blocking hook aborted call");
                return Err(DispatchError::HookFailure {
                    plugin: hook.plugin.clone(),
                    message,
                });
            }
            tracing::warn!(plugin = %hook.plugin, event = %ctx.event, %message, "hook failed");
            warnings.push(format!("hook '{}' ({}) failed: {message}", hook.plugin, ctx.event));
        }
    }
    Ok(warnings)
}

/// Fire hooks that can never abort (`After`, `SyncCompleted`).
#[must_use]
pub fn fire_notify(capabilities: &Capabilities, ctx: &HookContext<'_>) -> Vec<String> {
    let mut warnings = Vec::new();
    for hook in capabilities.hooks(ctx.event) {
        if let Err(message) = run(hook, ctx) {
            tracing::warn!(plugin = %hook.plugin, event = %ctx.event, %message, "hook failed");
            warnings.push(format!("hook '{}' ({}) failed: {message}", hook.plugin, ctx.event));
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_names() {
        assert_eq!(
            "before:mutation".parse::<HookEvent>().unwrap(),
            HookEvent::Before(ToolCategory::Mutation)
        );
        assert_eq!(
            "after:query".parse::<HookEvent>().unwrap(),
            HookEvent::After(ToolCategory::Query)
        );
        assert_eq!("sync_completed".parse::<HookEvent>().unwrap(), HookEvent::SyncCompleted);
        assert!("during:query".parse::<HookEvent>().is_err());
        assert!("before:nothing".parse::<HookEvent>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for event in [
            HookEvent::Before(ToolCategory::Maintenance),
            HookEvent::After(ToolCategory::Plugin),
            HookEvent::SyncCompleted,
        ] {
            assert_eq!(event.to_string().parse::<HookEvent>().unwrap(), event);
        }
    }
}
