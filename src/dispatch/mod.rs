//! Tiered tool dispatcher.
//!
//! Every tool call, whether it comes from the native protocol, the MCP
//! bridge, or the CLI, goes through [`Dispatcher::call`]: lookup, tier check,
//! `Before` hooks, handler, `After` hooks. Handlers run on the blocking pool
//! behind a bounded semaphore.

pub mod builtin;
pub mod hooks;

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::commands::Kbgate;
use crate::entry::EntryError;
use crate::index::IndexError;
use crate::storage::StorageError;

use self::hooks::{HookContext, HookEvent};

/// Authorization level of a session. Ordered `Read < Write < Admin`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Read,
    Write,
    Admin,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        })
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown tier '{other}' (expected read, write, or admin)")),
        }
    }
}

/// Tool category, used to route hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    /// Search.
    #[default]
    Query,
    /// Entry lookups and listings.
    Entry,
    /// Creates, updates, deletes.
    Mutation,
    /// Sync, reindex, reload, reports.
    Maintenance,
    /// Anything a plugin defines that fits nowhere else.
    Plugin,
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Query => "query",
            Self::Entry => "entry",
            Self::Mutation => "mutation",
            Self::Maintenance => "maintenance",
            Self::Plugin => "plugin",
        })
    }
}

impl FromStr for ToolCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(Self::Query),
            "entry" => Ok(Self::Entry),
            "mutation" => Ok(Self::Mutation),
            "maintenance" => Ok(Self::Maintenance),
            "plugin" => Ok(Self::Plugin),
            other => Err(format!("unknown tool category '{other}'")),
        }
    }
}

/// Errors a tool handler can return.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Entry(#[from] EntryError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    /// Deserialize tool arguments, treating `null` as an empty object.
    ///
    /// # Errors
    ///
    /// Returns `ToolError::InvalidArguments` if the arguments don't match `T`.
    pub fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, Self> {
        let args = if args.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            args.clone()
        };
        serde_json::from_value(args).map_err(|e| Self::InvalidArguments(e.to_string()))
    }
}

/// Errors returned to callers. Every variant has a stable wire `kind`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    #[error("Tool '{tool}' requires tier '{required}', session has '{actual}'")]
    TierViolation {
        tool: String,
        required: Tier,
        actual: Tier,
    },

    #[error("Hook from plugin '{plugin}' aborted the call: {message}")]
    HookFailure { plugin: String, message: String },

    #[error("Call cancelled")]
    Cancelled,

    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed for tier '{0}'")]
    AuthenticationFailed(Tier),

    #[error(transparent)]
    Tool(#[from] ToolError),
}

impl DispatchError {
    /// Stable error kind for the wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) => "UnknownTool",
            Self::TierViolation { .. } => "TierViolation",
            Self::HookFailure { .. } => "HookFailure",
            Self::Cancelled | Self::DeadlineExceeded(_) => "Cancelled",
            Self::Protocol(_) => "ProtocolError",
            Self::AuthenticationFailed(_) => "AuthenticationFailed",
            Self::Tool(tool) => match tool {
                ToolError::InvalidArguments(_) => "InvalidArguments",
                ToolError::NotFound(_) => "NotFound",
                ToolError::Entry(e) => e.kind(),
                ToolError::Index(e) => e.kind(),
                ToolError::Storage(_) => "StorageError",
                ToolError::Cancelled => "Cancelled",
                ToolError::Failed(_) => "ToolFailed",
            },
        }
    }
}

/// Context handed to a tool handler.
pub struct ToolContext<'a> {
    pub services: &'a Kbgate,
    pub tier: Tier,
    pub correlation_id: &'a str,
    pub cancel: &'a CancellationToken,
}

impl ToolContext<'_> {
    /// Return `ToolError::Cancelled` once the caller has gone away.
    ///
    /// # Errors
    ///
    /// Returns `ToolError::Cancelled` if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), ToolError> {
        if self.cancel.is_cancelled() {
            Err(ToolError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A tool implementation. Handlers are synchronous and run on the blocking pool.
pub trait ToolHandler: Send + Sync {
    /// Execute the tool.
    ///
    /// # Errors
    ///
    /// Returns `ToolError` describing why the call failed.
    fn call(&self, ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ToolError>;
}

impl<F> ToolHandler for F
where
    F: Fn(&ToolContext<'_>, &Value) -> Result<Value, ToolError> + Send + Sync,
{
    fn call(&self, ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ToolError> {
        self(ctx, args)
    }
}

/// A tool definition: name, required tier, category, description, handler.
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub tier: Tier,
    pub category: ToolCategory,
    pub description: String,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolSpec {
    pub fn new<F>(name: &str, tier: Tier, category: ToolCategory, description: &str, handler: F) -> Self
    where
        F: Fn(&ToolContext<'_>, &Value) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        Self::from_handler(name, tier, category, description, Arc::new(handler))
    }

    #[must_use]
    pub fn from_handler(
        name: &str,
        tier: Tier,
        category: ToolCategory,
        description: &str,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.to_string(),
            tier,
            category,
            description: description.to_string(),
            handler,
        }
    }
}

impl fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("tier", &self.tier)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

/// What `list_tools` reports for each tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub tier: Tier,
    pub category: ToolCategory,
    pub description: String,
    /// `host` or the contributing plugin's name.
    pub owner: String,
}

/// One tool call.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool: String,
    pub arguments: Value,
    pub correlation_id: String,
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    #[must_use]
    pub fn new(tool: &str, arguments: Value) -> Self {
        Self {
            tool: tool.to_string(),
            arguments,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            timeout: None,
        }
    }
}

/// A successful call result plus any recorded hook warnings.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutput {
    pub result: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Lifecycle of a protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Handshaken { tier: Tier },
    Dispatching { tier: Tier, in_flight: usize },
    Closed,
}

/// A connected client. The tier is fixed at handshake for the session's lifetime.
#[derive(Debug)]
pub struct Session {
    id: String,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: Mutex::new(SessionState::Connected),
            cancel: CancellationToken::new(),
        }
    }

    /// An already-handshaken in-process session (CLI, MCP bridge, tests).
    #[must_use]
    pub fn with_tier(tier: Tier) -> Self {
        let session = Self::new();
        *session.state.lock() = SessionState::Handshaken { tier };
        session
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    #[must_use]
    pub fn tier(&self) -> Option<Tier> {
        match *self.state.lock() {
            SessionState::Handshaken { tier } | SessionState::Dispatching { tier, .. } => Some(tier),
            SessionState::Connected | SessionState::Closed => None,
        }
    }

    /// Assign the session's tier. Only valid once, from `Connected`.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Protocol` if the session is already handshaken or closed.
    pub fn handshake(&self, tier: Tier) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Connected => {
                *state = SessionState::Handshaken { tier };
                Ok(())
            }
            SessionState::Closed => Err(DispatchError::Protocol("session closed".into())),
            SessionState::Handshaken { .. } | SessionState::Dispatching { .. } => Err(
                DispatchError::Protocol("already handshaken; reconnect to change tier".into()),
            ),
        }
    }

    /// Close the session and cancel everything still running on it.
    pub fn close(&self) {
        *self.state.lock() = SessionState::Closed;
        self.cancel.cancel();
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn begin_call(&self) -> Result<Tier, DispatchError> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Handshaken { tier } => {
                *state = SessionState::Dispatching { tier, in_flight: 1 };
                Ok(tier)
            }
            SessionState::Dispatching { tier, in_flight } => {
                *state = SessionState::Dispatching {
                    tier,
                    in_flight: in_flight + 1,
                };
                Ok(tier)
            }
            SessionState::Connected => Err(DispatchError::Protocol("handshake required".into())),
            SessionState::Closed => Err(DispatchError::Protocol("session closed".into())),
        }
    }

    fn end_call(&self) {
        let mut state = self.state.lock();
        if let SessionState::Dispatching { tier, in_flight } = *state {
            *state = if in_flight <= 1 {
                SessionState::Handshaken { tier }
            } else {
                SessionState::Dispatching {
                    tier,
                    in_flight: in_flight - 1,
                }
            };
        }
    }
}

struct CallGuard<'a>(&'a Session);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.end_call();
    }
}

/// Dispatches tool calls against the merged capability set.
pub struct Dispatcher {
    services: Arc<Kbgate>,
    workers: Arc<Semaphore>,
    default_timeout: Duration,
}

impl Dispatcher {
    #[must_use]
    pub fn new(services: Arc<Kbgate>) -> Self {
        let server = &services.config().server;
        let workers = Arc::new(Semaphore::new(server.workers));
        let default_timeout = Duration::from_millis(server.call_timeout_ms);
        Self {
            services,
            workers,
            default_timeout,
        }
    }

    #[must_use]
    pub fn services(&self) -> &Arc<Kbgate> {
        &self.services
    }

    /// Tools callable at `tier`, sorted by name.
    #[must_use]
    pub fn list_tools(&self, tier: Tier) -> Vec<ToolInfo> {
        self.services
            .registry()
            .capabilities()
            .tools()
            .filter(|tool| tool.spec.tier <= tier)
            .map(|tool| ToolInfo {
                name: tool.spec.name.clone(),
                tier: tool.spec.tier,
                category: tool.spec.category,
                description: tool.spec.description.clone(),
                owner: tool.owner.clone(),
            })
            .collect()
    }

    /// Call a tool; cancelled when the session closes.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::call_cancellable`].
    pub async fn call(&self, session: &Session, invocation: ToolInvocation) -> Result<ToolOutput, DispatchError> {
        let cancel = session.cancel_token().child_token();
        self.call_cancellable(session, invocation, cancel).await
    }

    /// Call a tool with an explicit cancellation token.
    ///
    /// Cancellation or deadline expiry before the handler starts aborts the
    /// call outright. Once running, the handler sees the token and may unwind;
    /// the caller gets `Cancelled` either way.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTool`, `TierViolation` (no hooks or handler run),
    /// `HookFailure`, `Cancelled`, `DeadlineExceeded`, or the handler's error.
    pub async fn call_cancellable(
        &self,
        session: &Session,
        invocation: ToolInvocation,
        cancel: CancellationToken,
    ) -> Result<ToolOutput, DispatchError> {
        let tier = session.begin_call()?;
        let _guard = CallGuard(session);

        let Some(tool) = self.services.registry().capabilities().tool(&invocation.tool) else {
            return Err(DispatchError::UnknownTool(invocation.tool));
        };
        let spec = tool.spec.clone();

        if tier < spec.tier {
            tracing::warn!(
                tool = %spec.name,
                required = %spec.tier,
                actual = %tier,
                session = %session.id(),
                "tier violation"
            );
            return Err(DispatchError::TierViolation {
                tool: spec.name,
                required: spec.tier,
                actual: tier,
            });
        }

        let timeout = invocation.timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;

        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DispatchError::Cancelled),
            () = tokio::time::sleep_until(deadline) => return Err(DispatchError::DeadlineExceeded(timeout)),
            permit = Arc::clone(&self.workers).acquire_owned() => {
                permit.map_err(|_| DispatchError::Cancelled)?
            }
        };

        let services = Arc::clone(&self.services);
        let call_cancel = cancel.child_token();
        let handler_cancel = call_cancel.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            execute(&services, &spec, tier, &invocation, &handler_cancel)
        });

        tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(e) => Err(ToolError::Failed(format!("tool task failed: {e}")).into()),
            },
            () = cancel.cancelled() => {
                call_cancel.cancel();
                Err(DispatchError::Cancelled)
            }
            () = tokio::time::sleep_until(deadline) => {
                call_cancel.cancel();
                Err(DispatchError::DeadlineExceeded(timeout))
            }
        }
    }
}

fn execute(
    services: &Kbgate,
    spec: &ToolSpec,
    tier: Tier,
    invocation: &ToolInvocation,
    cancel: &CancellationToken,
) -> Result<ToolOutput, DispatchError> {
    let capabilities = services.registry().capabilities();

    let before = HookContext {
        event: HookEvent::Before(spec.category),
        tool: Some(&spec.name),
        tier: Some(tier),
        correlation_id: Some(&invocation.correlation_id),
        arguments: Some(&invocation.arguments),
        result: None,
        kb: None,
        generation: None,
    };
    let mut warnings = hooks::fire_before(capabilities, &before)?;

    if cancel.is_cancelled() {
        return Err(DispatchError::Cancelled);
    }

    let ctx = ToolContext {
        services,
        tier,
        correlation_id: &invocation.correlation_id,
        cancel,
    };
    let result = match catch_unwind(AssertUnwindSafe(|| spec.handler.call(&ctx, &invocation.arguments))) {
        Ok(result) => result?,
        Err(_) => {
            tracing::error!(tool = %spec.name, "tool handler panicked");
            return Err(ToolError::Failed(format!("tool '{}' panicked", spec.name)).into());
        }
    };

    let after = HookContext {
        event: HookEvent::After(spec.category),
        result: Some(&result),
        ..before
    };
    warnings.extend(hooks::fire_notify(capabilities, &after));

    tracing::debug!(tool = %spec.name, correlation_id = %invocation.correlation_id, "tool call completed");
    Ok(ToolOutput { result, warnings })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_totally_ordered() {
        assert!(Tier::Read < Tier::Write);
        assert!(Tier::Write < Tier::Admin);
        assert_eq!("admin".parse::<Tier>().unwrap(), Tier::Admin);
        assert!("root".parse::<Tier>().is_err());
    }

    #[test]
    fn session_lifecycle() {
        let session = Session::new();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.begin_call().is_err());

        session.handshake(Tier::Write).unwrap();
        assert_eq!(session.tier(), Some(Tier::Write));
        assert!(session.handshake(Tier::Admin).is_err());

        assert_eq!(session.begin_call().unwrap(), Tier::Write);
        assert_eq!(session.begin_call().unwrap(), Tier::Write);
        assert_eq!(
            session.state(),
            SessionState::Dispatching {
                tier: Tier::Write,
                in_flight: 2
            }
        );
        session.end_call();
        session.end_call();
        assert_eq!(session.state(), SessionState::Handshaken { tier: Tier::Write });

        session.close();
        assert!(session.cancel_token().is_cancelled());
        assert_eq!(session.tier(), None);
        assert!(session.begin_call().is_err());
    }

    #[test]
    fn parse_args_treats_null_as_empty() {
        #[derive(Debug, Deserialize)]
        struct Args {
            #[serde(default)]
            limit: Option<usize>,
        }
        let args: Args = ToolError::parse_args(&Value::Null).unwrap();
        assert!(args.limit.is_none());

        let err = ToolError::parse_args::<Args>(&serde_json::json!({"limit": "x"})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn error_kinds_match_taxonomy() {
        let violation = DispatchError::TierViolation {
            tool: "delete_entry".into(),
            required: Tier::Write,
            actual: Tier::Read,
        };
        assert_eq!(violation.kind(), "TierViolation");
        assert_eq!(
            DispatchError::from(ToolError::Entry(EntryError::UnknownType {
                path: "a.md".into(),
                entry_type: "x".into(),
            }))
            .kind(),
            "UnknownTypeError"
        );
    }
}
