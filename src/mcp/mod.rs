//! MCP server implementation for kbgate.
//!
//! Exposes the dispatcher as MCP tools for AI editors. Every call goes
//! through the same tier checks and hooks as the native protocol, with the
//! session tier taken from `[mcp] tier`.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use rmcp::{
    ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult, Content, ErrorCode, ErrorData as McpError, ServerCapabilities, ServerInfo,
    },
    schemars, tool, tool_handler, tool_router,
    transport::stdio,
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::commands::{self, Kbgate};
use crate::dispatch::{DispatchError, Dispatcher, Session, ToolError, ToolInvocation, ToolOutput};
use crate::search::{ListResponse, SearchResponse};

/// Parameters for `search_entries` tool.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SearchParams {
    #[schemars(description = "The search query")]
    pub query: String,
    #[schemars(description = "KBs to search (default: all)")]
    pub kbs: Option<Vec<String>>,
    #[schemars(description = "Filter by entry type")]
    pub entry_type: Option<String>,
    #[schemars(description = "Maximum number of results")]
    pub limit: Option<usize>,
    #[schemars(description = "Cursor from a previous response")]
    pub cursor: Option<String>,
}

/// Parameters for `list_entries` tool.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ListParams {
    #[schemars(description = "KBs to list (default: all)")]
    pub kbs: Option<Vec<String>>,
    #[schemars(description = "Filter by entry type")]
    pub entry_type: Option<String>,
    #[schemars(description = "Field filters: field equals value, or list field contains value")]
    pub fields: Option<BTreeMap<String, String>>,
    #[schemars(description = "Maximum number of entries")]
    pub limit: Option<usize>,
    #[schemars(description = "Cursor from a previous response")]
    pub cursor: Option<String>,
}

/// Parameters for `get_entry` tool.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct GetParams {
    #[schemars(description = "Entry id (e.g., 'notes/decisions/adr-1.md')")]
    pub id: String,
}

/// Parameters for `invoke_tool` tool.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct InvokeParams {
    #[schemars(description = "Tool name, as listed by available_tools")]
    pub tool: String,
    #[schemars(description = "Tool arguments object")]
    pub arguments: Option<Value>,
}

fn mcp_error(action: &str, err: &DispatchError) -> McpError {
    let code = match err {
        DispatchError::Tool(ToolError::InvalidArguments(_)) => ErrorCode::INVALID_PARAMS,
        _ => ErrorCode::INTERNAL_ERROR,
    };
    McpError {
        code,
        message: Cow::from(format!("{action} failed ({}): {err}", err.kind())),
        data: None,
    }
}

fn decode<T: serde::de::DeserializeOwned>(output: ToolOutput) -> Result<T, McpError> {
    serde_json::from_value(output.result).map_err(|e| McpError {
        code: ErrorCode::INTERNAL_ERROR,
        message: Cow::from(format!("Unexpected tool result: {e}")),
        data: None,
    })
}

/// MCP server exposing kbgate tools.
#[derive(Clone)]
pub struct KbgateServer {
    tool_router: ToolRouter<Self>,
    dispatcher: Arc<Dispatcher>,
    session: Arc<Session>,
}

#[tool_router]
impl KbgateServer {
    #[must_use]
    pub fn new(services: Arc<Kbgate>) -> Self {
        let tier = services.config().mcp.tier;
        Self {
            tool_router: Self::tool_router(),
            dispatcher: Arc::new(Dispatcher::new(services)),
            session: Arc::new(Session::with_tier(tier)),
        }
    }

    async fn call(&self, tool: &str, arguments: Value) -> Result<ToolOutput, McpError> {
        self.dispatcher
            .call(&self.session, ToolInvocation::new(tool, arguments))
            .await
            .map_err(|e| mcp_error(tool, &e))
    }

    #[tool(description = "Ranked full-text search across knowledge bases")]
    async fn search_entries(
        &self,
        Parameters(params): Parameters<SearchParams>,
    ) -> Result<CallToolResult, McpError> {
        let output = self
            .call(
                "search",
                json!({
                    "query": params.query,
                    "kbs": params.kbs.unwrap_or_default(),
                    "entry_type": params.entry_type,
                    "limit": params.limit,
                    "cursor": params.cursor,
                }),
            )
            .await?;
        let response: SearchResponse = decode(output)?;
        Ok(CallToolResult::success(vec![Content::text(commands::render_search(
            &params.query,
            &response,
        ))]))
    }

    #[tool(description = "List entries, optionally filtered by KB, type, and field values")]
    async fn list_entries(
        &self,
        Parameters(params): Parameters<ListParams>,
    ) -> Result<CallToolResult, McpError> {
        let output = self
            .call(
                "list_entries",
                json!({
                    "kbs": params.kbs.unwrap_or_default(),
                    "entry_type": params.entry_type,
                    "fields": params.fields.unwrap_or_default(),
                    "limit": params.limit,
                    "cursor": params.cursor,
                }),
            )
            .await?;
        let response: ListResponse = decode(output)?;
        Ok(CallToolResult::success(vec![Content::text(commands::render_list(&response))]))
    }

    #[tool(description = "Get the full contents of an entry by its id")]
    async fn get_entry(&self, Parameters(params): Parameters<GetParams>) -> Result<CallToolResult, McpError> {
        let output = self.call("get_entry", json!({ "id": params.id })).await?;
        Ok(CallToolResult::success(vec![Content::text(commands::render_entry(&output.result))]))
    }

    #[tool(description = "List every tool callable from this session, with tier and owner")]
    async fn available_tools(&self) -> Result<CallToolResult, McpError> {
        let tier = self.session.tier().unwrap_or(crate::dispatch::Tier::Read);
        let tools = self.dispatcher.list_tools(tier);
        Ok(CallToolResult::success(vec![Content::text(commands::render_tools(&tools))]))
    }

    #[tool(description = "Invoke any available tool by name with a JSON arguments object")]
    async fn invoke_tool(&self, Parameters(params): Parameters<InvokeParams>) -> Result<CallToolResult, McpError> {
        let output = self
            .call(&params.tool, params.arguments.unwrap_or(Value::Null))
            .await?;

        let mut text = serde_json::to_string_pretty(&output.result).unwrap_or_else(|_| output.result.to_string());
        for warning in &output.warnings {
            let _ = write!(text, "\n\n> Warning: {warning}");
        }
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }
}

#[tool_handler]
impl ServerHandler for KbgateServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "kbgate provides tiered access to markdown knowledge bases. \
                Use search_entries to find entries, list_entries to browse, \
                get_entry to read one, available_tools to see everything this \
                session may call, and invoke_tool to call it."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// Start the MCP server with stdio transport.
///
/// # Errors
///
/// Returns an error if the server fails to start or encounters a fatal error.
pub async fn serve(services: Arc<Kbgate>) -> anyhow::Result<()> {
    let server = KbgateServer::new(services);
    let session = Arc::clone(&server.session);
    let service = server.serve(stdio()).await?;
    service.waiting().await?;
    session.close();
    Ok(())
}
