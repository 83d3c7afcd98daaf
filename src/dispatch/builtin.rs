//! Host tools registered before any plugin.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Tier, ToolCategory, ToolContext, ToolError, ToolSpec};
use crate::commands::{CreateEntryRequest, UpdateEntryRequest};
use crate::search::{ListRequest, SearchRequest};

fn to_json<T: Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError::Failed(format!("cannot encode result: {e}")))
}

#[derive(Deserialize)]
struct IdArgs {
    id: String,
}

#[derive(Deserialize)]
struct KbArgs {
    kb: String,
}

#[derive(Deserialize)]
struct OptionalKbArgs {
    #[serde(default)]
    kb: Option<String>,
}

fn search(ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ToolError> {
    let request: SearchRequest = ToolError::parse_args(args)?;
    to_json(&ctx.services.search().search(&request)?)
}

fn get_entry(ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ToolError> {
    let IdArgs { id } = ToolError::parse_args(args)?;
    match ctx.services.search().get(&id)? {
        Some(detail) => to_json(&detail),
        None => Err(ToolError::NotFound(format!("entry '{id}'"))),
    }
}

fn list_entries(ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ToolError> {
    let request: ListRequest = ToolError::parse_args(args)?;
    to_json(&ctx.services.search().list(&request)?)
}

fn list_kbs(ctx: &ToolContext<'_>, _args: &Value) -> Result<Value, ToolError> {
    to_json(&ctx.services.list_kbs())
}

fn kb_status(ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ToolError> {
    let OptionalKbArgs { kb } = ToolError::parse_args(args)?;
    to_json(&ctx.services.kb_status(kb.as_deref())?)
}

fn create_entry(ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ToolError> {
    let request: CreateEntryRequest = ToolError::parse_args(args)?;
    to_json(&ctx.services.create_entry(request, ctx.cancel)?)
}

fn update_entry(ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ToolError> {
    let request: UpdateEntryRequest = ToolError::parse_args(args)?;
    to_json(&ctx.services.update_entry(request, ctx.cancel)?)
}

fn delete_entry(ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ToolError> {
    let IdArgs { id } = ToolError::parse_args(args)?;
    to_json(&ctx.services.delete_entry(&id, ctx.cancel)?)
}

fn sync_kb(ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ToolError> {
    let KbArgs { kb } = ToolError::parse_args(args)?;
    ctx.check_cancelled()?;
    to_json(&ctx.services.sync_kb(&kb)?)
}

fn reindex(ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ToolError> {
    let OptionalKbArgs { kb } = ToolError::parse_args(args)?;
    ctx.check_cancelled()?;
    to_json(&ctx.services.reindex(kb.as_deref())?)
}

fn reload_kb(ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ToolError> {
    let KbArgs { kb } = ToolError::parse_args(args)?;
    ctx.check_cancelled()?;
    let report = ctx.services.reload_kb(&kb)?;
    Ok(json!({ "kb": kb, "reloaded": true, "sync": to_json(&report)? }))
}

fn plugin_report(ctx: &ToolContext<'_>, _args: &Value) -> Result<Value, ToolError> {
    to_json(ctx.services.plugin_report())
}

/// All built-in tools in registration order.
#[must_use]
pub fn builtin_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(
            "search",
            Tier::Read,
            ToolCategory::Query,
            "Ranked full-text search across KBs. Args: query, kbs?, entry_type?, limit?, cursor?",
            search,
        ),
        ToolSpec::new(
            "get_entry",
            Tier::Read,
            ToolCategory::Entry,
            "Fetch one entry by id (<kb>/<path> or <kb>/<explicit id>). Args: id",
            get_entry,
        ),
        ToolSpec::new(
            "list_entries",
            Tier::Read,
            ToolCategory::Entry,
            "List entries in id order. Args: kbs?, entry_type?, fields?, limit?, cursor?",
            list_entries,
        ),
        ToolSpec::new(
            "list_kbs",
            Tier::Read,
            ToolCategory::Entry,
            "List configured knowledge bases with their entry types and index state",
            list_kbs,
        ),
        ToolSpec::new(
            "kb_status",
            Tier::Read,
            ToolCategory::Maintenance,
            "Index generation, record count, availability and diagnostics. Args: kb?",
            kb_status,
        ),
        ToolSpec::new(
            "create_entry",
            Tier::Write,
            ToolCategory::Mutation,
            "Create an entry file. Args: kb, entry_type, title?, path?, fields?, body?",
            create_entry,
        ),
        ToolSpec::new(
            "update_entry",
            Tier::Write,
            ToolCategory::Mutation,
            "Update an entry's fields (null removes) or body. Args: id, fields?, body?",
            update_entry,
        ),
        ToolSpec::new(
            "delete_entry",
            Tier::Write,
            ToolCategory::Mutation,
            "Delete an entry file. Args: id",
            delete_entry,
        ),
        ToolSpec::new(
            "sync_kb",
            Tier::Write,
            ToolCategory::Maintenance,
            "Reconcile a KB's index with its files now. Args: kb",
            sync_kb,
        ),
        ToolSpec::new(
            "reindex",
            Tier::Admin,
            ToolCategory::Maintenance,
            "Rebuild one KB's index, or all of them, from scratch. Args: kb?",
            reindex,
        ),
        ToolSpec::new(
            "reload_kb",
            Tier::Admin,
            ToolCategory::Maintenance,
            "Re-read a KB's definition from the config file and rebuild it. Args: kb",
            reload_kb,
        ),
        ToolSpec::new(
            "plugin_report",
            Tier::Admin,
            ToolCategory::Maintenance,
            "Active, quarantined and disabled plugins",
            plugin_report,
        ),
    ]
}
