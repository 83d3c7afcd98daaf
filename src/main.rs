use std::sync::Arc;

use clap::Parser;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use kbgate::cli::{Cli, Commands};
use kbgate::commands::{self, Kbgate};
use kbgate::config::Config;
use kbgate::dispatch::{Dispatcher, Session, Tier, ToolInvocation};
use kbgate::plugin::PluginReport;
use kbgate::protocol;
use kbgate::search::{ListResponse, SearchResponse};
use kbgate::sync::SyncReport;

/// Logs go to stderr; stdout carries protocol frames and command output.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Run one tool in-process at `tier` and decode its result.
async fn invoke<T: DeserializeOwned>(
    dispatcher: &Dispatcher,
    tier: Tier,
    tool: &str,
    arguments: Value,
) -> anyhow::Result<T> {
    let session = Session::with_tier(tier);
    let output = dispatcher
        .call(&session, ToolInvocation::new(tool, arguments))
        .await
        .map_err(|e| anyhow::anyhow!("{} ({})", e, e.kind()))?;
    for warning in &output.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(serde_json::from_value(output.result)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let Some(command) = cli.command else {
        Cli::parse_from(["kbgate", "--help"]);
        return Ok(());
    };

    let config = Config::load(cli.config.as_deref())?;
    init_tracing(&config.logging.level);

    let config_path = cli.config.clone();
    let services = tokio::task::spawn_blocking(move || Kbgate::bootstrap(config, config_path, &[])).await??;
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&services)));

    match command {
        #[cfg(feature = "mcp")]
        Commands::Serve { mcp: true, .. } => {
            let _poller = services.spawn_poller();
            kbgate::mcp::serve(services).await
        }
        Commands::Serve { listen, .. } => {
            let _poller = services.spawn_poller();
            match listen.or_else(|| services.config().server.listen.clone()) {
                Some(addr) => protocol::serve_tcp(dispatcher, &addr).await,
                None => protocol::serve_stdio(dispatcher).await,
            }
        }
        Commands::Search {
            query,
            kbs,
            entry_type,
            limit,
            cursor,
        } => {
            let response: SearchResponse = invoke(
                &dispatcher,
                Tier::Read,
                "search",
                json!({ "query": query, "kbs": kbs, "entry_type": entry_type, "limit": limit, "cursor": cursor }),
            )
            .await?;
            println!("{}", commands::render_search(&query, &response));
            Ok(())
        }
        Commands::List {
            kbs,
            entry_type,
            fields,
            limit,
            cursor,
        } => {
            let fields = commands::parse_field_filters(&fields)?;
            let response: ListResponse = invoke(
                &dispatcher,
                Tier::Read,
                "list_entries",
                json!({ "kbs": kbs, "entry_type": entry_type, "fields": fields, "limit": limit, "cursor": cursor }),
            )
            .await?;
            println!("{}", commands::render_list(&response));
            Ok(())
        }
        Commands::Get { id } => {
            let entry: Value = invoke(&dispatcher, Tier::Read, "get_entry", json!({ "id": id })).await?;
            println!("{}", commands::render_entry(&entry));
            Ok(())
        }
        Commands::Reindex { kb } => {
            let reports: Vec<SyncReport> = invoke(&dispatcher, Tier::Admin, "reindex", json!({ "kb": kb })).await?;
            print!("{}", commands::render_sync(&reports));
            Ok(())
        }
        Commands::Tools { tier } => {
            print!("{}", commands::render_tools(&dispatcher.list_tools(tier)));
            Ok(())
        }
        Commands::Plugins => {
            let report: PluginReport = invoke(&dispatcher, Tier::Admin, "plugin_report", Value::Null).await?;
            println!("{}", commands::render_plugins(&report));
            Ok(())
        }
    }
}
