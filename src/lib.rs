//! kbgate - A tiered tool gateway over markdown knowledge bases.
//!
//! Each configured knowledge base (KB) is a directory of markdown files with
//! front matter. kbgate keeps a BM25 index per KB in step with the files,
//! merges entry types, tools, and hooks from plugins, and serves every
//! operation as a tool gated by a `read` < `write` < `admin` tier.
//!
//! # Modules
//!
//! - [`entry`] - Entry model, front-matter parser, content hashes
//! - [`kb`] - Knowledge base definitions
//! - [`plugin`] - Plugin descriptors, sources, and the plugin registry
//! - [`registry`] - The process-scoped registry of KBs and capabilities
//! - [`index`] - Per-KB tantivy indexes and immutable generations
//! - [`sync`] - Reconciliation of file trees into generations
//! - [`search`] - Ranked search, lookups, and listings
//! - [`storage`] - Entry file writes
//! - [`dispatch`] - Tool dispatcher, built-in tools, hooks
//! - [`protocol`] - Newline-delimited JSON tool protocol
//! - [`commands`] - Service layer and output rendering
//! - [`config`] - Configuration loading
//! - [`cli`] - Command-line interface definitions

pub mod cli;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod entry;
pub mod index;
pub mod kb;
pub mod plugin;
pub mod protocol;
pub mod registry;
pub mod search;
pub mod storage;
pub mod sync;

#[cfg(feature = "mcp")]
pub mod mcp;
