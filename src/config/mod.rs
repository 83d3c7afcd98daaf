//! Configuration loading for kbgate.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use directories::{BaseDirs, ProjectDirs};
use serde::Deserialize;
use thiserror::Error;

use crate::dispatch::Tier;
use crate::entry::{EntryTypeSchema, FieldValue};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "KBGATE_CONFIG";

/// Configuration problems. These are the only errors that stop startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration loaded from config.toml.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default, rename = "kb")]
    pub kbs: Vec<KbConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum concurrently executing tool calls.
    pub workers: usize,
    /// Deadline applied to calls that don't carry their own.
    pub call_timeout_ms: u64,
    /// TCP listen address for `serve --listen` when no flag is given.
    pub listen: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            call_timeout_ms: 30_000,
            listen: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    /// Extra weight for recently modified entries; 0 disables.
    pub recency_boost: f32,
    pub recency_half_life_days: f32,
    pub snippet_chars: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 100,
            recency_boost: 0.2,
            recency_half_life_days: 30.0,
            snippet_chars: 160,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Poll interval for background reconciliation; 0 disables polling.
    pub poll_interval_secs: u64,
}

/// Tokens required to handshake at each tier. A tier without a token is open.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub read_token: Option<String>,
    pub write_token: Option<String>,
    pub admin_token: Option<String>,
}

impl AuthConfig {
    /// Check a presented token against the one configured for `tier`.
    #[must_use]
    pub fn permits(&self, tier: Tier, presented: Option<&str>) -> bool {
        let required = match tier {
            Tier::Read => self.read_token.as_deref(),
            Tier::Write => self.write_token.as_deref(),
            Tier::Admin => self.admin_token.as_deref(),
        };
        match required {
            None => true,
            Some(expected) => presented == Some(expected),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    /// Tier granted to the MCP session.
    pub tier: Tier,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self { tier: Tier::Read }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Directories scanned for `*.toml` plugin manifests.
    pub dirs: Vec<String>,
    /// Plugin names that are never registered.
    pub disabled: Vec<String>,
}

/// One knowledge base definition.
#[derive(Debug, Clone, Deserialize)]
pub struct KbConfig {
    pub name: String,
    pub root: String,
    #[serde(default)]
    pub types: Vec<EntryTypeSchema>,
    #[serde(default)]
    pub defaults: BTreeMap<String, FieldValue>,
    /// Record `git rev-parse HEAD` on entries.
    #[serde(default)]
    pub git: bool,
}

impl KbConfig {
    #[must_use]
    pub fn root_path(&self) -> PathBuf {
        expand_tilde(&self.root)
    }
}

impl Config {
    /// Load config from an explicit path, `$KBGATE_CONFIG`, or
    /// `~/.config/kbgate/config.toml`. Only the default location may be
    /// absent, in which case defaults apply.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a user-supplied file is missing, or if any
    /// file cannot be read, parsed, or validated.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let chosen = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        if let Some(path) = chosen {
            return Self::from_file(&path);
        }

        match Self::config_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Config::default()),
        }
    }

    /// Load and validate a specific config file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` on syntax or validation errors.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "kbgate").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Look up a KB definition by name.
    #[must_use]
    pub fn kb(&self, name: &str) -> Option<&KbConfig> {
        self.kbs.iter().find(|kb| kb.name == name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for kb in &self.kbs {
            if kb.name.is_empty() || kb.name.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "KB name '{}' must be non-empty and contain no '/'",
                    kb.name
                )));
            }
            if !seen.insert(kb.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate KB name '{}'", kb.name)));
            }
            let mut types = BTreeSet::new();
            for schema in &kb.types {
                if !types.insert(schema.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "KB '{}' declares type '{}' twice",
                        kb.name, schema.name
                    )));
                }
            }
        }
        if self.server.workers == 0 {
            return Err(ConfigError::Invalid("server.workers must be at least 1".into()));
        }
        Ok(())
    }
}

/// Expand ~ to the user's home directory.
#[must_use]
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(base_dirs) = BaseDirs::new()
    {
        return base_dirs.home_dir().join(rest);
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kb_tables() {
        let config = Config::from_toml(
            r#"
            [search]
            recency_boost = 0.0

            [[kb]]
            name = "notes"
            root = "/tmp/notes"
            git = true
            types = [{ name = "note" }, { name = "decision", required = ["status"] }]

            [kb.defaults]
            type = "note"
            "#,
        )
        .unwrap();

        assert_eq!(config.kbs.len(), 1);
        let kb = config.kb("notes").unwrap();
        assert!(kb.git);
        assert_eq!(kb.types[1].required, vec!["status"]);
        assert_eq!(kb.defaults["type"], FieldValue::from("note"));
        assert!(config.search.recency_boost.abs() < f32::EPSILON);
        assert_eq!(config.server.workers, 8);
    }

    #[test]
    fn rejects_duplicate_kb_names() {
        let err = Config::from_toml(
            r#"
            [[kb]]
            name = "a"
            root = "/x"
            [[kb]]
            name = "a"
            root = "/y"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_slash_in_kb_name() {
        let err = Config::from_toml("[[kb]]\nname = \"a/b\"\nroot = \"/x\"\n").unwrap_err();
        assert!(err.to_string().contains("no '/'"));
    }

    #[test]
    fn auth_tokens_gate_tiers() {
        let auth = AuthConfig {
            read_token: None,
            write_token: Some("w".into()),
            admin_token: Some("a".into()),
        };
        assert!(auth.permits(Tier::Read, None));
        assert!(auth.permits(Tier::Write, Some("w")));
        assert!(!auth.permits(Tier::Write, Some("a")));
        assert!(!auth.permits(Tier::Admin, None));
    }

    #[test]
    fn mcp_tier_parses_lowercase() {
        let config = Config::from_toml("[mcp]\ntier = \"write\"\n").unwrap();
        assert_eq!(config.mcp.tier, Tier::Write);
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("absent.toml");

        let err = Config::load(Some(&missing)).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn explicit_path_is_loaded() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[[kb]]\nname = \"notes\"\nroot = \"/tmp/notes\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert!(config.kb("notes").is_some());
    }
}
