//! End-to-end CLI tests for kbgate.
//!
//! These tests exercise the full CLI binary with isolated test environments.
//! Each test creates its own temporary KB tree and config to ensure isolation.

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test Environment Helper
// =============================================================================

/// Isolated test environment with one KB (`notes`) and a config file.
struct TestEnv {
    _temp_dir: TempDir,
    kb_path: PathBuf,
    plugin_path: PathBuf,
    config_path: PathBuf,
}

impl TestEnv {
    /// Create a new environment with an empty KB.
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path();

        let kb_path = root.join("notes");
        fs::create_dir_all(&kb_path).expect("Failed to create KB dir");
        let plugin_path = root.join("plugins");
        fs::create_dir_all(&plugin_path).expect("Failed to create plugin dir");

        let config_path = root.join("config.toml");
        let config_content = format!(
            r#"
[logging]
level = "warn"

[plugins]
dirs = ['{}']

[[kb]]
name = "notes"
root = '{}'
types = [{{ name = "note" }}, {{ name = "decision", required = ["status"] }}]
"#,
            plugin_path.display(),
            kb_path.display()
        );
        fs::write(&config_path, config_content).expect("Failed to write config");

        Self {
            _temp_dir: temp_dir,
            kb_path,
            plugin_path,
            config_path,
        }
    }

    /// Create an environment with sample entries.
    fn with_entries() -> Self {
        let env = Self::new();

        fs::write(
            env.kb_path.join("a.md"),
            "---\ntype: note\n---\n# Apple Notes\n\nAn apple a day keeps the doctor away.\n",
        )
        .expect("Failed to write note");

        fs::create_dir_all(env.kb_path.join("decision")).expect("Failed to create decision dir");
        fs::write(
            env.kb_path.join("decision/storage.md"),
            "---\ntitle: Storage Engine\nstatus: open\n---\nPick an embedded storage engine.\n",
        )
        .expect("Failed to write decision");
        fs::write(
            env.kb_path.join("decision/logging.md"),
            "---\ntitle: Logging Stack\nstatus: accepted\n---\nUse structured logging.\n",
        )
        .expect("Failed to write decision");

        env
    }

    /// Get a Command configured for this test environment.
    fn command(&self) -> Command {
        let mut cmd = cargo_bin_cmd!("kbgate");
        cmd.env("KBGATE_CONFIG", &self.config_path);
        cmd.env_remove("RUST_LOG");
        cmd
    }
}

// =============================================================================
// 1. Help / Version
// =============================================================================

#[test]
fn no_subcommand_shows_help() {
    let env = TestEnv::new();

    env.command()
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("search"))
        .stdout(predicate::str::contains("reindex"));
}

#[test]
fn version_flag() {
    let env = TestEnv::new();

    env.command()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("kbgate"));
}

// =============================================================================
// 2. Search
// =============================================================================

#[test]
fn search_with_matches() {
    let env = TestEnv::with_entries();

    env.command()
        .args(["search", "apple"])
        .assert()
        .success()
        .stdout(predicate::str::contains("## Apple Notes"))
        .stdout(predicate::str::contains("notes/a.md"))
        .stdout(predicate::str::contains("1 of 1 result(s) shown"));
}

#[test]
fn search_with_no_matches() {
    let env = TestEnv::with_entries();

    env.command()
        .args(["search", "xyznonexistent123"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No matches found for 'xyznonexistent123'"));
}

#[test]
fn search_with_type_filter() {
    let env = TestEnv::with_entries();

    env.command()
        .args(["search", "storage", "--type", "note"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No matches found"));

    env.command()
        .args(["search", "storage", "--type", "decision"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Storage Engine"));
}

#[test]
fn search_unknown_kb_fails() {
    let env = TestEnv::with_entries();

    env.command()
        .args(["search", "apple", "--kb", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing"));
}

#[test]
fn search_with_config_flag() {
    let env = TestEnv::with_entries();

    let mut cmd = cargo_bin_cmd!("kbgate");
    cmd.env_remove("KBGATE_CONFIG")
        .arg("--config")
        .arg(&env.config_path)
        .args(["search", "apple"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Apple Notes"));
}

// =============================================================================
// 3. List / Get
// =============================================================================

#[test]
fn list_all_entries() {
    let env = TestEnv::with_entries();

    env.command()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("notes/a.md"))
        .stdout(predicate::str::contains("notes/decision/logging.md"))
        .stdout(predicate::str::contains("notes/decision/storage.md"));
}

#[test]
fn list_with_field_filter() {
    let env = TestEnv::with_entries();

    env.command()
        .args(["list", "--field", "status=open"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Storage Engine"))
        .stdout(predicate::str::contains("Logging Stack").not());
}

#[test]
fn list_with_bad_field_filter() {
    let env = TestEnv::with_entries();

    env.command()
        .args(["list", "--field", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected key=value"));
}

#[test]
fn list_empty_kb() {
    let env = TestEnv::new();

    env.command()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No entries found."));
}

#[test]
fn get_entry_by_id() {
    let env = TestEnv::with_entries();

    env.command()
        .args(["get", "notes/a.md"])
        .assert()
        .success()
        .stdout(predicate::str::contains("# Apple Notes"))
        .stdout(predicate::str::contains("An apple a day"));
}

#[test]
fn get_missing_entry_fails() {
    let env = TestEnv::with_entries();

    env.command()
        .args(["get", "notes/nope.md"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("NotFound"));
}

// =============================================================================
// 4. Admin commands
// =============================================================================

#[test]
fn reindex_reports_generation() {
    let env = TestEnv::with_entries();

    env.command()
        .arg("reindex")
        .assert()
        .success()
        .stdout(predicate::str::contains("notes: generation"));
}

#[test]
fn tools_default_to_read_tier() {
    let env = TestEnv::new();

    env.command()
        .arg("tools")
        .assert()
        .success()
        .stdout(predicate::str::contains("`search`"))
        .stdout(predicate::str::contains("`create_entry`").not())
        .stdout(predicate::str::contains("`reindex`").not());

    env.command()
        .args(["tools", "--tier", "admin"])
        .assert()
        .success()
        .stdout(predicate::str::contains("`create_entry`"))
        .stdout(predicate::str::contains("`reindex`"));
}

#[test]
fn plugins_report_manifests() {
    let env = TestEnv::with_entries();
    fs::write(
        env.plugin_path.join("saved.toml"),
        "name = \"saved\"\n[[tools]]\nname = \"open_decisions\"\nquery = \"storage\"\nentry_type = \"decision\"\n",
    )
    .expect("Failed to write manifest");
    fs::write(env.plugin_path.join("clash.toml"), "name = \"clash\"\n[[tools]]\nname = \"search\"\nquery = \"x\"\n")
        .expect("Failed to write manifest");

    env.command()
        .arg("plugins")
        .assert()
        .success()
        .stdout(predicate::str::contains("**saved**"))
        .stdout(predicate::str::contains("open_decisions"))
        .stdout(predicate::str::contains("**clash** quarantined (PluginConflictError)"));

    env.command()
        .arg("tools")
        .assert()
        .success()
        .stdout(predicate::str::contains("`open_decisions`"))
        .stdout(predicate::str::contains("(saved)"));
}

#[test]
fn invalid_config_fails_startup() {
    let env = TestEnv::new();
    fs::write(
        &env.config_path,
        "[[kb]]\nname = \"a\"\nroot = \"/x\"\n[[kb]]\nname = \"a\"\nroot = \"/y\"\n",
    )
    .expect("Failed to write config");

    env.command()
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate KB name"));
}

#[test]
fn missing_explicit_config_fails() {
    let env = TestEnv::new();
    let missing = env.kb_path.join("absent.toml");

    env.command()
        .arg("--config")
        .arg(&missing)
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("absent.toml"));
}

// =============================================================================
// 5. Serve (stdio)
// =============================================================================

#[test]
fn serve_stdio_answers_handshake_and_list_tools() {
    let env = TestEnv::with_entries();

    env.command()
        .arg("serve")
        .write_stdin(concat!(
            r#"{"type":"list_tools","id":"0"}"#,
            "\n",
            r#"{"type":"handshake","tier":"write"}"#,
            "\n",
            r#"{"type":"list_tools","id":"1"}"#,
            "\n",
            "not json\n",
        ))
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""type":"handshake""#))
        .stdout(predicate::str::contains(r#""type":"tools","id":"1""#))
        .stdout(predicate::str::contains(r#""name":"create_entry""#))
        .stdout(predicate::str::contains(r#""name":"reindex""#).not())
        .stdout(predicate::str::contains("handshake required"))
        .stdout(predicate::str::contains("malformed frame"));
}
