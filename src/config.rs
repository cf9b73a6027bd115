//! Unified configuration for the steward engine.
//!
//! Reads from `steward.toml` with sensible defaults for every field.
//! Both the lease pool capacity and the staleness-sweep timeout are
//! operational tuning parameters, exposed here rather than hard-coded.
//!
//! # Configuration File Format
//!
//! ```toml
//! [pool]
//! capacity = 100
//! app_port_base = 31000
//! proxy_port_base = 33000
//! stale_after_secs = 10800
//!
//! [agent]
//! cmd = "claude"
//! timeout_secs = 1800
//!
//! [platform]
//! cli = "gh"
//! target_branch = "main"
//!
//! [tools]
//! test_cmd = "cargo"
//! test_args = ["test", "--quiet"]
//! test_timeout_secs = 900
//!
//! [health]
//! stuck_after_secs = 10800
//!
//! [paths]
//! state_root = ".steward"
//! workspace_root = ".steward/work"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Lease pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent lease slots.
    pub capacity: usize,
    /// First port of the application range; slot N gets `app_port_base + N`.
    pub app_port_base: u16,
    /// First port of the proxy range; slot N gets `proxy_port_base + N`.
    pub proxy_port_base: u16,
    /// Heartbeat age after which a non-running owner's slot is reclaimed.
    pub stale_after_secs: u64,
    /// Bounded retries when the pool is exhausted.
    pub acquire_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            app_port_base: 31000,
            proxy_port_base: 33000,
            stale_after_secs: 10800,
            acquire_retries: 5,
        }
    }
}

/// External creative-work agent invocation settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub cmd: String,
    pub args: Vec<String>,
    /// Expiry is treated as a phase failure, never an indefinite hang.
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cmd: "claude".to_string(),
            args: vec!["--print".to_string()],
            timeout_secs: 1800,
        }
    }
}

/// Ticket/merge-request platform CLI settings.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub cli: String,
    pub target_branch: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            cli: "gh".to_string(),
            target_branch: "main".to_string(),
        }
    }
}

/// Delegated static-check and test tools.
///
/// The test tool must print a single JSON summary object
/// `{"total", "passed", "failed", "skipped"}` to stdout and exit zero
/// even when tests fail; anything else is rejected by the delegated-tool
/// verifier. Wrap project-specific runners in a small script if needed.
#[derive(Debug, Clone)]
pub struct ToolsConfig {
    pub check_cmd: String,
    pub check_args: Vec<String>,
    pub check_timeout_secs: u64,
    pub test_cmd: String,
    pub test_args: Vec<String>,
    pub test_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            check_cmd: "cargo".to_string(),
            check_args: vec!["clippy".to_string(), "--quiet".to_string()],
            check_timeout_secs: 600,
            test_cmd: "cargo".to_string(),
            test_args: vec!["test".to_string(), "--quiet".to_string()],
            test_timeout_secs: 900,
        }
    }
}

/// Run health classifier thresholds.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// A run still `running` past this age since its current phase
    /// started is labeled stuck.
    pub stuck_after_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stuck_after_secs: 10800,
        }
    }
}

/// Filesystem layout.
#[derive(Debug, Clone)]
pub struct PathsConfig {
    /// Run records, lease table, archive.
    pub state_root: PathBuf,
    /// Per-run workspaces live under here.
    pub workspace_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from(".steward"),
            workspace_root: PathBuf::from(".steward/work"),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default)]
pub struct StewardConfig {
    pub pool: PoolConfig,
    pub agent: AgentConfig,
    pub platform: PlatformConfig,
    pub tools: ToolsConfig,
    pub health: HealthConfig,
    pub paths: PathsConfig,
}

/// Raw TOML structure for `steward.toml`; every field optional.
#[derive(Debug, Default, Deserialize)]
struct StewardToml {
    pool: Option<PoolSection>,
    agent: Option<AgentSection>,
    platform: Option<PlatformSection>,
    tools: Option<ToolsSection>,
    health: Option<HealthSection>,
    paths: Option<PathsSection>,
}

#[derive(Debug, Default, Deserialize)]
struct PoolSection {
    capacity: Option<usize>,
    app_port_base: Option<u16>,
    proxy_port_base: Option<u16>,
    stale_after_secs: Option<u64>,
    acquire_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentSection {
    cmd: Option<String>,
    args: Option<Vec<String>>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PlatformSection {
    cli: Option<String>,
    target_branch: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ToolsSection {
    check_cmd: Option<String>,
    check_args: Option<Vec<String>>,
    check_timeout_secs: Option<u64>,
    test_cmd: Option<String>,
    test_args: Option<Vec<String>>,
    test_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct HealthSection {
    stuck_after_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PathsSection {
    state_root: Option<PathBuf>,
    workspace_root: Option<PathBuf>,
}

impl StewardConfig {
    /// Load configuration from a `steward.toml` at `path`, falling back
    /// to defaults for the file and every missing field.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let raw: StewardToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        Ok(Self::from_raw(raw))
    }

    /// Discover `steward.toml` in `dir` (or use defaults) and apply an
    /// optional state-root override from the CLI.
    pub fn discover(dir: &Path, state_root_override: Option<&Path>) -> Result<Self> {
        let mut config = Self::load(&dir.join("steward.toml"))?;
        if let Some(root) = state_root_override {
            config.paths.state_root = root.to_path_buf();
            config.paths.workspace_root = root.join("work");
        }
        Ok(config)
    }

    fn from_raw(raw: StewardToml) -> Self {
        let mut config = Self::default();
        if let Some(s) = raw.pool {
            if let Some(v) = s.capacity {
                config.pool.capacity = v;
            }
            if let Some(v) = s.app_port_base {
                config.pool.app_port_base = v;
            }
            if let Some(v) = s.proxy_port_base {
                config.pool.proxy_port_base = v;
            }
            if let Some(v) = s.stale_after_secs {
                config.pool.stale_after_secs = v;
            }
            if let Some(v) = s.acquire_retries {
                config.pool.acquire_retries = v;
            }
        }
        if let Some(s) = raw.agent {
            if let Some(v) = s.cmd {
                config.agent.cmd = v;
            }
            if let Some(v) = s.args {
                config.agent.args = v;
            }
            if let Some(v) = s.timeout_secs {
                config.agent.timeout_secs = v;
            }
        }
        if let Some(s) = raw.platform {
            if let Some(v) = s.cli {
                config.platform.cli = v;
            }
            if let Some(v) = s.target_branch {
                config.platform.target_branch = v;
            }
        }
        if let Some(s) = raw.tools {
            if let Some(v) = s.check_cmd {
                config.tools.check_cmd = v;
            }
            if let Some(v) = s.check_args {
                config.tools.check_args = v;
            }
            if let Some(v) = s.check_timeout_secs {
                config.tools.check_timeout_secs = v;
            }
            if let Some(v) = s.test_cmd {
                config.tools.test_cmd = v;
            }
            if let Some(v) = s.test_args {
                config.tools.test_args = v;
            }
            if let Some(v) = s.test_timeout_secs {
                config.tools.test_timeout_secs = v;
            }
        }
        if let Some(s) = raw.health
            && let Some(v) = s.stuck_after_secs
        {
            config.health.stuck_after_secs = v;
        }
        if let Some(s) = raw.paths {
            if let Some(v) = s.state_root {
                config.paths.state_root = v;
            }
            if let Some(v) = s.workspace_root {
                config.paths.workspace_root = v;
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = StewardConfig::default();
        assert_eq!(config.pool.capacity, 100);
        assert_eq!(config.pool.app_port_base, 31000);
        assert_eq!(config.pool.proxy_port_base, 33000);
        assert_eq!(config.pool.stale_after_secs, 10800);
        assert_eq!(config.agent.cmd, "claude");
        assert_eq!(config.platform.cli, "gh");
        assert_eq!(config.platform.target_branch, "main");
        assert_eq!(config.health.stuck_after_secs, 10800);
        assert_eq!(config.paths.state_root, PathBuf::from(".steward"));
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config = StewardConfig::load(&dir.path().join("steward.toml")).unwrap();
        assert_eq!(config.pool.capacity, 100);
    }

    #[test]
    fn test_load_partial_file_overlays_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("steward.toml");
        fs::write(
            &path,
            r#"
[pool]
capacity = 4
stale_after_secs = 60

[platform]
target_branch = "develop"
"#,
        )
        .unwrap();

        let config = StewardConfig::load(&path).unwrap();
        assert_eq!(config.pool.capacity, 4);
        assert_eq!(config.pool.stale_after_secs, 60);
        // Untouched fields keep defaults.
        assert_eq!(config.pool.app_port_base, 31000);
        assert_eq!(config.platform.target_branch, "develop");
        assert_eq!(config.platform.cli, "gh");
    }

    #[test]
    fn test_load_full_tools_section() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("steward.toml");
        fs::write(
            &path,
            r#"
[tools]
test_cmd = "./ci/report-tests"
test_args = []
test_timeout_secs = 120
"#,
        )
        .unwrap();

        let config = StewardConfig::load(&path).unwrap();
        assert_eq!(config.tools.test_cmd, "./ci/report-tests");
        assert!(config.tools.test_args.is_empty());
        assert_eq!(config.tools.test_timeout_secs, 120);
        // Check tool untouched.
        assert_eq!(config.tools.check_cmd, "cargo");
    }

    #[test]
    fn test_load_invalid_toml_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("steward.toml");
        fs::write(&path, "[pool\ncapacity = ").unwrap();
        let result = StewardConfig::load(&path);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_discover_applies_state_root_override() {
        let dir = tempdir().unwrap();
        let override_root = dir.path().join("custom-state");
        let config = StewardConfig::discover(dir.path(), Some(&override_root)).unwrap();
        assert_eq!(config.paths.state_root, override_root);
        assert_eq!(config.paths.workspace_root, override_root.join("work"));
    }
}
