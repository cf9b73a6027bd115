//! CLI command implementations.
//!
//! | Module    | Commands handled            |
//! |-----------|-----------------------------|
//! | `run`     | `Run`, `Resume`, `Cancel`   |
//! | `status`  | `Status`                    |
//! | `health`  | `Health`                    |
//! | `recover` | `Recover`                   |
//! | `leases`  | `Leases`                    |

pub mod health;
pub mod leases;
pub mod recover;
pub mod run;
pub mod status;

pub use health::cmd_health;
pub use leases::cmd_leases;
pub use recover::cmd_recover;
pub use run::{cmd_cancel, cmd_resume, cmd_run};
pub use status::cmd_status;

use anyhow::Result;
use steward::config::StewardConfig;

use super::Cli;

/// Resolve configuration from `--config`/`--state-root` or discovery in
/// the current directory.
pub fn load_config(cli: &Cli) -> Result<StewardConfig> {
    match &cli.config {
        Some(path) => {
            let mut config = StewardConfig::load(path)?;
            if let Some(root) = &cli.state_root {
                config.paths.state_root = root.clone();
                config.paths.workspace_root = root.join("work");
            }
            Ok(config)
        }
        None => {
            let cwd = std::env::current_dir()?;
            StewardConfig::discover(&cwd, cli.state_root.as_deref())
        }
    }
}
