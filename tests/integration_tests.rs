//! Integration tests for steward
//!
//! These drive the built binary against temporary state roots and
//! verify the CLI surface: exit codes, listings, and the seeded-state
//! paths that don't require a live agent or platform.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

use steward::config::StewardConfig;
use steward::lease::LeasePool;
use steward::run::{Classification, Run, RunStatus, RunStore};

/// Helper to create a steward Command
fn steward_cmd() -> Command {
    cargo_bin_cmd!("steward")
}

fn state_root(dir: &TempDir) -> String {
    dir.path().join("state").display().to_string()
}

fn config_for(dir: &TempDir) -> StewardConfig {
    let mut config = StewardConfig::default();
    config.paths.state_root = dir.path().join("state");
    config.paths.workspace_root = dir.path().join("state/work");
    config
}

/// Write a steward.toml whose platform CLI cannot exist, so tests never
/// talk to a real platform client installed on the host.
fn offline_config(dir: &TempDir) -> String {
    let path = dir.path().join("steward.toml");
    std::fs::write(
        &path,
        format!(
            "[platform]\ncli = \"{}\"\n",
            dir.path().join("no-such-cli").display()
        ),
    )
    .unwrap();
    path.display().to_string()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        steward_cmd().arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        steward_cmd().arg("--version").assert().success();
    }

    #[test]
    fn test_status_empty_state() {
        let dir = TempDir::new().unwrap();
        steward_cmd()
            .args(["--state-root", &state_root(&dir), "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs."));
    }

    #[test]
    fn test_leases_empty_state() {
        let dir = TempDir::new().unwrap();
        steward_cmd()
            .args(["--state-root", &state_root(&dir), "leases"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No active leases."));
    }

    #[test]
    fn test_status_unknown_run_fails() {
        let dir = TempDir::new().unwrap();
        steward_cmd()
            .args(["--state-root", &state_root(&dir), "status", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_cancel_unknown_run_fails() {
        let dir = TempDir::new().unwrap();
        steward_cmd()
            .args(["--state-root", &state_root(&dir), "cancel", "nope"])
            .assert()
            .failure();
    }

    #[test]
    fn test_run_with_unknown_chain_fails() {
        let dir = TempDir::new().unwrap();
        steward_cmd()
            .args([
                "--state-root",
                &state_root(&dir),
                "run",
                "--ticket",
                "T-1",
                "--chain",
                "no-such-chain",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown chain"));
    }
}

// =============================================================================
// Health command
// =============================================================================

mod health {
    use super::*;

    #[test]
    fn test_health_empty_state_exits_zero() {
        let dir = TempDir::new().unwrap();
        steward_cmd()
            .args(["--state-root", &state_root(&dir), "health"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs."));
    }

    #[test]
    fn test_health_failed_run_exits_nonzero() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        let store = RunStore::new(&config.paths.state_root);

        let mut run = Run::new("T-1", "feature", Classification::Feature);
        run.status = RunStatus::Failed;
        run.next_steps = vec!["inspect_tool_output".into()];
        store.save(&mut run).unwrap();

        steward_cmd()
            .args(["--config", &offline_config(&dir)])
            .args(["--state-root", &state_root(&dir), "health"])
            .assert()
            .code(1)
            // Feature chain with no merge request artifact: died early.
            .stdout(predicate::str::contains("no_request"));
    }

    #[test]
    fn test_health_succeeded_run_is_healthy() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        let store = RunStore::new(&config.paths.state_root);

        let mut run = Run::new("T-2", "feature", Classification::Feature);
        run.status = RunStatus::Succeeded;
        run.artifacts.merge_request = Some("!1".into());
        run.artifacts.merge_commit = Some("abc123".into());
        store.save(&mut run).unwrap();

        steward_cmd()
            .args(["--config", &offline_config(&dir)])
            .args(["--state-root", &state_root(&dir), "health"])
            .assert()
            .success()
            .stdout(predicate::str::contains("healthy"));
    }

    #[test]
    fn test_health_archive_moves_terminal_healthy_runs() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        let store = RunStore::new(&config.paths.state_root);

        let mut run = Run::new("T-3", "feature", Classification::Feature);
        run.status = RunStatus::Succeeded;
        store.save(&mut run).unwrap();
        let run_id = run.run_id.clone();

        steward_cmd()
            .args(["--config", &offline_config(&dir)])
            .args(["--state-root", &state_root(&dir), "health", "--archive"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Archived"));

        // Archived runs leave the active listing.
        assert!(store.list().unwrap().is_empty());
        assert!(
            config
                .paths
                .state_root
                .join("archive")
                .join(&run_id)
                .join("run.json")
                .exists()
        );
    }
}

// =============================================================================
// Lease listing and sweep
// =============================================================================

mod leases {
    use super::*;

    #[test]
    fn test_leases_lists_seeded_lease() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        let pool = LeasePool::new(&config);
        pool.acquire("0123456789abcdef").unwrap();

        steward_cmd()
            .args(["--state-root", &state_root(&dir), "leases"])
            .assert()
            .success()
            .stdout(predicate::str::contains("31000/33000"))
            .stdout(predicate::str::contains("0123456789ab"));
    }

    #[test]
    fn test_sweep_with_fresh_lease_reclaims_nothing() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        let pool = LeasePool::new(&config);
        pool.acquire("0123456789abcdef").unwrap();

        steward_cmd()
            .args(["--state-root", &state_root(&dir), "leases", "--sweep"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to reclaim."));
    }
}

// =============================================================================
// Status detail
// =============================================================================

mod status {
    use super::*;

    #[test]
    fn test_status_lists_seeded_runs() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        let store = RunStore::new(&config.paths.state_root);

        let mut run = Run::new("TICKET-9", "bug", Classification::Bug);
        store.save(&mut run).unwrap();

        steward_cmd()
            .args(["--state-root", &state_root(&dir), "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("TICKET-9"))
            .stdout(predicate::str::contains("pending"));
    }

    #[test]
    fn test_status_detail_shows_next_steps() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        let store = RunStore::new(&config.paths.state_root);

        let mut run = Run::new("TICKET-10", "bug", Classification::Bug);
        run.status = RunStatus::Failed;
        run.next_steps = vec!["inspect_merge_request".into(), "operator_review".into()];
        store.save(&mut run).unwrap();

        steward_cmd()
            .args(["--state-root", &state_root(&dir), "status", &run.run_id])
            .assert()
            .success()
            .stdout(predicate::str::contains(&run.run_id))
            .stdout(predicate::str::contains("inspect_merge_request"));
    }
}
