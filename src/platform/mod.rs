//! Ticket/merge-request platform client.
//!
//! All calls shell out to the configured CLI (a `gh`-style tool) and
//! parse its JSON output. The platform's answers are treated as claims,
//! not ground truth — the publish phase pairs every "merged" report with
//! an independent ancestry check before believing it.
//!
//! Progress comments are tagged with the run id and phase name so the
//! engine can recognize (and ignore) its own comments instead of
//! reacting to them in a feedback loop.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::process::Stdio;
use std::str::FromStr;
use tokio::process::Command;
use tracing::debug;

use crate::config::PlatformConfig;

/// Marker prefix on every comment the engine posts.
const COMMENT_MARKER: &str = "[steward";

/// State of an external ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    Open,
    Closed,
}

impl FromStr for TicketState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid ticket state: {}", s)),
        }
    }
}

/// State of a merge request on the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRequestState {
    Open,
    Merged,
    Closed,
}

impl FromStr for MergeRequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "merged" => Ok(Self::Merged),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid merge request state: {}", s)),
        }
    }
}

/// Rolled-up result of a merge request's external CI checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiRollup {
    Passing,
    Failing,
    Pending,
    /// No checks configured or none reported.
    Unknown,
}

/// Point-in-time view of a ticket.
#[derive(Debug, Clone)]
pub struct TicketSnapshot {
    pub reference: String,
    pub state: TicketState,
    pub title: String,
}

/// Point-in-time view of a merge request.
#[derive(Debug, Clone)]
pub struct MergeRequestSnapshot {
    pub reference: String,
    pub state: MergeRequestState,
    /// The merge commit the platform claims landed, if any.
    pub merge_commit: Option<String>,
    pub ci_rollup: CiRollup,
}

// ── raw CLI JSON shapes ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawTicket {
    state: String,
    title: String,
}

#[derive(Debug, Deserialize)]
struct RawMergeRequest {
    state: String,
    #[serde(rename = "mergeCommit")]
    merge_commit: Option<RawCommit>,
    #[serde(rename = "statusCheckRollup", default)]
    status_check_rollup: Vec<RawCheck>,
}

#[derive(Debug, Deserialize)]
struct RawCommit {
    oid: String,
}

#[derive(Debug, Deserialize)]
struct RawCheck {
    #[serde(default)]
    conclusion: Option<String>,
}

/// Parse a `<cli> issue view --json state,title` payload.
pub fn parse_ticket(reference: &str, json: &str) -> Result<TicketSnapshot> {
    let raw: RawTicket = serde_json::from_str(json).context("Failed to parse ticket JSON")?;
    let state = raw
        .state
        .parse::<TicketState>()
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(TicketSnapshot {
        reference: reference.to_string(),
        state,
        title: raw.title,
    })
}

/// Parse a `<cli> pr view --json state,mergeCommit,statusCheckRollup`
/// payload.
pub fn parse_merge_request(reference: &str, json: &str) -> Result<MergeRequestSnapshot> {
    let raw: RawMergeRequest =
        serde_json::from_str(json).context("Failed to parse merge request JSON")?;
    let state = raw
        .state
        .parse::<MergeRequestState>()
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(MergeRequestSnapshot {
        reference: reference.to_string(),
        state,
        merge_commit: raw.merge_commit.map(|c| c.oid),
        ci_rollup: rollup(&raw.status_check_rollup),
    })
}

fn rollup(checks: &[RawCheck]) -> CiRollup {
    if checks.is_empty() {
        return CiRollup::Unknown;
    }
    let mut pending = false;
    for check in checks {
        match check.conclusion.as_deref() {
            Some("SUCCESS") | Some("NEUTRAL") | Some("SKIPPED") => {}
            Some("FAILURE") | Some("ERROR") | Some("CANCELLED") | Some("TIMED_OUT") => {
                return CiRollup::Failing;
            }
            _ => pending = true,
        }
    }
    if pending { CiRollup::Pending } else { CiRollup::Passing }
}

/// Build the tag line prepended to every engine comment.
pub fn comment_tag(run_id: &str, phase: &str) -> String {
    format!("{} run={} phase={}]", COMMENT_MARKER, run_id, phase)
}

/// Whether a comment body was written by the engine itself.
pub fn is_own_comment(body: &str) -> bool {
    body.trim_start().starts_with(COMMENT_MARKER)
}

pub struct PlatformClient {
    cli: String,
    target_branch: String,
}

impl PlatformClient {
    pub fn new(config: &PlatformConfig) -> Self {
        Self {
            cli: config.cli.clone(),
            target_branch: config.target_branch.clone(),
        }
    }

    pub fn target_branch(&self) -> &str {
        &self.target_branch
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(cli = %self.cli, args = ?args, "platform call");
        let output = Command::new(&self.cli)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run platform CLI '{}'", self.cli))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "platform CLI '{} {}' failed: {}",
                self.cli,
                args.join(" "),
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub async fn ticket(&self, ticket_ref: &str) -> Result<TicketSnapshot> {
        let json = self
            .run(&["issue", "view", ticket_ref, "--json", "state,title"])
            .await?;
        parse_ticket(ticket_ref, &json)
    }

    /// Post a progress comment tagged with the run id and phase.
    pub async fn comment(
        &self,
        ticket_ref: &str,
        run_id: &str,
        phase: &str,
        body: &str,
    ) -> Result<()> {
        let tagged = format!("{}\n{}", comment_tag(run_id, phase), body);
        self.run(&["issue", "comment", ticket_ref, "--body", &tagged])
            .await?;
        Ok(())
    }

    /// Open a merge request for `branch`; returns its reference (URL).
    pub async fn open_merge_request(
        &self,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        let stdout = self
            .run(&[
                "pr",
                "create",
                "--head",
                branch,
                "--base",
                &self.target_branch,
                "--title",
                title,
                "--body",
                body,
            ])
            .await?;
        let reference = stdout.trim().to_string();
        if reference.is_empty() {
            bail!("platform CLI returned no merge request reference");
        }
        Ok(reference)
    }

    /// Ask the platform to merge. Returns the merge commit the platform
    /// *claims* landed; callers must verify it independently.
    pub async fn merge(&self, mr_ref: &str) -> Result<Option<String>> {
        self.run(&["pr", "merge", mr_ref, "--merge"]).await?;
        let snapshot = self.merge_request(mr_ref).await?;
        Ok(snapshot.merge_commit)
    }

    pub async fn merge_request(&self, mr_ref: &str) -> Result<MergeRequestSnapshot> {
        let json = self
            .run(&[
                "pr",
                "view",
                mr_ref,
                "--json",
                "state,mergeCommit,statusCheckRollup",
            ])
            .await?;
        parse_merge_request(mr_ref, &json)
    }

    pub async fn close_ticket(&self, ticket_ref: &str) -> Result<()> {
        self.run(&["issue", "close", ticket_ref]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── comment tagging ──────────────────────────────────────────────

    #[test]
    fn test_comment_tag_format() {
        let tag = comment_tag("abc123", "publish");
        assert_eq!(tag, "[steward run=abc123 phase=publish]");
    }

    #[test]
    fn test_own_comments_are_recognized() {
        let body = format!("{}\nTests passed.", comment_tag("abc", "test"));
        assert!(is_own_comment(&body));
        assert!(is_own_comment("  [steward run=x phase=y]\nhello"));
    }

    #[test]
    fn test_foreign_comments_are_not_own() {
        assert!(!is_own_comment("Looks good to me!"));
        assert!(!is_own_comment("steward should pick this up"));
    }

    // ── ticket parsing ───────────────────────────────────────────────

    #[test]
    fn test_parse_open_ticket() {
        let json = r#"{"state": "OPEN", "title": "Fix login crash"}"#;
        let ticket = parse_ticket("42", json).unwrap();
        assert_eq!(ticket.state, TicketState::Open);
        assert_eq!(ticket.title, "Fix login crash");
        assert_eq!(ticket.reference, "42");
    }

    #[test]
    fn test_parse_closed_ticket() {
        let json = r#"{"state": "CLOSED", "title": "Done"}"#;
        let ticket = parse_ticket("7", json).unwrap();
        assert_eq!(ticket.state, TicketState::Closed);
    }

    #[test]
    fn test_parse_ticket_bad_json_is_error() {
        assert!(parse_ticket("1", "not json").is_err());
        assert!(parse_ticket("1", r#"{"state": "WEIRD", "title": "x"}"#).is_err());
    }

    // ── merge request parsing ────────────────────────────────────────

    #[test]
    fn test_parse_merged_mr_with_commit() {
        let json = r#"{
            "state": "MERGED",
            "mergeCommit": {"oid": "abc123def456"},
            "statusCheckRollup": [{"conclusion": "SUCCESS"}]
        }"#;
        let mr = parse_merge_request("!10", json).unwrap();
        assert_eq!(mr.state, MergeRequestState::Merged);
        assert_eq!(mr.merge_commit.as_deref(), Some("abc123def456"));
        assert_eq!(mr.ci_rollup, CiRollup::Passing);
    }

    #[test]
    fn test_parse_open_mr_without_commit() {
        let json = r#"{"state": "OPEN", "mergeCommit": null}"#;
        let mr = parse_merge_request("!11", json).unwrap();
        assert_eq!(mr.state, MergeRequestState::Open);
        assert!(mr.merge_commit.is_none());
        assert_eq!(mr.ci_rollup, CiRollup::Unknown);
    }

    #[test]
    fn test_rollup_any_failure_is_failing() {
        let json = r#"{
            "state": "OPEN",
            "statusCheckRollup": [
                {"conclusion": "SUCCESS"},
                {"conclusion": "FAILURE"},
                {"conclusion": null}
            ]
        }"#;
        let mr = parse_merge_request("!12", json).unwrap();
        assert_eq!(mr.ci_rollup, CiRollup::Failing);
    }

    #[test]
    fn test_rollup_incomplete_checks_are_pending() {
        let json = r#"{
            "state": "OPEN",
            "statusCheckRollup": [
                {"conclusion": "SUCCESS"},
                {"conclusion": null}
            ]
        }"#;
        let mr = parse_merge_request("!13", json).unwrap();
        assert_eq!(mr.ci_rollup, CiRollup::Pending);
    }

    #[test]
    fn test_rollup_all_green_variants_pass() {
        let json = r#"{
            "state": "OPEN",
            "statusCheckRollup": [
                {"conclusion": "SUCCESS"},
                {"conclusion": "NEUTRAL"},
                {"conclusion": "SKIPPED"}
            ]
        }"#;
        let mr = parse_merge_request("!14", json).unwrap();
        assert_eq!(mr.ci_rollup, CiRollup::Passing);
    }

    #[test]
    fn test_parse_mr_lowercase_state() {
        // Some platform CLIs report lowercase states.
        let json = r#"{"state": "merged", "mergeCommit": {"oid": "ff00"}}"#;
        let mr = parse_merge_request("!15", json).unwrap();
        assert_eq!(mr.state, MergeRequestState::Merged);
    }

    #[test]
    fn test_ticket_state_from_str() {
        assert_eq!("OPEN".parse::<TicketState>().unwrap(), TicketState::Open);
        assert_eq!(
            "closed".parse::<TicketState>().unwrap(),
            TicketState::Closed
        );
        assert!("reopened".parse::<TicketState>().is_err());
    }
}
