//! Run health classifier.
//!
//! Out-of-band, read-only diagnostic over all non-archived runs. The
//! caller gathers platform snapshots (ticket state, merge-request state,
//! CI rollup); classification itself is a pure function so it can be
//! exercised without a live platform. It never mutates run state.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;

use crate::config::HealthConfig;
use crate::platform::{CiRollup, MergeRequestSnapshot, MergeRequestState, TicketSnapshot, TicketState};
use crate::run::{Run, RunStatus};

/// Operator triage label for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLabel {
    /// Ticket closed and merge confirmed (or still in flight within the
    /// age threshold) — nothing needs an operator.
    Healthy,
    /// Still running past the age threshold.
    Stuck,
    /// Open merge request with all external CI checks green while the
    /// run is not progressing: a verifier and the platform disagree and
    /// an operator must look.
    BlockedCiPass,
    Failed,
    /// The chain should have produced a merge request and none exists —
    /// the run likely died early.
    NoRequest,
}

impl HealthLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Stuck => "stuck",
            Self::BlockedCiPass => "blocked_ci_pass",
            Self::Failed => "failed",
            Self::NoRequest => "no_request",
        }
    }
}

impl fmt::Display for HealthLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier thresholds, taken from configuration.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub stuck_after: Duration,
}

impl From<&HealthConfig> for HealthThresholds {
    fn from(config: &HealthConfig) -> Self {
        Self {
            stuck_after: Duration::seconds(config.stuck_after_secs as i64),
        }
    }
}

/// Classification report for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunHealth {
    pub run_id: String,
    pub ticket_ref: String,
    pub status: RunStatus,
    pub label: HealthLabel,
    pub detail: String,
}

/// Assign a health label to one run.
///
/// `expects_merge_request` is whether the run's chain contains a publish
/// phase; `ticket`/`mr` are `None` when the platform had no answer.
pub fn classify(
    run: &Run,
    expects_merge_request: bool,
    ticket: Option<&TicketSnapshot>,
    mr: Option<&MergeRequestSnapshot>,
    now: DateTime<Utc>,
    thresholds: HealthThresholds,
) -> RunHealth {
    let (label, detail) = classify_inner(run, expects_merge_request, ticket, mr, now, thresholds);
    RunHealth {
        run_id: run.run_id.clone(),
        ticket_ref: run.ticket_ref.clone(),
        status: run.status,
        label,
        detail,
    }
}

fn classify_inner(
    run: &Run,
    expects_merge_request: bool,
    ticket: Option<&TicketSnapshot>,
    mr: Option<&MergeRequestSnapshot>,
    now: DateTime<Utc>,
    thresholds: HealthThresholds,
) -> (HealthLabel, String) {
    let merge_confirmed = mr.is_some_and(|m| {
        m.state == MergeRequestState::Merged && m.merge_commit.is_some()
    });
    let ticket_closed = ticket.is_some_and(|t| t.state == TicketState::Closed);

    // Fully landed work is healthy regardless of what the run record
    // says — an operator may have finished it by hand.
    if merge_confirmed && ticket_closed {
        return (
            HealthLabel::Healthy,
            "ticket closed and merge confirmed; eligible for archival".to_string(),
        );
    }

    if run.status == RunStatus::Succeeded {
        return (
            HealthLabel::Healthy,
            "run succeeded with verified merge".to_string(),
        );
    }

    if run.status == RunStatus::Running || run.status == RunStatus::Pending {
        let reference = run.phase_started_at.unwrap_or(run.updated_at);
        let age = now - reference;
        if age > thresholds.stuck_after {
            return (
                HealthLabel::Stuck,
                format!(
                    "running phase '{}' for {} minutes",
                    run.current_phase.as_deref().unwrap_or("?"),
                    age.num_minutes()
                ),
            );
        }
        return (HealthLabel::Healthy, "in flight".to_string());
    }

    // Terminal failure cases below.
    if expects_merge_request && !run.artifacts.has(crate::run::ArtifactKind::MergeRequest) {
        return (
            HealthLabel::NoRequest,
            "no merge request exists for a chain that should have produced one".to_string(),
        );
    }

    if let Some(mr) = mr
        && mr.state == MergeRequestState::Open
        && mr.ci_rollup == CiRollup::Passing
    {
        return (
            HealthLabel::BlockedCiPass,
            "external CI is green on an open merge request but the run is not progressing"
                .to_string(),
        );
    }

    (
        HealthLabel::Failed,
        format!(
            "run {} ({})",
            run.status,
            run.next_steps.join(", ")
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::Classification;

    fn thresholds() -> HealthThresholds {
        HealthThresholds {
            stuck_after: Duration::seconds(10800),
        }
    }

    fn run_with_status(status: RunStatus) -> Run {
        let mut run = Run::new("T-1", "feature", Classification::Feature);
        run.status = status;
        run
    }

    fn merged_mr() -> MergeRequestSnapshot {
        MergeRequestSnapshot {
            reference: "!1".into(),
            state: MergeRequestState::Merged,
            merge_commit: Some("abc123".into()),
            ci_rollup: CiRollup::Passing,
        }
    }

    fn open_mr(ci: CiRollup) -> MergeRequestSnapshot {
        MergeRequestSnapshot {
            reference: "!1".into(),
            state: MergeRequestState::Open,
            merge_commit: None,
            ci_rollup: ci,
        }
    }

    fn closed_ticket() -> TicketSnapshot {
        TicketSnapshot {
            reference: "T-1".into(),
            state: TicketState::Closed,
            title: "done".into(),
        }
    }

    fn open_ticket() -> TicketSnapshot {
        TicketSnapshot {
            reference: "T-1".into(),
            state: TicketState::Open,
            title: "open".into(),
        }
    }

    #[test]
    fn test_closed_ticket_with_confirmed_merge_is_healthy() {
        let run = run_with_status(RunStatus::Succeeded);
        let health = classify(
            &run,
            true,
            Some(&closed_ticket()),
            Some(&merged_mr()),
            Utc::now(),
            thresholds(),
        );
        assert_eq!(health.label, HealthLabel::Healthy);
        assert!(health.detail.contains("archival"));
    }

    #[test]
    fn test_manually_finished_failed_run_is_healthy() {
        // The run record says failed, but an operator landed the work.
        let run = run_with_status(RunStatus::Failed);
        let health = classify(
            &run,
            true,
            Some(&closed_ticket()),
            Some(&merged_mr()),
            Utc::now(),
            thresholds(),
        );
        assert_eq!(health.label, HealthLabel::Healthy);
    }

    #[test]
    fn test_running_past_threshold_is_stuck() {
        let mut run = run_with_status(RunStatus::Running);
        run.current_phase = Some("build".into());
        run.phase_started_at = Some(Utc::now() - Duration::hours(4));
        let health = classify(&run, true, None, None, Utc::now(), thresholds());
        assert_eq!(health.label, HealthLabel::Stuck);
        assert!(health.detail.contains("build"));
    }

    #[test]
    fn test_running_within_threshold_is_healthy() {
        let mut run = run_with_status(RunStatus::Running);
        run.current_phase = Some("build".into());
        run.phase_started_at = Some(Utc::now() - Duration::minutes(10));
        let health = classify(&run, true, None, None, Utc::now(), thresholds());
        assert_eq!(health.label, HealthLabel::Healthy);
        assert_eq!(health.detail, "in flight");
    }

    #[test]
    fn test_failed_without_merge_request_is_no_request() {
        let run = run_with_status(RunStatus::Failed);
        let health = classify(&run, true, Some(&open_ticket()), None, Utc::now(), thresholds());
        assert_eq!(health.label, HealthLabel::NoRequest);
    }

    #[test]
    fn test_failed_without_mr_on_chain_without_publish_is_failed() {
        // A chain that never publishes cannot be no_request.
        let run = run_with_status(RunStatus::Failed);
        let health = classify(&run, false, None, None, Utc::now(), thresholds());
        assert_eq!(health.label, HealthLabel::Failed);
    }

    #[test]
    fn test_failed_with_green_open_mr_is_blocked_ci_pass() {
        let mut run = run_with_status(RunStatus::Failed);
        run.artifacts.merge_request = Some("!1".into());
        let health = classify(
            &run,
            true,
            Some(&open_ticket()),
            Some(&open_mr(CiRollup::Passing)),
            Utc::now(),
            thresholds(),
        );
        assert_eq!(health.label, HealthLabel::BlockedCiPass);
    }

    #[test]
    fn test_failed_with_red_mr_is_failed() {
        let mut run = run_with_status(RunStatus::Failed);
        run.artifacts.merge_request = Some("!1".into());
        run.next_steps = vec!["inspect_tool_output".into()];
        let health = classify(
            &run,
            true,
            Some(&open_ticket()),
            Some(&open_mr(CiRollup::Failing)),
            Utc::now(),
            thresholds(),
        );
        assert_eq!(health.label, HealthLabel::Failed);
        assert!(health.detail.contains("inspect_tool_output"));
    }

    #[test]
    fn test_blocked_run_is_failed_bucket() {
        let mut run = run_with_status(RunStatus::Blocked);
        run.artifacts.merge_request = Some("!1".into());
        let health = classify(&run, true, None, None, Utc::now(), thresholds());
        assert_eq!(health.label, HealthLabel::Failed);
    }

    #[test]
    fn test_succeeded_run_without_snapshots_is_healthy() {
        // Platform unavailable; the run's own verified terminal status
        // stands.
        let run = run_with_status(RunStatus::Succeeded);
        let health = classify(&run, true, None, None, Utc::now(), thresholds());
        assert_eq!(health.label, HealthLabel::Healthy);
    }

    #[test]
    fn test_label_strings() {
        assert_eq!(HealthLabel::BlockedCiPass.as_str(), "blocked_ci_pass");
        assert_eq!(HealthLabel::NoRequest.as_str(), "no_request");
    }
}
