//! Run, phase-record, and artifact types.
//!
//! A `Run` is one execution of a change request through a named phase
//! chain. Runs are mutated exclusively by the chain executor — phase
//! bodies only return results — and every mutation flows through the
//! state store's atomic, versioned save.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::verify::{ReasonCategory, VerifyReason};

/// Lifecycle status of a run. Transitions are forward-only: a terminal
/// run is never resurrected without an explicit operator reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Blocked,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Blocked)
    }

    /// Whether `self -> to` is a legal forward transition.
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Blocked)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Coarse change-request classification; also selects the default chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Chore,
    Bug,
    Feature,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chore => "chore",
            Self::Bug => "bug",
            Self::Feature => "feature",
        }
    }

    /// The chain used when none is named explicitly.
    pub fn default_chain(&self) -> &'static str {
        match self {
            Self::Chore => "chore",
            Self::Bug => "bug",
            Self::Feature => "feature",
        }
    }
}

impl FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chore" => Ok(Self::Chore),
            "bug" => Ok(Self::Bug),
            "feature" => Ok(Self::Feature),
            _ => Err(format!("Invalid classification: {}", s)),
        }
    }
}

/// Outcome tag on a completed phase attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcomeKind {
    Success,
    Failure,
    VerificationFailed,
}

impl PhaseOutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::VerificationFailed => "verification_failed",
        }
    }
}

impl fmt::Display for PhaseOutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured detail attached to a phase record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDetail {
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ReasonCategory>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
}

impl PhaseDetail {
    pub fn success(summary: impl Into<String>, evidence: Vec<String>) -> Self {
        Self {
            summary: summary.into(),
            category: None,
            evidence,
        }
    }

    pub fn from_reason(reason: &VerifyReason, evidence: Vec<String>) -> Self {
        Self {
            summary: reason.detail.clone(),
            category: Some(reason.category),
            evidence,
        }
    }
}

/// Immutable log entry appended to a run's phase history.
///
/// Retries append new records; existing records are never edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: PhaseOutcomeKind,
    pub detail: PhaseDetail,
}

/// The kinds of artifact a phase can require or produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Plan,
    Branch,
    MergeRequest,
    MergeCommit,
    TestReport,
    ReviewSummary,
    DocUpdate,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Branch => "branch",
            Self::MergeRequest => "merge_request",
            Self::MergeCommit => "merge_commit",
            Self::TestReport => "test_report",
            Self::ReviewSummary => "review_summary",
            Self::DocUpdate => "doc_update",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed artifact pointers produced by phases. Each stays `None` until
/// its producing phase completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_report_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_summary_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_update_path: Option<PathBuf>,
}

impl Artifacts {
    pub fn has(&self, kind: ArtifactKind) -> bool {
        match kind {
            ArtifactKind::Plan => self.plan_path.is_some(),
            ArtifactKind::Branch => self.branch_ref.is_some(),
            ArtifactKind::MergeRequest => self.merge_request.is_some(),
            ArtifactKind::MergeCommit => self.merge_commit.is_some(),
            ArtifactKind::TestReport => self.test_report_path.is_some(),
            ArtifactKind::ReviewSummary => self.review_summary_path.is_some(),
            ArtifactKind::DocUpdate => self.doc_update_path.is_some(),
        }
    }

    /// Display form of one pointer, for status output and comments.
    pub fn get(&self, kind: ArtifactKind) -> Option<String> {
        match kind {
            ArtifactKind::Plan => self.plan_path.as_ref().map(|p| p.display().to_string()),
            ArtifactKind::Branch => self.branch_ref.clone(),
            ArtifactKind::MergeRequest => self.merge_request.clone(),
            ArtifactKind::MergeCommit => self.merge_commit.clone(),
            ArtifactKind::TestReport => self
                .test_report_path
                .as_ref()
                .map(|p| p.display().to_string()),
            ArtifactKind::ReviewSummary => self
                .review_summary_path
                .as_ref()
                .map(|p| p.display().to_string()),
            ArtifactKind::DocUpdate => self
                .doc_update_path
                .as_ref()
                .map(|p| p.display().to_string()),
        }
    }

    /// Merge pointers produced by a phase; per-field last-write-wins.
    pub fn merge(&mut self, other: Artifacts) {
        if other.plan_path.is_some() {
            self.plan_path = other.plan_path;
        }
        if other.branch_ref.is_some() {
            self.branch_ref = other.branch_ref;
        }
        if other.merge_request.is_some() {
            self.merge_request = other.merge_request;
        }
        if other.merge_commit.is_some() {
            self.merge_commit = other.merge_commit;
        }
        if other.test_report_path.is_some() {
            self.test_report_path = other.test_report_path;
        }
        if other.review_summary_path.is_some() {
            self.review_summary_path = other.review_summary_path;
        }
        if other.doc_update_path.is_some() {
            self.doc_update_path = other.doc_update_path;
        }
    }
}

/// Run-side view of an acquired lease. The pool owns the authoritative
/// slot table; this is the borrowed handle embedded in the run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRef {
    pub slot_index: usize,
    pub workspace_path: PathBuf,
    pub port_pair: (u16, u16),
}

/// One execution of a change request through a phase chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Opaque fixed-length identifier, generated once, embedded in all
    /// derived artifact names.
    pub run_id: String,
    pub ticket_ref: String,
    pub chain_name: String,
    pub classification: Classification,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phase_history: Vec<PhaseRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<LeaseRef>,
    #[serde(default)]
    pub artifacts: Artifacts,
    #[serde(default)]
    pub cancel_requested: bool,
    /// Machine-readable triage hints attached when the run fails.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_steps: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency version, bumped by every store save.
    #[serde(default)]
    pub version: u64,
}

impl Run {
    pub fn new(ticket_ref: &str, chain_name: &str, classification: Classification) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().simple().to_string(),
            ticket_ref: ticket_ref.to_string(),
            chain_name: chain_name.to_string(),
            classification,
            status: RunStatus::Pending,
            current_phase: None,
            phase_started_at: None,
            phase_history: Vec::new(),
            lease: None,
            artifacts: Artifacts::default(),
            cancel_requested: false,
            next_steps: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Whether `phase` has a successful record in the history (used to
    /// skip completed phases on resume).
    pub fn has_completed(&self, phase: &str) -> bool {
        self.phase_history
            .iter()
            .any(|r| r.phase_name == phase && r.outcome == PhaseOutcomeKind::Success)
    }

    /// Names of phases with a successful record, in completion order.
    pub fn completed_phases(&self) -> Vec<&str> {
        self.phase_history
            .iter()
            .filter(|r| r.outcome == PhaseOutcomeKind::Success)
            .map(|r| r.phase_name.as_str())
            .collect()
    }
}
