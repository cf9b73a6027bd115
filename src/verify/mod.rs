//! Quality gate verifiers.
//!
//! A verifier is an independent post-hoc check that refuses to accept a
//! phase's self-reported success without corroborating evidence:
//!
//! - [`tool::verify_tool_result`] — delegated-tool failure propagation
//!   (test phase): a crashed, timed-out, or unparsable tool run can never
//!   be reported as a passing test phase.
//! - [`merge::verify_merge_landed`] — merge-landed verification (publish
//!   phase): the reported merge commit must actually be an ancestor of the
//!   target branch tip.
//! - [`render::verify_rendered_report`] — rendered-output data-integrity
//!   cross-check (review phase): an empty render is not trusted while the
//!   authoritative store disagrees.
//!
//! Verifiers are pure functions of (phase result, external queries); they
//! never mutate run state. Their result is consumed by the chain
//! executor's outcome logic.

pub mod merge;
pub mod render;
pub mod tool;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable failure category attached to phase outcomes and
/// verification results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCategory {
    /// Delegated tool process exited non-zero.
    ToolCrash,
    /// Delegated tool exceeded its timeout and was killed.
    ToolTimeout,
    /// Delegated tool output failed to parse as the expected structure.
    MalformedOutput,
    /// Tool ran cleanly but its own failure count was non-zero.
    TestFailures,
    /// Platform reported a merge that never landed on the target branch.
    PhantomMerge,
    /// Rendered output contradicts the authoritative record count.
    DataIntegrityMismatch,
    /// External creative-work agent failed or produced unusable output.
    AgentFailure,
    /// Run was externally marked for termination.
    Cancelled,
}

impl ReasonCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolCrash => "tool_crash",
            Self::ToolTimeout => "tool_timeout",
            Self::MalformedOutput => "malformed_output",
            Self::TestFailures => "test_failures",
            Self::PhantomMerge => "phantom_merge",
            Self::DataIntegrityMismatch => "data_integrity_mismatch",
            Self::AgentFailure => "agent_failure",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ReasonCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured reason for a failed verification or phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyReason {
    pub category: ReasonCategory,
    pub detail: String,
}

impl VerifyReason {
    pub fn new(category: ReasonCategory, detail: impl Into<String>) -> Self {
        Self {
            category,
            detail: detail.into(),
        }
    }
}

/// Output of a quality gate verifier.
///
/// `evidence` records what was cross-checked, so a failed run's history
/// shows *why* the verifier disagreed with the phase's self-report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<VerifyReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
}

impl VerificationResult {
    pub fn pass(evidence: Vec<String>) -> Self {
        Self {
            passed: true,
            reason: None,
            evidence,
        }
    }

    pub fn fail(
        category: ReasonCategory,
        detail: impl Into<String>,
        evidence: Vec<String>,
    ) -> Self {
        Self {
            passed: false,
            reason: Some(VerifyReason::new(category, detail)),
            evidence,
        }
    }
}
