//! Delegated-tool failure propagation for the test phase.
//!
//! The test phase hands execution to an external tool and expects a
//! structured JSON summary on stdout. This verifier refuses to let the
//! phase report success when the tool crashed, timed out, or returned
//! output that does not parse — the historical failure mode was a test
//! runner that died mid-run and was still counted as "passed".

use serde::{Deserialize, Serialize};

use super::{ReasonCategory, VerificationResult};

/// Captured result of one delegated tool execution.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    /// Exit code, if the process ran to completion.
    pub exit_code: Option<i32>,
    /// Whether the invocation was killed after exceeding its timeout.
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

/// The summary blob a well-behaved test tool prints to stdout.
///
/// The tool is expected to exit zero and report failures here, not via
/// its exit code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    #[serde(default)]
    pub skipped: u32,
}

/// Verify a delegated tool invocation and extract its summary.
///
/// Returns the summary only when the verifier passed; callers must still
/// check `summary.failed == 0` before reporting phase success.
pub fn verify_tool_result(inv: &ToolInvocation) -> (VerificationResult, Option<TestSummary>) {
    if inv.timed_out {
        return (
            VerificationResult::fail(
                ReasonCategory::ToolTimeout,
                "tool exceeded its timeout and was killed",
                vec![format!("stderr tail: {}", tail(&inv.stderr, 200))],
            ),
            None,
        );
    }

    // Output that does not parse is malformed regardless of exit code:
    // a tool that died with code 1 and garbage output tells us nothing
    // about the tests, only that its result cannot be trusted.
    let Some(summary) = parse_summary(&inv.stdout) else {
        return (
            VerificationResult::fail(
                ReasonCategory::MalformedOutput,
                "tool output did not contain a parsable summary",
                vec![
                    format!("exit code: {:?}", inv.exit_code),
                    format!("stdout tail: {}", tail(&inv.stdout, 200)),
                ],
            ),
            None,
        );
    };

    match inv.exit_code {
        Some(0) => {}
        Some(code) => {
            return (
                VerificationResult::fail(
                    ReasonCategory::ToolCrash,
                    format!("tool exited with code {}", code),
                    vec![format!("stderr tail: {}", tail(&inv.stderr, 200))],
                ),
                None,
            );
        }
        None => {
            return (
                VerificationResult::fail(
                    ReasonCategory::ToolCrash,
                    "tool was terminated by a signal",
                    vec![format!("stderr tail: {}", tail(&inv.stderr, 200))],
                ),
                None,
            );
        }
    }

    let evidence = vec![format!(
        "parsed tool summary: total={} passed={} failed={} skipped={}",
        summary.total, summary.passed, summary.failed, summary.skipped
    )];
    (VerificationResult::pass(evidence), Some(summary))
}

/// Attempt to parse a summary from tool stdout.
///
/// Accepts either a bare JSON object or an object embedded in a noisy
/// line (e.g. `[runner] {"total": 10, ...}`); the last parsable object
/// in the output wins so progress lines don't shadow the final summary.
pub fn parse_summary(stdout: &str) -> Option<TestSummary> {
    let mut last = None;
    for line in stdout.lines() {
        let trimmed = line.trim();
        if let Ok(summary) = serde_json::from_str::<TestSummary>(trimmed) {
            last = Some(summary);
            continue;
        }
        if let Some(start) = trimmed.find('{')
            && let Some(end) = trimmed.rfind('}')
            && end > start
            && let Ok(summary) = serde_json::from_str::<TestSummary>(&trimmed[start..=end])
        {
            last = Some(summary);
        }
    }
    last
}

fn tail(s: &str, max: usize) -> String {
    let s = s.trim();
    if s.len() <= max {
        s.to_string()
    } else {
        let mut start = s.len() - max;
        while !s.is_char_boundary(start) {
            start += 1;
        }
        format!("...{}", &s[start..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(exit_code: i32, stdout: &str) -> ToolInvocation {
        ToolInvocation {
            exit_code: Some(exit_code),
            timed_out: false,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_clean_run_passes_with_summary() {
        let inv = completed(0, r#"{"total": 12, "passed": 12, "failed": 0, "skipped": 0}"#);
        let (result, summary) = verify_tool_result(&inv);
        assert!(result.passed);
        let summary = summary.unwrap();
        assert_eq!(summary.total, 12);
        assert_eq!(summary.failed, 0);
    }

    #[test]
    fn test_failures_in_summary_still_verify() {
        // The verifier checks the tool ran honestly; failing tests are the
        // phase's concern, not the verifier's.
        let inv = completed(0, r#"{"total": 12, "passed": 9, "failed": 3}"#);
        let (result, summary) = verify_tool_result(&inv);
        assert!(result.passed);
        assert_eq!(summary.unwrap().failed, 3);
    }

    #[test]
    fn test_timeout_fails_with_tool_timeout() {
        let inv = ToolInvocation {
            exit_code: None,
            timed_out: true,
            stdout: String::new(),
            stderr: "still compiling...".into(),
        };
        let (result, summary) = verify_tool_result(&inv);
        assert!(!result.passed);
        assert_eq!(
            result.reason.unwrap().category,
            ReasonCategory::ToolTimeout
        );
        assert!(summary.is_none());
    }

    #[test]
    fn test_nonzero_exit_fails_with_tool_crash() {
        let inv = completed(1, r#"{"total": 5, "passed": 5, "failed": 0}"#);
        let (result, summary) = verify_tool_result(&inv);
        assert!(!result.passed);
        assert_eq!(result.reason.unwrap().category, ReasonCategory::ToolCrash);
        // Even parsable output is rejected after a crash.
        assert!(summary.is_none());
    }

    #[test]
    fn test_signal_termination_with_summary_is_tool_crash() {
        let inv = ToolInvocation {
            exit_code: None,
            timed_out: false,
            stdout: r#"{"total": 2, "passed": 2, "failed": 0}"#.to_string(),
            stderr: String::new(),
        };
        let (result, _) = verify_tool_result(&inv);
        assert_eq!(result.reason.unwrap().category, ReasonCategory::ToolCrash);
    }

    #[test]
    fn test_crashed_tool_with_unparsable_output_is_malformed() {
        // The exit code alone cannot categorize a run whose output is
        // garbage; the result blob is simply untrustworthy.
        let inv = completed(1, "Segmentation fault\n");
        let (result, summary) = verify_tool_result(&inv);
        assert!(!result.passed);
        assert_eq!(
            result.reason.unwrap().category,
            ReasonCategory::MalformedOutput
        );
        assert!(summary.is_none());
    }

    #[test]
    fn test_unparsable_output_fails_with_malformed_output() {
        let inv = completed(0, "error: could not compile `app`\n");
        let (result, summary) = verify_tool_result(&inv);
        assert!(!result.passed);
        assert_eq!(
            result.reason.unwrap().category,
            ReasonCategory::MalformedOutput
        );
        assert!(summary.is_none());
    }

    #[test]
    fn test_parse_summary_embedded_in_noise() {
        let stdout = "compiling...\n[runner] {\"total\": 3, \"passed\": 3, \"failed\": 0}\ndone\n";
        let summary = parse_summary(stdout).unwrap();
        assert_eq!(summary.total, 3);
    }

    #[test]
    fn test_parse_summary_last_object_wins() {
        let stdout = concat!(
            "{\"total\": 1, \"passed\": 0, \"failed\": 1}\n",
            "{\"total\": 10, \"passed\": 10, \"failed\": 0}\n"
        );
        let summary = parse_summary(stdout).unwrap();
        assert_eq!(summary.total, 10);
        assert_eq!(summary.failed, 0);
    }

    #[test]
    fn test_parse_summary_missing_required_field_is_none() {
        assert!(parse_summary(r#"{"passed": 3}"#).is_none());
        assert!(parse_summary("").is_none());
    }

    #[test]
    fn test_skipped_defaults_to_zero() {
        let summary = parse_summary(r#"{"total": 2, "passed": 2, "failed": 0}"#).unwrap();
        assert_eq!(summary.skipped, 0);
    }
}
