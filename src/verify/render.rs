//! Rendered-output data-integrity cross-check for the review phase.
//!
//! A review render that shows "no data" is only acceptable when the
//! authoritative store also has no data and the recent operational logs
//! are clean. A blank page produced by a failed query looks identical to
//! a genuinely empty one; this check tells them apart.

use regex::RegexSet;
use std::sync::OnceLock;

use super::{ReasonCategory, VerificationResult};

/// Log lines matching any of these indicate the render pipeline failed
/// upstream even if the rendered output itself looked clean.
const ERROR_SIGNATURES: &[&str] = &[
    r"(?i)query failed",
    r"(?i)connection refused",
    r"(?i)permission denied",
    r"panicked at",
    r"(?i)\btimed? ?out\b",
    r"(?i)no such table",
];

fn signature_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| RegexSet::new(ERROR_SIGNATURES).expect("error signatures must compile"))
}

/// Cross-check a rendered report against the authoritative record count
/// and recent operational logs.
///
/// `rendered_rows` is the number of entries the rendered output claims;
/// `authoritative_count` is what the underlying store actually holds.
pub fn verify_rendered_report(
    rendered_rows: u64,
    authoritative_count: u64,
    recent_logs: &str,
) -> VerificationResult {
    if rendered_rows > 0 {
        return VerificationResult::pass(vec![format!(
            "rendered output reported {} entries",
            rendered_rows
        )]);
    }

    // Empty render: corroborate before accepting.
    if authoritative_count > 0 {
        return VerificationResult::fail(
            ReasonCategory::DataIntegrityMismatch,
            format!(
                "rendered output shows no data but the store holds {} record(s)",
                authoritative_count
            ),
            vec![format!("authoritative record count: {}", authoritative_count)],
        );
    }

    let hits = matched_signatures(recent_logs);
    if !hits.is_empty() {
        return VerificationResult::fail(
            ReasonCategory::DataIntegrityMismatch,
            "empty render with error signatures in recent logs",
            hits,
        );
    }

    VerificationResult::pass(vec![
        "authoritative store agrees: 0 records".into(),
        "no error signatures in recent logs".into(),
    ])
}

/// Collect the log lines that match a known error signature.
fn matched_signatures(logs: &str) -> Vec<String> {
    let set = signature_set();
    logs.lines()
        .filter(|line| set.is_match(line))
        .map(|line| format!("log: {}", line.trim()))
        .collect()
}
