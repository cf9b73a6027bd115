//! Built-in phase bodies.
//!
//! Each body does its delegated work (agent call, tool run, platform
//! call), gathers corroborating evidence, and returns a tagged
//! [`PhaseOutcome`]. Bodies that delegate to a quality gate verifier
//! surface its override as `VerificationFailed` — the phase's own
//! impression of success carries no weight against it.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use git2::Repository;
use tokio::process::Command;
use tracing::warn;

use crate::agent::{AgentError, AgentRequest, AgentResponse};
use crate::chain::executor::{PhaseContext, PhaseRunner};
use crate::chain::{PhaseOutcome, PhaseSpec};
use crate::run::Artifacts;
use crate::verify::tool::{ToolInvocation, verify_tool_result};
use crate::verify::{ReasonCategory, VerificationResult, VerifyReason, merge, render};

/// Turn a failed verification into the phase outcome that overrides the
/// phase's own self-report.
fn verifier_override(result: VerificationResult) -> PhaseOutcome {
    match result.reason {
        Some(reason) => PhaseOutcome::VerificationFailed {
            reason,
            evidence: result.evidence,
        },
        None => PhaseOutcome::failure(
            ReasonCategory::MalformedOutput,
            "verifier rejected the result without a reason",
        ),
    }
}

pub struct DefaultPhaseRunner;

#[async_trait]
impl PhaseRunner for DefaultPhaseRunner {
    async fn execute(&self, spec: &PhaseSpec, ctx: &PhaseContext<'_>) -> Result<PhaseOutcome> {
        match spec.name {
            "plan" => plan(ctx).await,
            "build" => build(ctx).await,
            "check" => check(ctx).await,
            "test" => test(ctx).await,
            "review" => review(ctx).await,
            "document" => document(ctx).await,
            "publish" => publish(ctx).await,
            "cleanup" => cleanup(ctx).await,
            other => bail!("no body registered for phase '{}'", other),
        }
    }
}

/// Derive the work branch for a run: a slug of the ticket plus a short
/// run-id suffix so concurrent runs for the same ticket never collide.
pub fn branch_name(ticket_ref: &str, run_id: &str) -> String {
    let slug = slugify(ticket_ref, 40);
    let slug = if slug.is_empty() { "change".to_string() } else { slug };
    let short = &run_id[..8.min(run_id.len())];
    format!("steward/{}-{}", slug, short)
}

/// Convert a title to a branch-safe slug, limited to `max_len` bytes.
pub fn slugify(title: &str, max_len: usize) -> String {
    let mut slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        // Slugs are ASCII by construction, so byte truncation is safe.
        slug.truncate(max_len);
        slug = slug.trim_end_matches('-').to_string();
    }
    slug
}

/// Invoke the agent for a phase, mapping every agent failure to a
/// tagged phase failure.
async fn agent_call(
    ctx: &PhaseContext<'_>,
    phase: &str,
    instruction: &str,
) -> Result<AgentResponse, PhaseOutcome> {
    let request = AgentRequest {
        ticket_ref: &ctx.run.ticket_ref,
        run_id: &ctx.run.run_id,
        phase,
        instruction,
        artifacts: &ctx.run.artifacts,
    };
    let log_path = ctx.run_dir.join(format!("phase-{}-output.log", phase));
    ctx.agent
        .invoke(&request, &ctx.lease.workspace_path, &log_path)
        .await
        .map_err(|e| {
            let detail = match &e {
                AgentError::Timeout { secs } => {
                    format!("agent timed out after {}s and was killed", secs)
                }
                other => format!("{}", other),
            };
            PhaseOutcome::failure(ReasonCategory::AgentFailure, detail)
        })
}

/// Run a delegated tool in the workspace with the lease's port pair in
/// its environment, killing it on timeout.
async fn run_tool(
    cmd: &str,
    args: &[String],
    workspace: &Path,
    ports: (u16, u16),
    timeout: Duration,
) -> std::io::Result<ToolInvocation> {
    let mut command = Command::new(cmd);
    command
        .args(args)
        .current_dir(workspace)
        .env("APP_PORT", ports.0.to_string())
        .env("PROXY_PORT", ports.1.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => Ok(ToolInvocation {
            exit_code: output.status.code(),
            timed_out: false,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(ToolInvocation {
            exit_code: None,
            timed_out: true,
            stdout: String::new(),
            stderr: String::new(),
        }),
    }
}

async fn plan(ctx: &PhaseContext<'_>) -> Result<PhaseOutcome> {
    let instruction = format!(
        "Write an implementation plan for ticket {} and reply with the path \
         of the produced plan document.",
        ctx.run.ticket_ref
    );
    let response = match agent_call(ctx, "plan", &instruction).await {
        Ok(response) => response,
        Err(outcome) => return Ok(outcome),
    };

    let path = match response {
        AgentResponse::File(path) => path,
        AgentResponse::Structured(value) => {
            let Some(raw) = value.get("plan_path").and_then(|v| v.as_str()) else {
                return Ok(PhaseOutcome::failure(
                    ReasonCategory::AgentFailure,
                    "agent returned no plan document",
                ));
            };
            let path = ctx.lease.workspace_path.join(raw);
            if !path.is_file() {
                return Ok(PhaseOutcome::failure(
                    ReasonCategory::AgentFailure,
                    format!("agent-reported plan {} does not exist", path.display()),
                ));
            }
            path
        }
    };

    Ok(PhaseOutcome::success_with(
        "plan document produced",
        Artifacts {
            plan_path: Some(path.clone()),
            ..Default::default()
        },
        vec![format!("plan written to {}", path.display())],
    ))
}

async fn build(ctx: &PhaseContext<'_>) -> Result<PhaseOutcome> {
    let branch = branch_name(&ctx.run.ticket_ref, &ctx.run.run_id);
    let instruction = format!(
        "Implement ticket {} in this workspace and commit the work to a new \
         branch named '{}'.",
        ctx.run.ticket_ref, branch
    );
    if let Err(outcome) = agent_call(ctx, "build", &instruction).await {
        return Ok(outcome);
    }

    // The agent's word is not enough: the branch must actually exist in
    // the workspace repository.
    let repo = match Repository::open(&ctx.lease.workspace_path) {
        Ok(repo) => repo,
        Err(e) => {
            return Ok(PhaseOutcome::failure(
                ReasonCategory::AgentFailure,
                format!("workspace is not a git repository: {}", e),
            ));
        }
    };
    match repo.find_branch(&branch, git2::BranchType::Local) {
        Ok(_) => Ok(PhaseOutcome::success_with(
            format!("change committed on {}", branch),
            Artifacts {
                branch_ref: Some(branch.clone()),
                ..Default::default()
            },
            vec![format!("branch {} exists in workspace", branch)],
        )),
        Err(_) => Ok(PhaseOutcome::failure(
            ReasonCategory::AgentFailure,
            format!("agent reported success but branch '{}' was not created", branch),
        )),
    }
}

async fn check(ctx: &PhaseContext<'_>) -> Result<PhaseOutcome> {
    let tools = &ctx.config.tools;
    let inv = match run_tool(
        &tools.check_cmd,
        &tools.check_args,
        &ctx.lease.workspace_path,
        ctx.lease.port_pair,
        Duration::from_secs(tools.check_timeout_secs),
    )
    .await
    {
        Ok(inv) => inv,
        Err(e) => {
            return Ok(PhaseOutcome::failure(
                ReasonCategory::ToolCrash,
                format!("failed to spawn check tool '{}': {}", tools.check_cmd, e),
            ));
        }
    };

    if inv.timed_out {
        return Ok(PhaseOutcome::failure(
            ReasonCategory::ToolTimeout,
            "static check tool exceeded its timeout",
        ));
    }
    match inv.exit_code {
        Some(0) => Ok(PhaseOutcome::success("static checks passed")),
        Some(code) => Ok(PhaseOutcome::failure(
            ReasonCategory::ToolCrash,
            format!("static check tool exited with code {}", code),
        )),
        None => Ok(PhaseOutcome::failure(
            ReasonCategory::ToolCrash,
            "static check tool was terminated by a signal",
        )),
    }
}

async fn test(ctx: &PhaseContext<'_>) -> Result<PhaseOutcome> {
    let tools = &ctx.config.tools;
    let inv = match run_tool(
        &tools.test_cmd,
        &tools.test_args,
        &ctx.lease.workspace_path,
        ctx.lease.port_pair,
        Duration::from_secs(tools.test_timeout_secs),
    )
    .await
    {
        Ok(inv) => inv,
        Err(e) => {
            return Ok(PhaseOutcome::failure(
                ReasonCategory::ToolCrash,
                format!("failed to spawn test tool '{}': {}", tools.test_cmd, e),
            ));
        }
    };

    let (result, summary) = verify_tool_result(&inv);
    if !result.passed {
        return Ok(verifier_override(result));
    }
    let Some(summary) = summary else {
        return Ok(PhaseOutcome::failure(
            ReasonCategory::MalformedOutput,
            "verifier passed without a summary",
        ));
    };

    if summary.failed > 0 {
        return Ok(PhaseOutcome::Failure {
            reason: VerifyReason::new(
                ReasonCategory::TestFailures,
                format!("{} of {} tests failed", summary.failed, summary.total),
            ),
            evidence: result.evidence,
        });
    }

    // Persist the report next to the run record so it survives workspace
    // cleanup.
    let report_path = ctx.run_dir.join("test-report.json");
    std::fs::create_dir_all(&ctx.run_dir)
        .with_context(|| format!("Failed to create run dir {}", ctx.run_dir.display()))?;
    std::fs::write(
        &report_path,
        serde_json::to_string_pretty(&summary).context("Failed to serialize test summary")?,
    )
    .with_context(|| format!("Failed to write {}", report_path.display()))?;

    Ok(PhaseOutcome::success_with(
        format!("all {} tests passed", summary.total),
        Artifacts {
            test_report_path: Some(report_path),
            ..Default::default()
        },
        result.evidence,
    ))
}

/// Number of entries a review render claims.
fn rendered_entries(value: &serde_json::Value) -> Option<u64> {
    value
        .get("entries")
        .and_then(|e| e.as_array())
        .map(|a| a.len() as u64)
}

/// Tail of every phase output log for this run, oldest first.
fn recent_phase_logs(run_dir: &Path) -> String {
    let mut paths: Vec<_> = match std::fs::read_dir(run_dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| {
                        let name = n.to_string_lossy();
                        name.starts_with("phase-") && name.ends_with(".log")
                    })
                    .unwrap_or(false)
            })
            .collect(),
        Err(_) => return String::new(),
    };
    paths.sort();

    let mut logs = String::new();
    for path in paths {
        if let Ok(content) = std::fs::read_to_string(&path) {
            let tail_start = content.len().saturating_sub(2000);
            let mut start = tail_start;
            while start < content.len() && !content.is_char_boundary(start) {
                start += 1;
            }
            logs.push_str(&content[start..]);
            logs.push('\n');
        }
    }
    logs
}

async fn review(ctx: &PhaseContext<'_>) -> Result<PhaseOutcome> {
    let instruction = format!(
        "Review the change for ticket {} in this workspace. Reply with a JSON \
         object {{\"entries\": [...]}} where each entry summarizes one \
         completed phase or notable change.",
        ctx.run.ticket_ref
    );
    let response = match agent_call(ctx, "review", &instruction).await {
        Ok(response) => response,
        Err(outcome) => return Ok(outcome),
    };

    let value = match response {
        AgentResponse::Structured(value) => value,
        AgentResponse::File(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read review file {}", path.display()))?;
            match serde_json::from_str(&content) {
                Ok(value) => value,
                Err(e) => {
                    return Ok(PhaseOutcome::failure(
                        ReasonCategory::MalformedOutput,
                        format!("review file is not valid JSON: {}", e),
                    ));
                }
            }
        }
    };

    let Some(rendered_rows) = rendered_entries(&value) else {
        return Ok(PhaseOutcome::failure(
            ReasonCategory::MalformedOutput,
            "review render has no entries field",
        ));
    };

    // Authoritative count: completed phase records in the state store.
    let authoritative = ctx
        .run
        .phase_history
        .iter()
        .filter(|r| r.outcome == crate::run::PhaseOutcomeKind::Success)
        .count() as u64;
    let logs = recent_phase_logs(&ctx.run_dir);

    let result = render::verify_rendered_report(rendered_rows, authoritative, &logs);
    if !result.passed {
        return Ok(verifier_override(result));
    }

    std::fs::create_dir_all(&ctx.run_dir)
        .with_context(|| format!("Failed to create run dir {}", ctx.run_dir.display()))?;
    let summary_path = ctx.run_dir.join("review-summary.json");
    std::fs::write(
        &summary_path,
        serde_json::to_string_pretty(&value).context("Failed to serialize review summary")?,
    )
    .with_context(|| format!("Failed to write {}", summary_path.display()))?;

    Ok(PhaseOutcome::success_with(
        format!("review rendered {} entries", rendered_rows),
        Artifacts {
            review_summary_path: Some(summary_path),
            ..Default::default()
        },
        result.evidence,
    ))
}

async fn document(ctx: &PhaseContext<'_>) -> Result<PhaseOutcome> {
    let instruction = format!(
        "Update the project documentation for the change on ticket {} and \
         reply with the path of the updated document.",
        ctx.run.ticket_ref
    );
    let response = match agent_call(ctx, "document", &instruction).await {
        Ok(response) => response,
        Err(outcome) => return Ok(outcome),
    };

    let path = match response {
        AgentResponse::File(path) => path,
        AgentResponse::Structured(value) => {
            let Some(raw) = value.get("doc_path").and_then(|v| v.as_str()) else {
                return Ok(PhaseOutcome::failure(
                    ReasonCategory::AgentFailure,
                    "agent returned no documentation update",
                ));
            };
            let path = ctx.lease.workspace_path.join(raw);
            if !path.is_file() {
                return Ok(PhaseOutcome::failure(
                    ReasonCategory::AgentFailure,
                    format!("agent-reported doc {} does not exist", path.display()),
                ));
            }
            path
        }
    };

    Ok(PhaseOutcome::success_with(
        "documentation updated",
        Artifacts {
            doc_update_path: Some(path),
            ..Default::default()
        },
        vec![],
    ))
}

async fn publish(ctx: &PhaseContext<'_>) -> Result<PhaseOutcome> {
    let branch = ctx
        .run
        .artifacts
        .branch_ref
        .clone()
        .context("publish requires a branch artifact")?;

    // Push the work branch so the platform can see it.
    let push = Command::new("git")
        .args(["push", "-u", "origin", &branch])
        .current_dir(&ctx.lease.workspace_path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await;
    match push {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            return Ok(PhaseOutcome::failure(
                ReasonCategory::AgentFailure,
                format!(
                    "failed to push branch {}: {}",
                    branch,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Err(e) => {
            return Ok(PhaseOutcome::failure(
                ReasonCategory::AgentFailure,
                format!("failed to run git push: {}", e),
            ));
        }
    }

    let title = format!("{}: automated change ({})", ctx.run.ticket_ref, &ctx.run.run_id[..8]);
    let body = format!(
        "Automated implementation for ticket {}.\n\nrun={}",
        ctx.run.ticket_ref, ctx.run.run_id
    );
    let mr_ref = match ctx.platform.open_merge_request(&branch, &title, &body).await {
        Ok(mr_ref) => mr_ref,
        Err(e) => {
            return Ok(PhaseOutcome::failure(
                ReasonCategory::AgentFailure,
                format!("merge request creation failed: {:#}", e),
            ));
        }
    };

    let reported = match ctx.platform.merge(&mr_ref).await {
        Ok(reported) => reported,
        Err(e) => {
            return Ok(PhaseOutcome::failure(
                ReasonCategory::AgentFailure,
                format!("merge failed: {:#}", e),
            ));
        }
    };
    let Some(merge_commit) = reported else {
        return Ok(PhaseOutcome::VerificationFailed {
            reason: VerifyReason::new(
                ReasonCategory::PhantomMerge,
                "platform reported merged but exposed no merge commit",
            ),
            evidence: vec![format!("merge request {}", mr_ref)],
        });
    };

    // Refresh local refs, then corroborate the platform's claim with an
    // independent ancestry check.
    let fetch = Command::new("git")
        .args(["fetch", "--all", "--quiet"])
        .current_dir(&ctx.lease.workspace_path)
        .output()
        .await;
    if let Err(e) = fetch {
        warn!(run_id = %ctx.run.run_id, error = %e, "git fetch before merge verification failed");
    }

    let result = merge::verify_merge_landed(
        &ctx.lease.workspace_path,
        &merge_commit,
        ctx.platform.target_branch(),
        &[],
    )?;
    if !result.passed {
        // The run is not marked succeeded and the ticket is never closed
        // on a phantom merge.
        return Ok(verifier_override(result));
    }

    if let Err(e) = ctx.platform.close_ticket(&ctx.run.ticket_ref).await {
        return Ok(PhaseOutcome::failure(
            ReasonCategory::AgentFailure,
            format!("merge landed but ticket close failed: {:#}", e),
        ));
    }

    Ok(PhaseOutcome::success_with(
        format!("merge request {} merged and verified", mr_ref),
        Artifacts {
            merge_request: Some(mr_ref),
            merge_commit: Some(merge_commit),
            ..Default::default()
        },
        result.evidence,
    ))
}

async fn cleanup(ctx: &PhaseContext<'_>) -> Result<PhaseOutcome> {
    let workspace = &ctx.lease.workspace_path;
    match std::fs::remove_dir_all(workspace) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to remove workspace {}", workspace.display()));
        }
    }
    ctx.pool.release(&ctx.run.run_id)?;

    Ok(PhaseOutcome::success_with(
        "workspace removed and lease released",
        Artifacts::default(),
        vec![format!("removed {}", workspace.display())],
    ))
}
