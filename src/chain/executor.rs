//! The per-run phase chain executor.
//!
//! One executor owns one run at a time and is the only writer of its
//! state record. The loop is deliberately rigid:
//!
//! 1. reload state (picks up external cancel marks between phases);
//! 2. skip phases that already completed (resume after crash);
//! 3. check the phase's declared prerequisites — a miss is `blocked`,
//!    a chain-configuration error distinct from a phase failing;
//! 4. before the final phase, require every artifact the chain should
//!    have produced so far — an incomplete run never reaches it;
//! 5. execute the body, append an immutable phase record, and stop the
//!    chain on the first failure or verification override.
//!
//! Every phase body returns a tagged outcome; there is no code path
//! where a swallowed error falls through to an implicit success.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::agent::AgentClient;
use crate::chain::{ChainRegistry, PhaseOutcome, PhaseSpec, phase_spec};
use crate::config::StewardConfig;
use crate::errors::{ChainError, StateError};
use crate::lease::{Lease, LeasePool};
use crate::platform::PlatformClient;
use crate::run::{
    ArtifactKind, Classification, LeaseRef, PhaseDetail, PhaseOutcomeKind, PhaseRecord, Run,
    RunStatus, RunStore,
};
use crate::verify::ReasonCategory;

/// Everything a phase body may touch. Bodies never write run state;
/// they only read it and return an outcome.
pub struct PhaseContext<'a> {
    pub run: &'a Run,
    pub lease: &'a Lease,
    pub config: &'a StewardConfig,
    pub agent: &'a AgentClient,
    pub platform: &'a PlatformClient,
    pub pool: &'a LeasePool,
    /// Run-scoped directory for phase logs and reports.
    pub run_dir: PathBuf,
}

/// Seam between the executor and the phase bodies. The default runner
/// dispatches on phase name; tests substitute scripted outcomes.
#[async_trait]
pub trait PhaseRunner: Send + Sync {
    async fn execute(&self, spec: &PhaseSpec, ctx: &PhaseContext<'_>) -> Result<PhaseOutcome>;
}

/// Machine-readable triage hints for a failed run.
pub fn next_steps_for(category: ReasonCategory) -> Vec<String> {
    let steps: &[&str] = match category {
        ReasonCategory::ToolCrash | ReasonCategory::ToolTimeout | ReasonCategory::MalformedOutput => {
            &["inspect_tool_output", "recover_run"]
        }
        ReasonCategory::TestFailures => &["inspect_test_report", "recover_run"],
        ReasonCategory::PhantomMerge => {
            &["inspect_merge_request", "keep_ticket_open", "operator_review"]
        }
        ReasonCategory::DataIntegrityMismatch => &["inspect_review_render", "operator_review"],
        ReasonCategory::AgentFailure => &["inspect_agent_log", "recover_run"],
        ReasonCategory::Cancelled => &["operator_review"],
    };
    steps.iter().map(|s| s.to_string()).collect()
}

pub struct ChainExecutor {
    config: StewardConfig,
    store: RunStore,
    pool: LeasePool,
    registry: ChainRegistry,
    agent: AgentClient,
    platform: PlatformClient,
    runner: Box<dyn PhaseRunner>,
}

impl ChainExecutor {
    pub fn new(config: StewardConfig) -> Result<Self> {
        let runner = Box::new(super::phases::DefaultPhaseRunner);
        Self::with_runner(config, runner)
    }

    /// Build an executor with a custom phase runner (tests).
    pub fn with_runner(config: StewardConfig, runner: Box<dyn PhaseRunner>) -> Result<Self> {
        let registry = ChainRegistry::load_or_default(&config.paths.state_root)?;
        Ok(Self {
            store: RunStore::new(&config.paths.state_root),
            pool: LeasePool::new(&config),
            agent: AgentClient::new(&config.agent),
            platform: PlatformClient::new(&config.platform),
            registry,
            config,
            runner,
        })
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    /// Create a new run for a ticket. The chain name defaults from the
    /// classification and is validated against the registry up front.
    pub fn create_run(
        &self,
        ticket_ref: &str,
        chain_name: Option<&str>,
        classification: Classification,
    ) -> Result<Run, ChainError> {
        let chain_name = chain_name.unwrap_or_else(|| classification.default_chain());
        self.registry.get(chain_name)?;

        let mut run = Run::new(ticket_ref, chain_name, classification);
        self.store.save(&mut run)?;
        info!(run_id = %run.run_id, ticket = %ticket_ref, chain = %chain_name, "run created");
        Ok(run)
    }

    /// Execute (or resume) a run's chain to a terminal status.
    pub async fn run_chain(&self, run_id: &str) -> Result<Run, ChainError> {
        let mut run = self.store.load(run_id)?;
        if run.status.is_terminal() {
            return Err(ChainError::AlreadyTerminal {
                run_id: run_id.to_string(),
                status: run.status.to_string(),
            });
        }

        let chain: Vec<String> = self.registry.get(&run.chain_name)?.to_vec();
        let lease = self.acquire_with_retry(run_id).await?;
        run.lease = Some(LeaseRef {
            slot_index: lease.slot_index,
            workspace_path: lease.workspace_path.clone(),
            port_pair: lease.port_pair,
        });
        if run.status == RunStatus::Pending {
            run.status = RunStatus::Running;
        }
        self.save_with_retry(&mut run)?;

        info!(
            run_id = %run.run_id,
            chain = %run.chain_name,
            slot = lease.slot_index,
            "chain started"
        );
        self.comment_best_effort(
            &run,
            "start",
            &format!("Executing chain '{}' in slot {}.", run.chain_name, lease.slot_index),
        )
        .await;

        let total = chain.len();
        for (idx, phase_name) in chain.iter().enumerate() {
            // Reload: an external writer may have marked the run for
            // termination between phases.
            run = self.store.load(run_id)?;

            if run.cancel_requested {
                return self.finish_cancelled(run, phase_name).await;
            }

            if run.has_completed(phase_name) {
                debug!(run_id = %run.run_id, phase = %phase_name, "phase already completed, skipping");
                continue;
            }

            let spec = phase_spec(phase_name).ok_or_else(|| ChainError::UnknownPhase {
                chain: run.chain_name.clone(),
                phase: phase_name.clone(),
            })?;

            if let Some(missing) = spec.requires.iter().find(|k| !run.artifacts.has(**k)) {
                return self.finish_blocked(
                    run,
                    phase_name,
                    *missing,
                    format!(
                        "phase '{}' requires artifact '{}' which no earlier phase recorded",
                        phase_name, missing
                    ),
                );
            }

            // The run may not reach its final phase incomplete — this is
            // checked here, not only at completion, so a trusting final
            // phase can never act on a half-finished run.
            if idx + 1 == total {
                let required = self.registry.required_before_final(&run.chain_name)?;
                if let Some(missing) = required.iter().find(|k| !run.artifacts.has(**k)) {
                    return self.finish_blocked(
                        run,
                        phase_name,
                        *missing,
                        format!(
                            "final phase '{}' reached with required artifact '{}' missing",
                            phase_name, missing
                        ),
                    );
                }
            }

            run.current_phase = Some(phase_name.clone());
            run.phase_started_at = Some(Utc::now());
            self.save_with_retry(&mut run)?;

            info!(run_id = %run.run_id, phase = %phase_name, "phase started");
            let started_at = Utc::now();
            let ctx = PhaseContext {
                run: &run,
                lease: &lease,
                config: &self.config,
                agent: &self.agent,
                platform: &self.platform,
                pool: &self.pool,
                run_dir: self.store.run_dir(run_id),
            };
            let outcome = match self.runner.execute(spec, &ctx).await {
                Ok(outcome) => outcome,
                Err(e) => PhaseOutcome::failure(
                    ReasonCategory::AgentFailure,
                    format!("phase body error: {:#}", e),
                ),
            };
            let ended_at = Utc::now();

            let (kind, reason, evidence) = match outcome {
                PhaseOutcome::Success {
                    detail,
                    artifacts,
                    evidence,
                } => {
                    run.phase_history.push(PhaseRecord {
                        phase_name: phase_name.clone(),
                        started_at,
                        ended_at,
                        outcome: PhaseOutcomeKind::Success,
                        detail: PhaseDetail::success(detail, evidence),
                    });
                    run.artifacts.merge(artifacts);
                    run.current_phase = None;
                    run.phase_started_at = None;
                    self.save_with_retry(&mut run)?;
                    if let Err(e) = self.pool.heartbeat(run_id) {
                        warn!(run_id = %run.run_id, error = %e, "lease heartbeat failed");
                    }
                    info!(run_id = %run.run_id, phase = %phase_name, "phase succeeded");
                    continue;
                }
                PhaseOutcome::Failure { reason, evidence } => {
                    (PhaseOutcomeKind::Failure, reason, evidence)
                }
                PhaseOutcome::VerificationFailed { reason, evidence } => {
                    (PhaseOutcomeKind::VerificationFailed, reason, evidence)
                }
            };

            // Fail-fast: the first failure or verification override ends
            // the chain.
            run.phase_history.push(PhaseRecord {
                phase_name: phase_name.clone(),
                started_at,
                ended_at,
                outcome: kind,
                detail: PhaseDetail::from_reason(&reason, evidence),
            });
            run.status = RunStatus::Failed;
            run.next_steps = next_steps_for(reason.category);
            self.save_with_retry(&mut run)?;

            warn!(
                run_id = %run.run_id,
                phase = %phase_name,
                category = %reason.category,
                outcome = %kind,
                "chain failed"
            );
            self.comment_best_effort(
                &run,
                phase_name,
                &format!(
                    "Phase '{}' failed ({}): {}\nNext steps: {}",
                    phase_name,
                    reason.category,
                    reason.detail,
                    run.next_steps.join(", ")
                ),
            )
            .await;
            return Ok(run);
        }

        // Completion invariant: every artifact the chain promises must
        // be present before the run may be marked succeeded.
        let required = self.registry.required_artifacts(&run.chain_name)?;
        if let Some(missing) = required.iter().find(|k| !run.artifacts.has(**k)) {
            run.status = RunStatus::Failed;
            run.next_steps = vec![
                "operator_review".to_string(),
                format!("missing_artifact:{}", missing),
            ];
            self.save_with_retry(&mut run)?;
            warn!(run_id = %run.run_id, artifact = %missing, "chain completed with missing artifact");
            return Ok(run);
        }

        run.status = RunStatus::Succeeded;
        run.current_phase = None;
        run.phase_started_at = None;
        self.save_with_retry(&mut run)?;
        self.pool.release(run_id)?;
        info!(run_id = %run.run_id, "chain succeeded");
        self.comment_best_effort(&run, "done", "All phases completed and verified.")
            .await;
        Ok(run)
    }

    /// Stop before `phase_name` because the run was externally marked
    /// for termination. Recorded, never silently dropped.
    async fn finish_cancelled(
        &self,
        mut run: Run,
        phase_name: &str,
    ) -> Result<Run, ChainError> {
        let now = Utc::now();
        run.phase_history.push(PhaseRecord {
            phase_name: phase_name.to_string(),
            started_at: now,
            ended_at: now,
            outcome: PhaseOutcomeKind::Failure,
            detail: PhaseDetail {
                summary: "termination requested before phase started".to_string(),
                category: Some(ReasonCategory::Cancelled),
                evidence: Vec::new(),
            },
        });
        run.status = RunStatus::Failed;
        run.next_steps = next_steps_for(ReasonCategory::Cancelled);
        self.save_with_retry(&mut run)?;
        warn!(run_id = %run.run_id, phase = %phase_name, "run cancelled between phases");
        self.comment_best_effort(&run, phase_name, "Run terminated on external request.")
            .await;
        Ok(run)
    }

    /// A prerequisite or pre-final artifact check failed: this is a
    /// chain-configuration error, not a phase failure.
    fn finish_blocked(
        &self,
        mut run: Run,
        phase_name: &str,
        missing: ArtifactKind,
        summary: String,
    ) -> Result<Run, ChainError> {
        run.current_phase = Some(phase_name.to_string());
        run.status = RunStatus::Blocked;
        run.next_steps = vec![
            "fix_chain_configuration".to_string(),
            format!("missing_artifact:{}", missing),
        ];
        self.save_with_retry(&mut run)?;
        warn!(run_id = %run.run_id, phase = %phase_name, artifact = %missing, "run blocked: {}", summary);
        Ok(run)
    }

    /// Lease acquisition with bounded retry on exhaustion. Callers never
    /// proceed without a lease. A full pool is swept for stale slots
    /// before each retry, so abandoned runs cannot starve new ones.
    async fn acquire_with_retry(&self, run_id: &str) -> Result<Lease, ChainError> {
        let mut delay = Duration::from_millis(500);
        let mut attempt = 0;
        loop {
            match self.pool.acquire(run_id) {
                Ok(lease) => return Ok(lease),
                Err(e) if e.is_retryable() && attempt < self.config.pool.acquire_retries => {
                    attempt += 1;
                    warn!(
                        run_id = %run_id,
                        attempt = attempt,
                        "lease pool exhausted, retrying"
                    );
                    let running: HashSet<String> = self
                        .store
                        .list()?
                        .into_iter()
                        .filter(|r| r.status == RunStatus::Running)
                        .map(|r| r.run_id)
                        .collect();
                    let reclaimed = self.pool.sweep(&running, Utc::now())?;
                    if reclaimed.is_empty() {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Save with bounded conflict retry. A conflict whose on-disk copy
    /// has *more* history than ours means a second executor progressed
    /// this run — that is never recovered from here.
    fn save_with_retry(&self, run: &mut Run) -> Result<(), ChainError> {
        const ATTEMPTS: u32 = 3;
        for _ in 0..ATTEMPTS {
            match self.store.save(run) {
                Ok(()) => return Ok(()),
                Err(StateError::Conflict { .. }) => {
                    let on_disk = self.store.load(&run.run_id)?;
                    if on_disk.phase_history.len() > run.phase_history.len() {
                        return Err(StateError::Conflict {
                            run_id: run.run_id.clone(),
                            expected: run.version,
                            found: on_disk.version,
                        }
                        .into());
                    }
                    // Stale version only (e.g. an external cancel mark);
                    // adopt the flag and version, then retry.
                    run.cancel_requested |= on_disk.cancel_requested;
                    run.version = on_disk.version;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ChainError::Other(anyhow!(
            "save retries exhausted for run {}",
            run.run_id
        )))
    }

    /// Progress comments are best-effort; a comment failure must never
    /// change a run's outcome.
    async fn comment_best_effort(&self, run: &Run, phase: &str, body: &str) {
        if let Err(e) = self
            .platform
            .comment(&run.ticket_ref, &run.run_id, phase, body)
            .await
        {
            debug!(run_id = %run.run_id, error = %e, "progress comment failed");
        }
    }
}
