//! Chain and phase registry.
//!
//! A chain is data: a named, ordered list of phase-name symbols resolved
//! against the static phase registry below. New chains are added by
//! listing phases in `chains.json` (or the built-in defaults), never by
//! modifying the executor.
//!
//! Every phase declares which artifact kinds it requires and which it
//! produces; the executor uses those declarations for prerequisite
//! checks and for the all-artifacts-present invariant that guards the
//! final phase.

pub mod executor;
pub mod phases;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::ChainError;
use crate::run::{ArtifactKind, Artifacts};
use crate::verify::{ReasonCategory, VerifyReason};

/// Registry entry for one phase kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSpec {
    pub name: &'static str,
    /// Artifact kinds that must be present before this phase may run.
    pub requires: &'static [ArtifactKind],
    /// Artifact kinds this phase records on success.
    pub produces: &'static [ArtifactKind],
}

/// The static phase registry. Order here is documentation only; chains
/// decide execution order.
pub const PHASES: &[PhaseSpec] = &[
    PhaseSpec {
        name: "plan",
        requires: &[],
        produces: &[ArtifactKind::Plan],
    },
    PhaseSpec {
        name: "build",
        requires: &[],
        produces: &[ArtifactKind::Branch],
    },
    PhaseSpec {
        name: "check",
        requires: &[ArtifactKind::Branch],
        produces: &[],
    },
    PhaseSpec {
        name: "test",
        requires: &[ArtifactKind::Branch],
        produces: &[ArtifactKind::TestReport],
    },
    PhaseSpec {
        name: "review",
        requires: &[ArtifactKind::TestReport],
        produces: &[ArtifactKind::ReviewSummary],
    },
    PhaseSpec {
        name: "document",
        requires: &[ArtifactKind::Branch],
        produces: &[ArtifactKind::DocUpdate],
    },
    PhaseSpec {
        name: "publish",
        requires: &[ArtifactKind::Branch, ArtifactKind::TestReport],
        produces: &[ArtifactKind::MergeRequest, ArtifactKind::MergeCommit],
    },
    PhaseSpec {
        name: "cleanup",
        requires: &[],
        produces: &[],
    },
];

/// Look up a phase by name.
pub fn phase_spec(name: &str) -> Option<&'static PhaseSpec> {
    PHASES.iter().find(|p| p.name == name)
}

/// Tagged result returned by every phase body. There is no implicit
/// success: a body that cannot prove it succeeded returns a failure.
#[derive(Debug, Clone)]
pub enum PhaseOutcome {
    Success {
        detail: String,
        artifacts: Artifacts,
        evidence: Vec<String>,
    },
    Failure {
        reason: VerifyReason,
        evidence: Vec<String>,
    },
    /// The phase's own work claimed success but a quality gate verifier
    /// refused to corroborate it.
    VerificationFailed {
        reason: VerifyReason,
        evidence: Vec<String>,
    },
}

impl PhaseOutcome {
    pub fn success(detail: impl Into<String>) -> Self {
        Self::Success {
            detail: detail.into(),
            artifacts: Artifacts::default(),
            evidence: Vec::new(),
        }
    }

    pub fn success_with(detail: impl Into<String>, artifacts: Artifacts, evidence: Vec<String>) -> Self {
        Self::Success {
            detail: detail.into(),
            artifacts,
            evidence,
        }
    }

    pub fn failure(category: ReasonCategory, detail: impl Into<String>) -> Self {
        Self::Failure {
            reason: VerifyReason::new(category, detail),
            evidence: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// On-disk format for custom chain definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainsFile {
    pub chains: BTreeMap<String, Vec<String>>,
}

impl ChainsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read chains file: {}", path.display()))?;
        let file: ChainsFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse chains JSON: {}", path.display()))?;
        Ok(file)
    }
}

/// The built-in chains. `feature` runs the full pipeline; `bug` skips
/// review and documentation; `chore` also skips planning.
fn default_chains() -> BTreeMap<String, Vec<String>> {
    let mut chains = BTreeMap::new();
    chains.insert(
        "feature".to_string(),
        ["plan", "build", "check", "test", "review", "document", "publish", "cleanup"]
            .map(String::from)
            .to_vec(),
    );
    chains.insert(
        "bug".to_string(),
        ["plan", "build", "check", "test", "publish", "cleanup"]
            .map(String::from)
            .to_vec(),
    );
    chains.insert(
        "chore".to_string(),
        ["build", "check", "test", "publish", "cleanup"]
            .map(String::from)
            .to_vec(),
    );
    chains
}

/// Named chains resolved against the phase registry.
#[derive(Debug)]
pub struct ChainRegistry {
    chains: BTreeMap<String, Vec<String>>,
}

impl ChainRegistry {
    /// Built-in chains only.
    pub fn builtin() -> Self {
        Self {
            chains: default_chains(),
        }
    }

    /// Built-in chains plus any defined in `chains.json` under the state
    /// root; file entries override built-ins of the same name.
    pub fn load_or_default(state_root: &Path) -> Result<Self> {
        let mut chains = default_chains();
        let path = state_root.join("chains.json");
        if path.exists() {
            let file = ChainsFile::load(&path)?;
            for (name, phases) in file.chains {
                chains.insert(name, phases);
            }
        }
        let registry = Self { chains };
        registry.validate()?;
        Ok(registry)
    }

    /// Every chain must reference only registered phases.
    fn validate(&self) -> Result<(), ChainError> {
        for (chain, phases) in &self.chains {
            for phase in phases {
                if phase_spec(phase).is_none() {
                    return Err(ChainError::UnknownPhase {
                        chain: chain.clone(),
                        phase: phase.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&[String], ChainError> {
        self.chains
            .get(name)
            .map(|v| v.as_slice())
            .ok_or_else(|| ChainError::UnknownChain {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(|s| s.as_str())
    }

    /// Whether a chain includes the publish phase (and should therefore
    /// end up with a merge request).
    pub fn expects_merge_request(&self, name: &str) -> bool {
        self.chains
            .get(name)
            .is_some_and(|phases| phases.iter().any(|p| p == "publish"))
    }

    /// Every artifact kind the chain's phases produce — all must be
    /// non-null before the run may be marked succeeded.
    pub fn required_artifacts(&self, name: &str) -> Result<Vec<ArtifactKind>, ChainError> {
        Ok(self.produced_by(self.get(name)?))
    }

    /// Artifact kinds produced by every phase *before* the final one;
    /// checked before the final phase executes so an incomplete run can
    /// never reach it.
    pub fn required_before_final(&self, name: &str) -> Result<Vec<ArtifactKind>, ChainError> {
        let phases = self.get(name)?;
        let head = &phases[..phases.len().saturating_sub(1)];
        Ok(self.produced_by(head))
    }

    fn produced_by(&self, phases: &[String]) -> Vec<ArtifactKind> {
        let mut kinds = Vec::new();
        for phase in phases {
            if let Some(spec) = phase_spec(phase) {
                for kind in spec.produces {
                    if !kinds.contains(kind) {
                        kinds.push(*kind);
                    }
                }
            }
        }
        kinds
    }
}
