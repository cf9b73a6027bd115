//! Durable, resumable run state store.
//!
//! One JSON record per run at `<state_root>/runs/<run_id>/run.json`.
//! Saves are atomic (write-new-then-rename) so a crash mid-write never
//! leaves a half-updated record, and versioned so an accidental second
//! executor for the same run is detected instead of silently clobbering
//! state. Terminal runs are archived, never deleted.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

use crate::errors::StateError;
use crate::run::model::Run;

pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(state_root: &Path) -> Self {
        Self {
            root: state_root.to_path_buf(),
        }
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    /// The run-scoped directory; phase logs and other per-run files live
    /// next to the state record.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    fn record_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    pub fn load(&self, run_id: &str) -> Result<Run, StateError> {
        let path = self.record_path(run_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::NotFound {
                    run_id: run_id.to_string(),
                });
            }
            Err(e) => return Err(StateError::Io { path, source: e }),
        };
        serde_json::from_str(&content).map_err(|e| StateError::Corrupt { path, source: e })
    }

    /// Persist `run`, enforcing the optimistic version check and the
    /// append-only phase-history rule, then bump the caller's version.
    pub fn save(&self, run: &mut Run) -> Result<(), StateError> {
        let path = self.record_path(&run.run_id);

        match self.load(&run.run_id) {
            Ok(on_disk) => {
                if on_disk.version != run.version {
                    return Err(StateError::Conflict {
                        run_id: run.run_id.clone(),
                        expected: run.version,
                        found: on_disk.version,
                    });
                }
                // History only grows; a save that would shorten it holds
                // a stale copy no matter what its version claims.
                if on_disk.phase_history.len() > run.phase_history.len() {
                    return Err(StateError::Conflict {
                        run_id: run.run_id.clone(),
                        expected: run.version,
                        found: on_disk.version,
                    });
                }
            }
            Err(StateError::NotFound { .. }) => {
                if run.version != 0 {
                    return Err(StateError::Conflict {
                        run_id: run.run_id.clone(),
                        expected: run.version,
                        found: 0,
                    });
                }
            }
            Err(e) => return Err(e),
        }

        run.version += 1;
        run.updated_at = Utc::now();

        let dir = self.run_dir(&run.run_id);
        fs::create_dir_all(&dir).map_err(|e| StateError::Io {
            path: dir.clone(),
            source: e,
        })?;

        let content = serde_json::to_string_pretty(run).map_err(|e| StateError::Corrupt {
            path: path.clone(),
            source: e,
        })?;

        let tmp = dir.join("run.json.tmp");
        fs::write(&tmp, content).map_err(|e| StateError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| StateError::Io { path, source: e })
    }

    /// All non-archived runs, oldest first. Unparsable records are
    /// skipped with a warning so one corrupt file cannot hide the fleet.
    pub fn list(&self) -> Result<Vec<Run>, StateError> {
        let dir = self.runs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&dir).map_err(|e| StateError::Io {
            path: dir.clone(),
            source: e,
        })?;

        let mut runs = Vec::new();
        for entry in entries.flatten() {
            let run_id = entry.file_name().to_string_lossy().to_string();
            match self.load(&run_id) {
                Ok(run) => runs.push(run),
                Err(StateError::NotFound { .. }) => {}
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "skipping unreadable run record");
                }
            }
        }
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    /// Move a terminal run's directory into the archive. Archived runs
    /// no longer appear in `list`.
    pub fn archive(&self, run_id: &str) -> Result<(), StateError> {
        let from = self.run_dir(run_id);
        if !from.exists() {
            return Err(StateError::NotFound {
                run_id: run_id.to_string(),
            });
        }
        let archive = self.archive_dir();
        fs::create_dir_all(&archive).map_err(|e| StateError::Io {
            path: archive.clone(),
            source: e,
        })?;
        let to = archive.join(run_id);
        fs::rename(&from, &to).map_err(|e| StateError::Io {
            path: to,
            source: e,
        })
    }

    /// Mark a run for termination; honored by the executor at the next
    /// phase boundary.
    pub fn request_cancel(&self, run_id: &str) -> Result<(), StateError> {
        let mut run = self.load(run_id)?;
        run.cancel_requested = true;
        self.save(&mut run)
    }
}
