//! External creative-work agent invocation.
//!
//! The agent is a black-box subprocess: it receives a minimal structured
//! JSON payload on stdin and is expected to answer with either a JSON
//! object or the path of a file it produced. Anything else — non-zero
//! exit, timeout, unusable output — is a phase failure; there is no
//! path where a broken agent call slides through as success.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::AgentConfig;
use crate::run::Artifacts;

/// Payload handed to the agent for one phase.
#[derive(Debug, Serialize)]
pub struct AgentRequest<'a> {
    pub ticket_ref: &'a str,
    pub run_id: &'a str,
    pub phase: &'a str,
    pub instruction: &'a str,
    /// Prior artifact references so the agent can build on earlier
    /// phases without re-deriving them.
    pub artifacts: &'a Artifacts,
}

/// What a successful agent call handed back.
#[derive(Debug, Clone)]
pub enum AgentResponse {
    /// Path to a file the agent produced (plan document, review, ...).
    File(PathBuf),
    /// Inline structured result.
    Structured(serde_json::Value),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn agent '{cmd}': {source}")]
    SpawnFailed {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent timed out after {secs}s and was killed")]
    Timeout { secs: u64 },

    #[error("agent exited with code {code}: {stderr_tail}")]
    NonZeroExit { code: i32, stderr_tail: String },

    #[error("agent output was not a JSON object or an existing file path: {detail}")]
    MalformedOutput { detail: String },
}

pub struct AgentClient {
    cmd: String,
    args: Vec<String>,
    timeout: Duration,
}

impl AgentClient {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            cmd: config.cmd.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Invoke the agent for one phase.
    ///
    /// Runs in `workspace`, writes the raw output to `log_path` for
    /// later triage, and force-kills the subprocess on timeout.
    pub async fn invoke(
        &self,
        request: &AgentRequest<'_>,
        workspace: &Path,
        log_path: &Path,
    ) -> Result<AgentResponse, AgentError> {
        let payload =
            serde_json::to_string(request).expect("agent request serialization is infallible");

        debug!(
            run_id = %request.run_id,
            phase = %request.phase,
            cmd = %self.cmd,
            "invoking agent"
        );

        let mut cmd = Command::new(&self.cmd);
        cmd.args(&self.args)
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| AgentError::SpawnFailed {
            cmd: self.cmd.clone(),
            source: e,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A dead agent closes stdin early; the exit status below is
            // the authoritative signal, not this write.
            let _ = stdin.write_all(payload.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(AgentError::SpawnFailed {
                    cmd: self.cmd.clone(),
                    source: e,
                });
            }
            Err(_) => {
                // kill_on_drop reaps the child.
                return Err(AgentError::Timeout {
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(
            log_path,
            format!("--- stdout ---\n{}\n--- stderr ---\n{}\n", stdout, stderr),
        );

        if !output.status.success() {
            return Err(AgentError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr_tail: tail(&stderr, 300),
            });
        }

        parse_response(&stdout, workspace)
    }
}

/// Interpret agent stdout: a JSON object anywhere in the output wins;
/// otherwise the last non-empty line is tried as a produced-file path
/// (absolute, or relative to the workspace).
fn parse_response(stdout: &str, workspace: &Path) -> Result<AgentResponse, AgentError> {
    let trimmed = stdout.trim();

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed)
        && value.is_object()
    {
        return Ok(AgentResponse::Structured(value));
    }

    if let Some(start) = trimmed.find('{')
        && let Some(end) = trimmed.rfind('}')
        && end > start
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(&trimmed[start..=end])
        && value.is_object()
    {
        return Ok(AgentResponse::Structured(value));
    }

    if let Some(line) = trimmed.lines().rev().find(|l| !l.trim().is_empty()) {
        let candidate = line.trim();
        let path = if Path::new(candidate).is_absolute() {
            PathBuf::from(candidate)
        } else {
            workspace.join(candidate)
        };
        if path.is_file() {
            return Ok(AgentResponse::File(path));
        }
    }

    Err(AgentError::MalformedOutput {
        detail: format!("output tail: {}", tail(trimmed, 200)),
    })
}

fn tail(s: &str, max: usize) -> String {
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
    use std::fs;
    use tempfile::tempdir;

    // ── parse_response ───────────────────────────────────────────────

    #[test]
    fn test_parse_bare_json_object() {
        let dir = tempdir().unwrap();
        let resp = parse_response(r#"{"entries": [1, 2, 3]}"#, dir.path()).unwrap();
        match resp {
            AgentResponse::Structured(value) => {
                assert_eq!(value["entries"].as_array().unwrap().len(), 3);
            }
            _ => panic!("Expected Structured"),
        }
    }

    #[test]
    fn test_parse_json_embedded_in_chatter() {
        let dir = tempdir().unwrap();
        let stdout = "Working on it...\n{\"summary\": \"done\"}\n";
        let resp = parse_response(stdout, dir.path()).unwrap();
        assert!(matches!(resp, AgentResponse::Structured(_)));
    }

    #[test]
    fn test_parse_relative_file_path() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("plan.md"), "# Plan").unwrap();
        let resp = parse_response("wrote the plan\nplan.md\n", dir.path()).unwrap();
        match resp {
            AgentResponse::File(path) => assert!(path.ends_with("plan.md")),
            _ => panic!("Expected File"),
        }
    }

    #[test]
    fn test_parse_absolute_file_path() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("out.md");
        fs::write(&file, "content").unwrap();
        let resp = parse_response(&format!("{}\n", file.display()), dir.path()).unwrap();
        assert!(matches!(resp, AgentResponse::File(_)));
    }

    #[test]
    fn test_parse_nonexistent_path_is_malformed() {
        let dir = tempdir().unwrap();
        let err = parse_response("missing-file.md\n", dir.path()).unwrap_err();
        assert!(matches!(err, AgentError::MalformedOutput { .. }));
    }

    #[test]
    fn test_parse_empty_output_is_malformed() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            parse_response("", dir.path()).unwrap_err(),
            AgentError::MalformedOutput { .. }
        ));
    }

    #[test]
    fn test_parse_json_array_is_not_a_result() {
        // The agent contract is an object; a bare array falls through to
        // path interpretation and then fails.
        let dir = tempdir().unwrap();
        assert!(parse_response("[1, 2]", dir.path()).is_err());
    }

    // ── invoke (unix: scripted agents) ───────────────────────────────

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn write_script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-agent.sh");
            fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
            path
        }

        fn client_for(script: &Path, timeout_secs: u64) -> AgentClient {
            AgentClient::new(&AgentConfig {
                cmd: script.display().to_string(),
                args: vec![],
                timeout_secs,
            })
        }

        fn request<'a>(artifacts: &'a Artifacts) -> AgentRequest<'a> {
            AgentRequest {
                ticket_ref: "T-1",
                run_id: "abc123",
                phase: "plan",
                instruction: "produce a plan",
                artifacts,
            }
        }

        #[tokio::test]
        async fn test_invoke_structured_response() {
            let dir = tempdir().unwrap();
            let script = write_script(dir.path(), r#"cat > /dev/null; echo '{"ok": true}'"#);
            let client = client_for(&script, 30);
            let artifacts = Artifacts::default();
            let log = dir.path().join("logs/out.log");

            let resp = client
                .invoke(&request(&artifacts), dir.path(), &log)
                .await
                .unwrap();
            assert!(matches!(resp, AgentResponse::Structured(_)));
            // Raw output is captured for triage.
            assert!(log.is_file());
            assert!(fs::read_to_string(&log).unwrap().contains("\"ok\""));
        }

        #[tokio::test]
        async fn test_invoke_nonzero_exit_is_error() {
            let dir = tempdir().unwrap();
            let script = write_script(dir.path(), "cat > /dev/null; echo boom >&2; exit 3");
            let client = client_for(&script, 30);
            let artifacts = Artifacts::default();
            let log = dir.path().join("out.log");

            let err = client
                .invoke(&request(&artifacts), dir.path(), &log)
                .await
                .unwrap_err();
            match err {
                AgentError::NonZeroExit { code, stderr_tail } => {
                    assert_eq!(code, 3);
                    assert!(stderr_tail.contains("boom"));
                }
                other => panic!("Expected NonZeroExit, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_invoke_timeout_kills_agent() {
            let dir = tempdir().unwrap();
            let script = write_script(dir.path(), "cat > /dev/null; sleep 30");
            let client = client_for(&script, 1);
            let artifacts = Artifacts::default();
            let log = dir.path().join("out.log");

            let err = client
                .invoke(&request(&artifacts), dir.path(), &log)
                .await
                .unwrap_err();
            assert!(matches!(err, AgentError::Timeout { secs: 1 }));
        }

        #[tokio::test]
        async fn test_invoke_receives_payload_on_stdin() {
            let dir = tempdir().unwrap();
            // Echo the payload back inside a JSON wrapper via stderr log.
            let script = write_script(dir.path(), r#"payload=$(cat); echo "{\"ok\": true}"; echo "$payload" >&2"#);
            let client = client_for(&script, 30);
            let artifacts = Artifacts {
                branch_ref: Some("steward/t-1".into()),
                ..Default::default()
            };
            let log = dir.path().join("out.log");

            client
                .invoke(&request(&artifacts), dir.path(), &log)
                .await
                .unwrap();
            let logged = fs::read_to_string(&log).unwrap();
            assert!(logged.contains("\"ticket_ref\":\"T-1\""));
            assert!(logged.contains("steward/t-1"));
        }

        #[tokio::test]
        async fn test_invoke_missing_binary_is_spawn_error() {
            let dir = tempdir().unwrap();
            let client = client_for(Path::new("/nonexistent/agent"), 5);
            let artifacts = Artifacts::default();
            let log = dir.path().join("out.log");

            let err = client
                .invoke(&request(&artifacts), dir.path(), &log)
                .await
                .unwrap_err();
            assert!(matches!(err, AgentError::SpawnFailed { .. }));
        }
    }
}
