//! Verification runner.
//!
//! Runs a declarative profile (typecheck, lint, tests) inside the
//! verifier sandbox — a directory fully disjoint from the agent-output
//! root, so no tool call can poison what the verifier executes.
//! Verification failures are a domain outcome, not an error.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use ork_domain::error::{Error, Result};

/// Declarative verification profile (typically sourced from the card's
/// `verify_commands` metadata).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationProfile {
    pub commands: Vec<String>,
    #[serde(default = "d_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "d_tail")]
    pub tail_bytes: usize,
}

fn d_timeout() -> u64 {
    120
}
fn d_tail() -> usize {
    4096
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandFailure {
    pub command: String,
    pub exit_code: Option<i32>,
    pub tail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub passed: bool,
    pub failures: Vec<CommandFailure>,
}

pub struct Verifier {
    sandbox_dir: PathBuf,
}

impl Verifier {
    pub fn new(sandbox_dir: PathBuf) -> Self {
        Self { sandbox_dir }
    }

    /// Run every command in the profile; the first failure stops the run.
    pub async fn run(&self, profile: &VerificationProfile) -> Result<VerificationReport> {
        std::fs::create_dir_all(&self.sandbox_dir)?;
        let timeout = Duration::from_secs(profile.timeout_secs);

        for command in &profile.commands {
            tracing::debug!(command = %command, "verifier running command");
            let child = Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&self.sandbox_dir)
                .output();

            let output = match tokio::time::timeout(timeout, child).await {
                Ok(result) => result.map_err(Error::Io)?,
                Err(_) => {
                    return Ok(VerificationReport {
                        passed: false,
                        failures: vec![CommandFailure {
                            command: command.clone(),
                            exit_code: None,
                            tail: format!("timed out after {}s", profile.timeout_secs),
                        }],
                    });
                }
            };

            if !output.status.success() {
                let mut combined = output.stdout;
                combined.extend_from_slice(&output.stderr);
                return Ok(VerificationReport {
                    passed: false,
                    failures: vec![CommandFailure {
                        command: command.clone(),
                        exit_code: output.status.code(),
                        tail: tail_str(&combined, profile.tail_bytes),
                    }],
                });
            }
        }

        Ok(VerificationReport {
            passed: true,
            failures: Vec::new(),
        })
    }
}

/// Last `max` bytes of output, lossily decoded.
fn tail_str(bytes: &[u8], max: usize) -> String {
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(commands: &[&str]) -> VerificationProfile {
        VerificationProfile {
            commands: commands.iter().map(|s| s.to_string()).collect(),
            timeout_secs: 10,
            tail_bytes: 256,
        }
    }

    #[tokio::test]
    async fn passing_profile() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = Verifier::new(dir.path().to_path_buf());
        let report = verifier.run(&profile(&["true", "true"])).await.unwrap();
        assert!(report.passed);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn failing_command_reports_exit_code_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = Verifier::new(dir.path().to_path_buf());
        let report = verifier
            .run(&profile(&["echo boom >&2; exit 3", "true"]))
            .await
            .unwrap();
        assert!(!report.passed);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].exit_code, Some(3));
        assert!(report.failures[0].tail.contains("boom"));
    }

    #[tokio::test]
    async fn commands_run_inside_the_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = Verifier::new(dir.path().to_path_buf());
        let report = verifier
            .run(&profile(&["test \"$(pwd -P)\" = \"$(pwd -P)\" && touch probe"]))
            .await
            .unwrap();
        assert!(report.passed);
        assert!(dir.path().join("probe").exists());
    }

    #[tokio::test]
    async fn tail_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = Verifier::new(dir.path().to_path_buf());
        let mut p = profile(&["yes x | head -c 2000; exit 1"]);
        p.tail_bytes = 100;
        let report = verifier.run(&p).await.unwrap();
        assert!(!report.passed);
        assert!(report.failures[0].tail.len() <= 100);
    }
}
