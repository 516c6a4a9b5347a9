//! Local runner - executes commands on the host with tokio::process
//!
//! Features:
//! - Piped stdout/stderr capture
//! - Secret material delivered through stdin only
//! - Hard timeout, the child is killed when it is exceeded

use super::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Local runner configuration
#[derive(Debug, Clone)]
pub struct LocalRunnerConfig {
    /// Timeout for commands that do not set one
    pub default_timeout: Duration,
}

impl Default for LocalRunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(120),
        }
    }
}

/// Runner that spawns processes on the current host
#[derive(Debug, Clone, Default)]
pub struct LocalCommandRunner {
    config: LocalRunnerConfig,
}

impl LocalCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LocalRunnerConfig) -> Self {
        Self { config }
    }

    pub fn with_default_timeout(timeout: Duration) -> Self {
        Self::with_config(LocalRunnerConfig {
            default_timeout: timeout,
        })
    }
}

#[async_trait]
impl CommandRunner for LocalCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let timeout = spec.timeout.unwrap_or(self.config.default_timeout);
        debug!("Running: {}", spec.display());

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::command(&spec.program, format!("failed to spawn: {}", e)))?;

        // Feed stdin concurrently so a chatty child cannot deadlock on a full pipe
        let writer = match (spec.stdin.clone(), child.stdin.take()) {
            (Some(input), Some(mut stdin)) => Some(tokio::spawn(async move {
                let result = stdin.write_all(&input).await;
                drop(stdin);
                result
            })),
            _ => None,
        };

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result
                .map_err(|e| Error::command(&spec.program, format!("wait failed: {}", e)))?,
            Err(_) => {
                warn!(
                    "Command timed out after {:.1}s: {}",
                    timeout.as_secs_f64(),
                    spec.display()
                );
                return Err(Error::Timeout(format!(
                    "{} did not finish within {:.1}s",
                    spec.program,
                    timeout.as_secs_f64()
                )));
            }
        };

        if let Some(writer) = writer {
            match writer.await {
                Ok(Err(e)) => {
                    return Err(Error::command(
                        &spec.program,
                        format!("failed to write stdin: {}", e),
                    ))
                }
                Err(e) => return Err(Error::Internal(format!("stdin writer panicked: {}", e))),
                Ok(Ok(())) => {}
            }
        }

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: started.elapsed(),
        })
    }

    fn name(&self) -> &str {
        "local"
    }
}
