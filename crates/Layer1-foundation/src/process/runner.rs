//! Command specification and the runner trait

use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// A single external command invocation
#[derive(Clone, Default)]
pub struct CommandSpec {
    /// Program to execute
    pub program: String,

    /// Arguments (never contain secret material)
    pub args: Vec<String>,

    /// Environment variables added to the inherited environment
    pub env: BTreeMap<String, String>,

    /// Bytes piped to the child's stdin
    pub stdin: Option<Vec<u8>>,

    /// Hard timeout; the runner's default applies when `None`
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program followed by its arguments
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }

    /// Shell-quoted command line for logs. Stdin is never included.
    pub fn display(&self) -> String {
        self.argv()
            .into_iter()
            .map(|part| match shlex::try_quote(part) {
                Ok(quoted) => quoted.into_owned(),
                Err(_) => part.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("command", &self.display())
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("stdin", &self.stdin.as_ref().map(|s| format!("<{} bytes>", s.len())))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code (-1 when terminated by a signal)
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Wall-clock duration
    pub duration: Duration,
}

impl CommandOutput {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout without surrounding whitespace
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Non-empty stdout lines
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }

    /// Short failure description for error messages
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit code {}", self.exit_code)
        } else {
            format!("exit code {}: {}", self.exit_code, stderr)
        }
    }
}

/// Runner trait - implement to target a new kind of node
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion, capturing its output.
    ///
    /// A non-zero exit code is a successful `run`; only spawn failures and
    /// timeouts are errors.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Runner name for logs
    fn name(&self) -> &str;
}
