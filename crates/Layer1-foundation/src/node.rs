//! Worker node handle

use crate::process::{CommandOutput, CommandRunner, CommandSpec, LocalCommandRunner};
use crate::Result;
use std::fmt;
use std::sync::Arc;

/// A worker node and the channel used to run commands on it
#[derive(Clone)]
pub struct Node {
    name: String,
    runner: Arc<dyn CommandRunner>,
}

impl Node {
    pub fn new(name: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            name: name.into(),
            runner,
        }
    }

    /// Node backed by the local host
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(LocalCommandRunner::new()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.runner)
    }

    /// Run a command on this node
    pub async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.runner.run(spec).await
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("runner", &self.runner.name())
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
