//! Repository checkout inside the context container
//!
//! The working directory is reused when it already tracks the same remote;
//! otherwise it is wiped and cloned again. Either way the requested version
//! is force-checked-out last.

use dockhand_foundation::{sanitize_component, CommandOutput, Error, Result};
use dockhand_pool::{Container, ExecOptions, Lease};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::files::{make_dir, parent_dir, remove_path};

/// What to check out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    /// Remote URL
    pub repository: String,

    /// Branch, tag or commit
    pub version: String,
}

impl CheckoutRequest {
    pub fn new(repository: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            version: version.into(),
        }
    }
}

/// How the working tree was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutOutcome {
    Cloned,
    Fetched,
}

/// `<root>/<project>/<version>` with unsafe characters replaced
pub fn working_dir(root: &str, project: &str, version: &str) -> String {
    format!(
        "{}/{}/{}",
        root.trim_end_matches('/'),
        sanitize_component(project),
        sanitize_component(version)
    )
}

/// git inside one container
pub struct Git<'a> {
    container: &'a Lease<Container>,
    binary: &'a str,
}

impl<'a> Git<'a> {
    pub fn new(container: &'a Lease<Container>, binary: &'a str) -> Self {
        Self { container, binary }
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let command: Vec<String> = std::iter::once(self.binary)
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect();
        self.container.execute_capture(&command, &ExecOptions::new()).await
    }

    async fn run_checked(&self, subcommand: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(Error::command(
                format!("git {}", subcommand),
                output.failure_message(),
            ))
        }
    }

    /// `origin` URL of the repository at `dir`, if it is one
    pub async fn origin(&self, dir: &str) -> Option<String> {
        match self.run(&["-C", dir, "remote", "get-url", "origin"]).await {
            Ok(output) if output.success() => Some(output.stdout_trimmed().to_string()),
            _ => None,
        }
    }

    /// Clone-or-fetch `request` into `dir`, then check out its version
    pub async fn checkout(&self, dir: &str, request: &CheckoutRequest) -> Result<CheckoutOutcome> {
        let outcome = match self.origin(dir).await {
            Some(origin) if origin == request.repository => {
                debug!("Reusing checkout at {}", dir);
                self.run_checked("fetch", &["-C", dir, "fetch", "--prune", "--tags", "origin"]).await?;
                CheckoutOutcome::Fetched
            }
            existing => {
                if let Some(origin) = existing {
                    info!("{} tracks {}, recloning {}", dir, origin, request.repository);
                }
                remove_path(self.container, dir).await?;
                make_dir(self.container, parent_dir(dir), false).await?;
                self.run_checked("clone", &["clone", "--quiet", &request.repository, dir]).await?;
                CheckoutOutcome::Cloned
            }
        };

        self.run_checked("checkout", &["-C", dir, "checkout", "--force", &request.version])
            .await?;
        info!(
            "Checked out {} at {} into {} ({:?})",
            request.repository, request.version, dir, outcome
        );
        Ok(outcome)
    }
}
