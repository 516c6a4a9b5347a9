//! Container resource
//!
//! A long-running container started detached with `sleep infinity`, reused by
//! many `docker exec` calls. The container keeps its own env map that is
//! merged under the per-call env of every exec.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dockhand_foundation::{CommandOutput, CommandSpec, Error, Node, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::commands::{BindMount, DockerCommands};
use crate::key::ResourceKey;
use crate::labels::ManagementTags;
use crate::pool::{Pooled, ResourceLifecycle};

/// Exit code reported by exec calls on a destroyed container
pub const KILLED_EXIT_CODE: i32 = -1;

/// Creation options that are not part of the pool key
#[derive(Debug, Clone, Default)]
pub struct ContainerOptions {
    pub mounts: Vec<BindMount>,
    pub env: BTreeMap<String, String>,
    pub extra_args: Vec<String>,
}

impl ContainerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mount(mut self, mount: BindMount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }
}

/// Where and how to create a container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub node: Node,
    pub options: ContainerOptions,
}

impl ContainerSpec {
    pub fn new(node: Node, options: ContainerOptions) -> Self {
        Self { node, options }
    }
}

/// Per-call exec options
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Principal to run as (`docker exec -u`)
    pub user: Option<String>,
    /// Working directory inside the container
    pub workdir: Option<String>,
    /// Env merged over the container's persisted env
    pub env: BTreeMap<String, String>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// A running container on a node
pub struct Container {
    id: String,
    image: String,
    node: Node,
    docker: DockerCommands,
    env: RwLock<BTreeMap<String, String>>,
    created_at: DateTime<Utc>,
}

impl Container {
    pub fn new(
        id: impl Into<String>,
        image: impl Into<String>,
        node: Node,
        docker: DockerCommands,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            node,
            docker,
            env: RwLock::new(BTreeMap::new()),
            created_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// First 12 characters of the id, as docker prints it
    pub fn short_id(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Persist an env var for every later exec
    pub fn set_env(&self, key: impl Into<String>, value: impl Into<String>) {
        self.env.write().insert(key.into(), value.into());
    }

    pub fn get_env(&self, key: &str) -> Option<String> {
        self.env.read().get(key).cloned()
    }

    pub fn env(&self) -> BTreeMap<String, String> {
        self.env.read().clone()
    }

    /// Liveness probe; any failure reads as not running
    pub async fn is_running(&self) -> bool {
        match self.node.run(&self.docker.inspect_running(&self.id)).await {
            Ok(output) => output.success() && output.stdout_trimmed() == "true",
            Err(e) => {
                debug!("Inspect of container {} failed: {}", self.short_id(), e);
                false
            }
        }
    }

    /// Force-remove; a container that is already gone is not an error
    pub(crate) async fn remove(&self) -> Result<()> {
        let output = self.node.run(&self.docker.remove(&self.id)).await?;
        if output.success() || output.stderr.contains("No such container") {
            Ok(())
        } else {
            Err(Error::command("docker rm", output.failure_message()))
        }
    }

    fn exec_spec(&self, command: &[String], options: &ExecOptions, stdin: Option<&[u8]>) -> CommandSpec {
        let mut env = self.env();
        env.extend(options.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let spec = self.docker.exec(
            &self.id,
            command,
            options.user.as_deref(),
            options.workdir.as_deref(),
            &env,
            stdin.is_some(),
        );
        match stdin {
            Some(bytes) => spec.stdin(bytes),
            None => spec,
        }
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.short_id())
            .field("image", &self.image)
            .field("node", &self.node.name())
            .finish()
    }
}

impl Pooled<Container> {
    /// Run a command and return its exit code
    pub async fn execute(&self, command: &[String], options: &ExecOptions) -> Result<i32> {
        Ok(self.execute_capture(command, options).await?.exit_code)
    }

    /// Run a command and capture its output. On a destroyed container no
    /// external call is made and [`KILLED_EXIT_CODE`] is reported.
    pub async fn execute_capture(&self, command: &[String], options: &ExecOptions) -> Result<CommandOutput> {
        self.exec_inner(command, options, None).await
    }

    /// Run a command with `stdin` piped in
    pub async fn execute_with_input(
        &self,
        command: &[String],
        options: &ExecOptions,
        stdin: &[u8],
    ) -> Result<CommandOutput> {
        self.exec_inner(command, options, Some(stdin)).await
    }

    async fn exec_inner(
        &self,
        command: &[String],
        options: &ExecOptions,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput> {
        if self.is_killed() {
            warn!(
                "Refusing exec in destroyed container {} ({})",
                self.short_id(),
                self.key()
            );
            return Ok(CommandOutput::new(
                KILLED_EXIT_CODE,
                "",
                format!("container {} has been destroyed", self.short_id()),
            ));
        }

        let spec = self.exec_spec(command, options, stdin);
        debug!("[{}] {}", self.node().name(), spec.display());
        self.node().run(&spec).await
    }
}

/// Lifecycle adapter for containers
pub struct ContainerLifecycle {
    docker: DockerCommands,
}

impl ContainerLifecycle {
    pub fn new(docker: DockerCommands) -> Self {
        Self { docker }
    }

    pub fn docker(&self) -> &DockerCommands {
        &self.docker
    }

    /// Handle for a container found outside the pool
    pub fn attach(
        &self,
        id: impl Into<String>,
        image: impl Into<String>,
        node: Node,
        created_at: DateTime<Utc>,
    ) -> Container {
        Container::new(id, image, node, self.docker.clone(), created_at)
    }
}

#[async_trait]
impl ResourceLifecycle for ContainerLifecycle {
    type Resource = Container;
    type Spec = ContainerSpec;

    fn kind(&self) -> &'static str {
        "container"
    }

    fn handle(&self, resource: &Container) -> String {
        resource.short_id().to_string()
    }

    async fn create(&self, key: &ResourceKey, spec: &ContainerSpec) -> Result<Container> {
        let tags = ManagementTags::new(key.identity(), key.node());
        let run = self.docker.run_detached(
            key.identity(),
            &tags.to_labels(),
            &spec.options.mounts,
            &spec.options.env,
            &spec.options.extra_args,
        );
        debug!("[{}] {}", spec.node.name(), run.display());

        let output = spec
            .node
            .run(&run)
            .await
            .map_err(|e| Error::creation(self.kind(), key, e.to_string()))?;
        if !output.success() {
            return Err(Error::creation(self.kind(), key, output.failure_message()));
        }

        // docker may print pull progress first; the id is the last line
        let id = match output.lines().last() {
            Some(id) => id.to_string(),
            None => return Err(Error::creation(self.kind(), key, "docker run printed no id")),
        };

        let container = Container::new(id, key.identity(), spec.node.clone(), self.docker.clone(), tags.created_at);
        if !container.is_running().await {
            if let Err(e) = container.remove().await {
                warn!("Cleanup of non-running container {} failed: {}", container.short_id(), e);
            }
            return Err(Error::creation(
                self.kind(),
                key,
                format!("container {} is not running after start", container.short_id()),
            ));
        }

        Ok(container)
    }

    async fn is_alive(&self, resource: &Container) -> bool {
        resource.is_running().await
    }

    async fn destroy(&self, resource: &Container) -> Result<()> {
        resource.remove().await
    }
}
