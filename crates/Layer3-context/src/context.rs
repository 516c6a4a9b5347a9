//! Composite execution context
//!
//! One context per (node, project, version): the node's ssh-agent, a
//! container that can reach the agent socket, a checked-out working tree and
//! its `ansible.cfg`. Contexts live in their own [`ResourcePool`], so the whole
//! setup sequence runs under the key's slot lock and concurrent requests for
//! the same key share one setup.
//!
//! ```text
//! create:   agent ──► container (+socket mount, SSH_AUTH_SOCK) ──► checkout ──► ansible.cfg
//! rollback: ◄──────────────── reverse of whatever was acquired ◄──────────────
//! destroy:  release agent ──► release container (with the releasing caller's retain flag)
//!
//! with_environment: load ssh keys ──► write vault files ──► f(Operation) ──► remove files ──► release keys
//! ```

use async_trait::async_trait;
use dockhand_foundation::{
    CommandOutput, ContextSettings, CredentialStore, Error, Node, Result, TargetEnvironment,
};
use dockhand_pool::{
    BindMount, Container, ContainerOptions, ExecOptions, Lease, PoolEntrySummary, PoolManager,
    ResourceKey, ResourceLifecycle, ResourcePool, SshAgent, KILLED_EXIT_CODE,
};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::ansible::{AnsibleCommand, AnsibleConfig, Invocation, StepOutcome, ANSIBLE_CONFIG_FILE};
use crate::checkout::{working_dir, CheckoutOutcome, CheckoutRequest, Git};
use crate::files::write_file;
use crate::scope::ReleaseStack;
use crate::secrets::SecretFiles;

/// Context identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKey {
    pub node: String,
    pub project: String,
    pub version: String,
}

impl ContextKey {
    pub fn new(node: impl Into<String>, project: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            project: project.into(),
            version: version.into(),
        }
    }

    /// Key in the context pool
    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(self.node.clone(), format!("{}@{}", self.project, self.version))
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.node, self.project, self.version)
    }
}

/// Everything needed to build a context
#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub node: Node,
    pub project: String,
    pub checkout: CheckoutRequest,
    /// Falls back to the configured default image
    pub image: Option<String>,
    pub container_options: ContainerOptions,
    pub ansible: AnsibleConfig,
}

impl ContextRequest {
    pub fn new(node: Node, project: impl Into<String>, checkout: CheckoutRequest) -> Self {
        Self {
            node,
            project: project.into(),
            checkout,
            image: None,
            container_options: ContainerOptions::new(),
            ansible: AnsibleConfig::default(),
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_container_options(mut self, options: ContainerOptions) -> Self {
        self.container_options = options;
        self
    }

    pub fn with_ansible_config(mut self, config: AnsibleConfig) -> Self {
        self.ansible = config;
        self
    }

    pub fn key(&self) -> ContextKey {
        ContextKey::new(self.node.name(), self.project.clone(), self.checkout.version.clone())
    }
}

/// A ready container + agent + working tree
pub struct ExecutionContext {
    key: ContextKey,
    container: Lease<Container>,
    agent: Lease<SshAgent>,
    workdir: String,
    checkout: CheckoutOutcome,
    credentials: Arc<dyn CredentialStore>,
    // Retain flag for the agent and container leases at teardown
    keep_resources: AtomicBool,
}

impl ExecutionContext {
    pub fn key(&self) -> &ContextKey {
        &self.key
    }

    pub fn container(&self) -> &Lease<Container> {
        &self.container
    }

    pub fn agent(&self) -> &Lease<SshAgent> {
        &self.agent
    }

    /// Working tree inside the container
    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    /// How the working tree was obtained at creation
    pub fn checkout_outcome(&self) -> CheckoutOutcome {
        self.checkout
    }

    /// Run `f` with the credentials of `environment` in place.
    ///
    /// SSH keys are loaded into the agent and vault files written before `f`
    /// starts; a missing or unusable credential fails here and `f` never runs.
    /// Files are removed and keys released on every exit path.
    pub async fn with_environment<F, Fut, T>(&self, environment: &TargetEnvironment, f: F) -> Result<T>
    where
        F: FnOnce(Operation) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut scope = ReleaseStack::new(format!("{} {}", self.key, environment.name));

        self.agent
            .load_keys(&*self.credentials, &environment.ssh_credentials)
            .await?;
        {
            let agent = Arc::clone(&self.agent);
            let ids = environment.ssh_credentials.clone();
            scope.push("ssh keys", async move { agent.release_keys(&ids).await });
        }

        let secrets = match SecretFiles::write(
            &self.container,
            &self.workdir,
            &*self.credentials,
            &environment.vault_credentials,
        )
        .await
        {
            Ok(secrets) => secrets,
            Err(e) => {
                scope.unwind().await;
                return Err(e);
            }
        };
        let vault_files = secrets.paths();
        {
            let container = Arc::clone(&self.container);
            scope.push("secret files", async move {
                let mut secrets = secrets;
                secrets.remove(&container).await;
            });
        }

        let operation = Operation {
            key: self.key.clone(),
            container: Arc::clone(&self.container),
            workdir: self.workdir.clone(),
            environment: environment.clone(),
            vault_files,
        };
        let result = f(operation).await;
        scope.unwind().await;
        result
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("key", &self.key)
            .field("container", &self.container.short_id())
            .field("agent", &self.agent.pid())
            .field("workdir", &self.workdir)
            .finish()
    }
}

/// One operation against one target environment
pub struct Operation {
    key: ContextKey,
    container: Lease<Container>,
    workdir: String,
    environment: TargetEnvironment,
    vault_files: Vec<String>,
}

impl Operation {
    pub fn environment(&self) -> &TargetEnvironment {
        &self.environment
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    /// Vault password files written for this operation
    pub fn vault_files(&self) -> &[String] {
        &self.vault_files
    }

    /// Exec options rooted in the working tree with `ANSIBLE_CONFIG` set
    pub fn exec_options(&self) -> ExecOptions {
        ExecOptions::new()
            .workdir(self.workdir.clone())
            .env("ANSIBLE_CONFIG", format!("{}/{}", self.workdir, ANSIBLE_CONFIG_FILE))
    }

    /// Run an Ansible command; its exit code is reported, not judged
    pub async fn run(&self, command: &AnsibleCommand) -> Result<StepOutcome> {
        let argv = command.argv(&Invocation {
            inventory: &self.environment.inventory,
            vault_files: &self.vault_files,
            extra_vars: &self.environment.extra_vars,
            remote_user: self.environment.remote_user.as_deref(),
        })?;
        info!("[{}] {} against {}", self.key, command.describe(), self.environment.name);

        let output = self.container.execute_capture(&argv, &self.exec_options()).await?;
        if output.exit_code == KILLED_EXIT_CODE {
            warn!("[{}] container was destroyed before {}", self.key, command.describe());
        }
        Ok(StepOutcome::new(command, output))
    }

    /// Run an arbitrary command in the working tree
    pub async fn execute(&self, command: &[String]) -> Result<CommandOutput> {
        self.container.execute_capture(command, &self.exec_options()).await
    }
}

/// Lifecycle adapter building contexts from pooled sub-resources
pub struct ContextLifecycle {
    pools: Arc<PoolManager>,
    credentials: Arc<dyn CredentialStore>,
    settings: ContextSettings,
}

impl ContextLifecycle {
    pub fn new(pools: Arc<PoolManager>, credentials: Arc<dyn CredentialStore>) -> Self {
        let settings = pools.config().context.clone();
        Self {
            pools,
            credentials,
            settings,
        }
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    async fn setup(
        &self,
        key: &ContextKey,
        request: &ContextRequest,
        rollback: &mut ReleaseStack,
    ) -> Result<ExecutionContext> {
        let retain = self.settings.keep_alive;

        let agent = self
            .pools
            .acquire_agent(&request.node)
            .await
            .map_err(|e| Error::setup(key, "ssh-agent", e))?;
        {
            let pools = Arc::clone(&self.pools);
            let agent = Arc::clone(&agent);
            rollback.push("ssh-agent", async move { pools.release_agent(&agent, retain).await });
        }

        let socket_dir = agent
            .socket_dir()
            .map(|dir| dir.to_string_lossy().into_owned())
            .ok_or_else(|| Error::setup(key, "container", "agent socket has no parent directory"))?;
        let image = request
            .image
            .clone()
            .unwrap_or_else(|| self.pools.config().docker.default_image.clone());
        let options = request
            .container_options
            .clone()
            .with_mount(BindMount::new(socket_dir.clone(), socket_dir));
        let container = self
            .pools
            .acquire_container(&request.node, &image, options)
            .await
            .map_err(|e| Error::setup(key, "container", e))?;
        {
            let pools = Arc::clone(&self.pools);
            let container = Arc::clone(&container);
            rollback.push("container", async move { pools.release_container(&container, retain).await });
        }
        container.set_env("SSH_AUTH_SOCK", agent.socket().to_string_lossy());

        let workdir = working_dir(&self.settings.workspace_root, &request.project, &request.checkout.version);
        let checkout = Git::new(&container, &self.settings.git_binary)
            .checkout(&workdir, &request.checkout)
            .await
            .map_err(|e| Error::setup(key, "checkout", e))?;

        let config_path = format!("{}/{}", workdir, ANSIBLE_CONFIG_FILE);
        write_file(&container, &config_path, request.ansible.render().as_bytes(), false)
            .await
            .map_err(|e| Error::setup(key, "configuration", e))?;

        Ok(ExecutionContext {
            key: key.clone(),
            container,
            agent,
            workdir,
            checkout,
            credentials: Arc::clone(&self.credentials),
            keep_resources: AtomicBool::new(retain),
        })
    }
}

#[async_trait]
impl ResourceLifecycle for ContextLifecycle {
    type Resource = ExecutionContext;
    type Spec = ContextRequest;

    fn kind(&self) -> &'static str {
        "execution context"
    }

    fn handle(&self, context: &ExecutionContext) -> String {
        format!("{} in {}", context.workdir, context.container.short_id())
    }

    async fn create(&self, _key: &ResourceKey, request: &ContextRequest) -> Result<ExecutionContext> {
        let key = request.key();
        let mut rollback = ReleaseStack::new(key.to_string());
        match self.setup(&key, request, &mut rollback).await {
            Ok(context) => {
                rollback.dismiss();
                info!("Context {} ready at {}", key, context.workdir);
                Ok(context)
            }
            Err(e) => {
                warn!("Context {} setup failed, rolling back {:?}", key, rollback.pending());
                rollback.unwind().await;
                Err(e)
            }
        }
    }

    async fn is_alive(&self, context: &ExecutionContext) -> bool {
        !context.container.is_killed()
            && !context.agent.is_killed()
            && context.container.is_running().await
            && context.agent.is_running().await
    }

    async fn destroy(&self, context: &ExecutionContext) -> Result<()> {
        let retain = context.keep_resources.load(Ordering::SeqCst);
        self.pools.release_agent(&context.agent, retain).await;
        self.pools.release_container(&context.container, retain).await;
        Ok(())
    }
}

/// Registry of execution contexts on top of a [`PoolManager`]
pub struct ContextManager {
    pools: Arc<PoolManager>,
    contexts: ResourcePool<ContextLifecycle>,
}

impl ContextManager {
    pub fn new(pools: Arc<PoolManager>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            contexts: ResourcePool::new(ContextLifecycle::new(Arc::clone(&pools), credentials)),
            pools,
        }
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn contexts(&self) -> &ResourcePool<ContextLifecycle> {
        &self.contexts
    }

    /// Reuse the live context for the request's key or build one
    pub async fn get_or_create(&self, request: &ContextRequest) -> Result<Lease<ExecutionContext>> {
        self.contexts.acquire(request.key().resource_key(), request).await
    }

    /// Drop one reference; the last one tears the context down unless
    /// `retain`. A teardown releases the agent and container with the same flag.
    pub async fn release(&self, context: &Lease<ExecutionContext>, retain: bool) {
        context.keep_resources.store(retain, Ordering::SeqCst);
        self.contexts.release(context, retain).await
    }

    /// Acquire a context, run `f`, release on every exit path
    pub async fn with_context<F, Fut, T>(&self, request: &ContextRequest, f: F) -> Result<T>
    where
        F: FnOnce(Lease<ExecutionContext>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let retain = self.contexts.lifecycle().settings().keep_alive;
        self.contexts
            .with_lease(request.key().resource_key(), request, retain, f)
            .await
    }

    pub async fn get(&self, key: &ContextKey) -> Option<Lease<ExecutionContext>> {
        self.contexts.get(&key.resource_key()).await
    }

    pub async fn snapshot(&self) -> Vec<PoolEntrySummary> {
        self.contexts.snapshot().await
    }

    /// Tear down every context, then everything left in the pools
    pub async fn shutdown(&self) -> usize {
        let contexts = self.contexts.drain().await;
        info!("Tore down {} context(s)", contexts);
        contexts + self.pools.shutdown().await
    }
}
