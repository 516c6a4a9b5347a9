//! Command handlers

use dockhand_context::{AnsibleCommand, AnsibleConfig, CheckoutRequest, ContextManager, ContextRequest, StepOutcome};
use dockhand_foundation::{
    CredentialStore, DockhandConfig, EnvironmentCatalog, Error, JsonCredentialStore, JsonStore, Node,
    Result, TargetEnvironment,
};
use dockhand_pool::{PoolManager, SimulatedHost};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

// sysexits.h
const EXIT_USAGE: u8 = 64;
const EXIT_TEMPFAIL: u8 = 75;

/// Output format
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
}

/// `dockhand run`
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Playbook path, relative to the checkout
    pub playbook: String,

    /// Target environment name
    #[arg(short, long)]
    pub environment: String,

    /// Project name (working directory and context key)
    #[arg(long)]
    pub project: String,

    /// Repository URL
    #[arg(long)]
    pub repository: String,

    /// Branch, tag or commit
    #[arg(long, default_value = "main")]
    pub version: String,

    /// Node name
    #[arg(short, long, default_value = "local")]
    pub node: String,

    /// Container image (defaults to the configured image)
    #[arg(long)]
    pub image: Option<String>,

    /// Host pattern passed to --limit
    #[arg(long)]
    pub limit: Option<String>,

    /// Comma separated tags
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Dry run (--check)
    #[arg(long)]
    pub check: bool,

    /// Galaxy requirements file installed before the playbook
    #[arg(long)]
    pub requirements: Option<String>,
}

impl RunArgs {
    /// Steps in execution order
    fn commands(&self) -> Vec<AnsibleCommand> {
        let mut commands = Vec::new();
        if let Some(requirements) = &self.requirements {
            commands.push(AnsibleCommand::galaxy_install(requirements.clone()));
        }
        commands.push(AnsibleCommand::Playbook {
            playbook: self.playbook.clone(),
            limit: self.limit.clone(),
            tags: self.tags.clone(),
            check: self.check,
            extra_args: Vec::new(),
        });
        commands
    }

    fn request(&self, node: Node, environment: &TargetEnvironment) -> ContextRequest {
        let request = ContextRequest::new(
            node,
            self.project.clone(),
            CheckoutRequest::new(self.repository.clone(), self.version.clone()),
        )
        .with_ansible_config(AnsibleConfig {
            inventory: Some(environment.inventory.clone()),
            ..Default::default()
        });
        match &self.image {
            Some(image) => request.with_image(image.clone()),
            None => request,
        }
    }
}

/// Configuration, environments and credentials of one invocation
pub struct Workspace {
    pub config: DockhandConfig,
    pub environments: EnvironmentCatalog,
    pub credentials: Arc<dyn CredentialStore>,
}

impl Workspace {
    /// Global + project configuration, global credentials
    pub fn load() -> Result<Self> {
        Ok(Self {
            config: DockhandConfig::load()?,
            environments: EnvironmentCatalog::load()?,
            credentials: Arc::new(JsonCredentialStore::load(&JsonStore::global()?)?),
        })
    }

    /// Everything from a single store
    pub fn load_from(store: &JsonStore) -> Result<Self> {
        Ok(Self {
            config: DockhandConfig::load_from(store)?,
            environments: EnvironmentCatalog::load_from(store)?,
            credentials: Arc::new(JsonCredentialStore::load(store)?),
        })
    }
}

fn node(name: &str, simulate: bool) -> Node {
    if simulate {
        Arc::new(SimulatedHost::new()).node(name)
    } else {
        Node::local(name)
    }
}

/// Run every step in one context; stops at the first failing step
pub async fn execute(workspace: &Workspace, args: &RunArgs, node: Node) -> Result<Vec<StepOutcome>> {
    let environment = workspace.environments.get(&args.environment)?.clone();
    let pools = Arc::new(PoolManager::new(workspace.config.clone()));

    if pools.config().discovery.enabled {
        let report = pools.discovery().run(&node).await;
        if !report.is_noop() {
            info!("Reconciled leftovers on {}: {:?}", node.name(), report);
        }
    }

    let contexts = ContextManager::new(Arc::clone(&pools), Arc::clone(&workspace.credentials));
    let request = args.request(node, &environment);
    let commands = args.commands();

    contexts
        .with_context(&request, |context| async move {
            context
                .with_environment(&environment, |op| async move {
                    let mut outcomes = Vec::with_capacity(commands.len());
                    for command in &commands {
                        let outcome = op.run(command).await?;
                        let failed = !outcome.success();
                        outcomes.push(outcome);
                        if failed {
                            break;
                        }
                    }
                    Ok(outcomes)
                })
                .await
        })
        .await
}

fn exit_code(outcomes: &[StepOutcome]) -> ExitCode {
    match outcomes.last() {
        Some(last) if !last.success() => ExitCode::from(last.exit_code.clamp(1, 255) as u8),
        _ => ExitCode::SUCCESS,
    }
}

/// Exit status for an error that reached the top level.
///
/// Errors the user can act on, and timeouts worth another attempt, are
/// printed as one line; anything else is returned for a full report.
pub fn report(error: anyhow::Error) -> anyhow::Result<ExitCode> {
    let Some(err) = error.downcast_ref::<Error>() else {
        return Err(error);
    };
    if err.is_retryable() {
        eprintln!("error: {} (temporary, retry the command)", err);
        Ok(ExitCode::from(EXIT_TEMPFAIL))
    } else if err.is_user_facing() {
        eprintln!("error: {}", err);
        Ok(ExitCode::from(EXIT_USAGE))
    } else {
        Err(error)
    }
}

fn print_outcomes(outcomes: &[StepOutcome], output: Output) -> anyhow::Result<()> {
    if output.json {
        println!("{}", serde_json::to_string_pretty(outcomes)?);
        return Ok(());
    }
    for outcome in outcomes {
        let status = if outcome.success() { "ok" } else { "failed" };
        println!(
            "==> {} [{}] exit {} in {} ms",
            outcome.command, status, outcome.exit_code, outcome.duration_ms
        );
        if !outcome.stdout.is_empty() {
            print!("{}", outcome.stdout);
        }
        if !outcome.stderr.is_empty() {
            eprint!("{}", outcome.stderr);
        }
    }
    Ok(())
}

/// `dockhand run`
pub async fn run(args: RunArgs, simulate: bool, output: Output) -> anyhow::Result<ExitCode> {
    let workspace = Workspace::load()?;
    let outcomes = execute(&workspace, &args, node(&args.node, simulate)).await?;
    print_outcomes(&outcomes, output)?;
    Ok(exit_code(&outcomes))
}

/// `dockhand discover`
pub async fn discover(name: &str, simulate: bool, output: Output) -> anyhow::Result<()> {
    let pools = Arc::new(PoolManager::new(DockhandConfig::load()?));
    let report = pools.discovery().run(&node(name, simulate)).await;

    if output.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Discovery on {}:", report.node);
        println!("  containers adopted: {}", report.containers_adopted);
        println!("  containers removed: {}", report.containers_removed);
        println!("  agents adopted:     {}", report.agents_adopted);
        println!("  agents killed:      {}", report.agents_killed);
        println!("  sockets removed:    {}", report.sockets_removed);
        println!("  failures:           {}", report.failures);
    }
    Ok(())
}

/// `dockhand environments`
pub fn list_environments(output: Output) -> anyhow::Result<()> {
    let catalog = EnvironmentCatalog::load()?;
    if output.json {
        println!("{}", serde_json::to_string_pretty(&catalog)?);
        return Ok(());
    }
    if catalog.environments.is_empty() {
        println!("No target environments configured.");
        return Ok(());
    }
    for environment in &catalog.environments {
        println!(
            "{:<20} {:<30} {} ssh key(s), {} vault file(s)",
            environment.name,
            environment.inventory,
            environment.ssh_credentials.len(),
            environment.vault_credentials.len()
        );
    }
    Ok(())
}
