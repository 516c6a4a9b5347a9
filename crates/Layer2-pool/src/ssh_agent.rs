//! SSH agent resource
//!
//! One `ssh-agent` process per node, bound to an unpredictable socket under
//! the node's agent directory. Keys are reference counted by credential id
//! and piped to `ssh-add -` so they never touch disk or argv.
//!
//! The agent remembers the `ssh-add -l` listing it expects (the fingerprint).
//! A listing that differs means someone else touched the agent or an earlier
//! load half failed, and the next `load_keys` clears and reloads it.

use async_trait::async_trait;
use dockhand_foundation::{AgentSettings, CredentialStore, Error, Node, Result, Secret};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commands::{AgentCommands, ProcessCommands, AGENT_SOCKET_PREFIX, AGENT_SOCKET_SUFFIX};
use crate::key::ResourceKey;
use crate::pool::ResourceLifecycle;

/// Pool identity of the per-node agent
pub const AGENT_IDENTITY: &str = "ssh-agent";

/// Pool key of the agent for `node`
pub fn agent_key(node: &str) -> ResourceKey {
    ResourceKey::new(node, AGENT_IDENTITY)
}

fn agent_pid_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"SSH_AGENT_PID=(\d+)").ok())
        .as_ref()
}

/// Parse the pid from `ssh-agent -s` output
pub fn parse_agent_pid(output: &str) -> Option<u32> {
    agent_pid_pattern()?
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Fingerprints from `ssh-add -l` output (`bits fingerprint comment (type)`)
pub fn parse_identities(output: &str) -> Vec<String> {
    let mut fingerprints: Vec<String> = output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect();
    fingerprints.sort();
    fingerprints
}

#[derive(Debug, Default)]
struct KeyState {
    loaded: HashMap<String, usize>,
    fingerprint: Vec<String>,
}

/// A running ssh-agent
pub struct SshAgent {
    node: Node,
    pid: u32,
    socket: PathBuf,
    commands: AgentCommands,
    process: ProcessCommands,
    state: Mutex<KeyState>,
}

impl SshAgent {
    fn new(node: Node, pid: u32, socket: PathBuf, commands: AgentCommands, process: ProcessCommands) -> Self {
        Self {
            node,
            pid,
            socket,
            commands,
            process,
            state: Mutex::new(KeyState::default()),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// `SSH_AUTH_SOCK` value
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Directory holding the socket; mount this into containers
    pub fn socket_dir(&self) -> Option<&Path> {
        self.socket.parent()
    }

    /// Process and socket both present
    pub async fn is_running(&self) -> bool {
        let pid_alive = matches!(
            self.node.run(&self.process.is_alive(self.pid)).await,
            Ok(output) if output.success()
        );
        if !pid_alive {
            return false;
        }
        matches!(
            self.node.run(&self.process.socket_exists(&self.socket)).await,
            Ok(output) if output.success()
        )
    }

    /// Current key fingerprints as reported by the agent
    pub async fn list_identities(&self) -> Result<Vec<String>> {
        let output = self.node.run(&self.commands.list_keys(&self.socket)).await?;
        match output.exit_code {
            0 => Ok(parse_identities(&output.stdout)),
            // "The agent has no identities."
            1 => Ok(Vec::new()),
            _ => Err(Error::command("ssh-add -l", output.failure_message())),
        }
    }

    /// Live listing matches the expected fingerprint
    pub async fn is_synced(&self) -> bool {
        let state = self.state.lock().await;
        self.synced_with(&state).await
    }

    async fn synced_with(&self, state: &KeyState) -> bool {
        match self.list_identities().await {
            Ok(live) => live == state.fingerprint,
            Err(e) => {
                debug!("Agent {} listing failed: {}", self.pid, e);
                false
            }
        }
    }

    /// Take the current listing as the expected fingerprint
    pub async fn refresh_fingerprint(&self) -> Result<()> {
        let live = self.list_identities().await?;
        self.state.lock().await.fingerprint = live;
        Ok(())
    }

    /// Load keys for `credential_ids` and take one reference on each.
    ///
    /// All secrets are fetched before anything is injected, so an unknown or
    /// unusable credential fails without touching the agent. On any failure
    /// no reference is taken.
    pub async fn load_keys(&self, store: &dyn CredentialStore, credential_ids: &[String]) -> Result<()> {
        let ids = dedup(credential_ids);
        let mut state = self.state.lock().await;

        if !self.synced_with(&state).await {
            warn!(
                "ssh-agent {} on {} drifted from bookkeeping, reloading {} key(s)",
                self.pid,
                self.node.name(),
                state.loaded.len()
            );
            self.resync(&mut state, store).await?;
        }

        let mut pending = Vec::new();
        for id in &ids {
            if state.loaded.get(id).copied().unwrap_or(0) == 0 {
                let secret = store.fetch(id).await?;
                pending.push((id.clone(), ssh_key_material(id, &secret)?));
            }
        }

        for (id, key) in &pending {
            if let Err(e) = self.inject(id, key).await {
                if let Err(refresh) = self.list_identities().await.map(|live| state.fingerprint = live) {
                    debug!("Fingerprint refresh after failed load: {}", refresh);
                }
                return Err(e);
            }
        }

        state.fingerprint = self.list_identities().await?;
        for id in ids {
            *state.loaded.entry(id).or_insert(0) += 1;
        }
        Ok(())
    }

    /// Drop one reference on each key. Keys stay in the agent until it stops
    /// or their lifetime runs out.
    pub async fn release_keys(&self, credential_ids: &[String]) {
        let mut state = self.state.lock().await;
        for id in dedup(credential_ids) {
            let remaining = match state.loaded.get_mut(&id) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => {
                    warn!("Release of key {} that is not loaded on agent {}", id, self.pid);
                    continue;
                }
            };
            if remaining == 0 {
                state.loaded.remove(&id);
                debug!("Key {} no longer referenced on agent {}", id, self.pid);
            }
        }
    }

    /// Reference count of one credential
    pub async fn loaded_count(&self, credential_id: &str) -> usize {
        self.state.lock().await.loaded.get(credential_id).copied().unwrap_or(0)
    }

    /// Credential ids with a positive count, sorted
    pub async fn loaded_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().await.loaded.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Kill the process, remove the socket, forget every key
    pub(crate) async fn stop(&self) -> Result<()> {
        let killed = matches!(
            self.node.run(&self.process.terminate(self.pid)).await,
            Ok(output) if output.success()
        );
        if !killed {
            let still_alive = matches!(
                self.node.run(&self.process.is_alive(self.pid)).await,
                Ok(output) if output.success()
            );
            if still_alive {
                return Err(Error::command(
                    "kill",
                    format!("ssh-agent {} could not be terminated", self.pid),
                ));
            }
        }

        if let Err(e) = self.node.run(&self.process.remove_file(&self.socket)).await {
            warn!("Failed to remove agent socket {}: {}", self.socket.display(), e);
        }

        let mut state = self.state.lock().await;
        state.loaded.clear();
        state.fingerprint.clear();
        Ok(())
    }

    async fn resync(&self, state: &mut KeyState, store: &dyn CredentialStore) -> Result<()> {
        let output = self.node.run(&self.commands.remove_all_keys(&self.socket)).await?;
        if !output.success() {
            return Err(Error::command("ssh-add -D", output.failure_message()));
        }
        state.fingerprint.clear();

        let mut referenced: Vec<String> = state.loaded.keys().cloned().collect();
        referenced.sort();
        for id in referenced {
            let secret = store.fetch(&id).await?;
            let key = ssh_key_material(&id, &secret)?;
            self.inject(&id, &key).await?;
        }
        state.fingerprint = self.list_identities().await?;
        Ok(())
    }

    async fn inject(&self, id: &str, key: &[u8]) -> Result<()> {
        let spec = self.commands.add_key_from_stdin(&self.socket, key);
        debug!("[{}] {}", self.node.name(), spec.display());
        let output = self.node.run(&spec).await?;
        if output.success() {
            info!("Loaded key {} into ssh-agent {}", id, self.pid);
            Ok(())
        } else {
            Err(Error::credential(id, format!("ssh-add rejected key: {}", output.failure_message())))
        }
    }
}

impl fmt::Debug for SshAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshAgent")
            .field("node", &self.node.name())
            .field("pid", &self.pid)
            .field("socket", &self.socket)
            .finish()
    }
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect()
}

fn ssh_key_material(id: &str, secret: &Secret) -> Result<Vec<u8>> {
    match secret {
        Secret::SshKey {
            passphrase: Some(_), ..
        } => Err(Error::credential(
            id,
            "passphrase-protected keys cannot be loaded without a tty",
        )),
        Secret::SshKey { private_key, .. } => Ok(private_key.as_bytes().to_vec()),
        other => Err(Error::credential(
            id,
            format!("expected an ssh-key credential, found {}", other.kind()),
        )),
    }
}

/// Creation parameters for an agent
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub node: Node,
}

impl AgentSpec {
    pub fn new(node: Node) -> Self {
        Self { node }
    }
}

/// Lifecycle adapter for ssh-agents
pub struct SshAgentLifecycle {
    settings: AgentSettings,
    commands: AgentCommands,
    process: ProcessCommands,
}

impl SshAgentLifecycle {
    pub fn new(settings: AgentSettings, timeout: Duration) -> Self {
        Self {
            commands: AgentCommands::new(&settings, timeout),
            process: ProcessCommands::new(timeout),
            settings,
        }
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn process(&self) -> &ProcessCommands {
        &self.process
    }

    pub fn agent_binary(&self) -> &str {
        self.commands.agent_binary()
    }

    /// Agent socket directory for `node`
    pub fn node_dir(&self, node: &str) -> PathBuf {
        self.settings.node_dir(node)
    }

    /// Handle for an agent process found outside the pool
    pub fn attach(&self, node: Node, pid: u32, socket: PathBuf) -> SshAgent {
        SshAgent::new(node, pid, socket, self.commands.clone(), self.process.clone())
    }

    fn fresh_socket(&self, node: &str) -> PathBuf {
        self.node_dir(node).join(format!(
            "{}{}{}",
            AGENT_SOCKET_PREFIX,
            Uuid::new_v4().simple(),
            AGENT_SOCKET_SUFFIX
        ))
    }
}

#[async_trait]
impl ResourceLifecycle for SshAgentLifecycle {
    type Resource = SshAgent;
    type Spec = AgentSpec;

    fn kind(&self) -> &'static str {
        "ssh-agent"
    }

    fn handle(&self, resource: &SshAgent) -> String {
        format!("pid {}", resource.pid())
    }

    async fn create(&self, key: &ResourceKey, spec: &AgentSpec) -> Result<SshAgent> {
        let node = &spec.node;
        let dir = self.node_dir(key.node());
        let output = node
            .run(&self.process.make_private_dir(&dir))
            .await
            .map_err(|e| Error::creation(self.kind(), key, e.to_string()))?;
        if !output.success() {
            return Err(Error::creation(
                self.kind(),
                key,
                format!("cannot create {}: {}", dir.display(), output.failure_message()),
            ));
        }

        let socket = self.fresh_socket(key.node());
        let start = self.commands.start(&socket);
        debug!("[{}] {}", node.name(), start.display());
        let output = node
            .run(&start)
            .await
            .map_err(|e| Error::creation(self.kind(), key, e.to_string()))?;

        let pid = match parse_agent_pid(&output.stdout) {
            Some(pid) if output.success() => pid,
            _ => {
                if let Err(e) = node.run(&self.process.remove_file(&socket)).await {
                    debug!("Socket cleanup after failed start: {}", e);
                }
                return Err(Error::creation(
                    self.kind(),
                    key,
                    format!("ssh-agent did not report a pid ({})", output.failure_message()),
                ));
            }
        };

        let agent = self.attach(node.clone(), pid, socket);
        if let Err(e) = agent.refresh_fingerprint().await {
            if let Err(stop) = agent.stop().await {
                warn!("Cleanup of ssh-agent {} failed: {}", pid, stop);
            }
            return Err(Error::creation(self.kind(), key, e.to_string()));
        }

        Ok(agent)
    }

    async fn is_alive(&self, resource: &SshAgent) -> bool {
        resource.is_running().await
    }

    async fn destroy(&self, resource: &SshAgent) -> Result<()> {
        resource.stop().await
    }
}
