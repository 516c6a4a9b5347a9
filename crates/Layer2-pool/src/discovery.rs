//! Orphan discovery
//!
//! Pools live in memory; containers and agents outlive the process. When a
//! node comes online, one pass reconciles the pools with what actually runs
//! there:
//!
//! - managed running containers are adopted under their (node, image) key,
//!   exited ones and duplicates are removed
//! - agent sockets without a live process are deleted
//! - exactly one live agent is kept for the node, any other is terminated
//!
//! Every failure is logged and counted; a pass never fails as a whole.

use dockhand_foundation::{DiscoverySettings, Node};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commands::{AGENT_SOCKET_PREFIX, AGENT_SOCKET_SUFFIX};
use crate::key::ResourceKey;
use crate::labels::{parse_label_list, ManagementTags};
use crate::manager::PoolManager;
use crate::pool::Adoption;
use crate::ssh_agent::agent_key;

/// What one discovery pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    pub node: String,
    pub containers_adopted: usize,
    pub containers_removed: usize,
    pub agents_adopted: usize,
    pub agents_killed: usize,
    pub sockets_removed: usize,
    pub failures: usize,
}

impl DiscoveryReport {
    fn new(node: &str) -> Self {
        Self {
            node: node.to_string(),
            ..Default::default()
        }
    }

    /// Nothing adopted, removed or killed
    pub fn is_noop(&self) -> bool {
        self.containers_adopted == 0
            && self.containers_removed == 0
            && self.agents_adopted == 0
            && self.agents_killed == 0
            && self.sockets_removed == 0
    }

    fn failed(&mut self, what: &str, error: impl std::fmt::Display) {
        warn!("Discovery on {}: {} failed: {}", self.node, what, error);
        self.failures += 1;
    }
}

/// One line of `docker ps` for a managed container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerListing {
    pub id: String,
    pub running: bool,
    pub tags: ManagementTags,
}

/// Parse `id \t state \t labels` lines; unmanaged rows are skipped
pub fn parse_container_listing(output: &str) -> Vec<ContainerListing> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, '\t');
            let id = fields.next()?.trim();
            let state = fields.next()?.trim();
            let labels = parse_label_list(fields.next().unwrap_or(""));
            let tags = ManagementTags::from_labels(&labels)?;
            if id.is_empty() {
                return None;
            }
            Some(ContainerListing {
                id: id.to_string(),
                running: state == "running",
                tags,
            })
        })
        .collect()
}

/// An agent process found in `ps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentProcess {
    pub pid: u32,
    pub socket: PathBuf,
    pub zombie: bool,
}

/// Agent processes bound to a socket inside `node_dir`
pub fn parse_agent_processes(output: &str, agent_binary: &str, node_dir: &Path) -> Vec<AgentProcess> {
    let binary = program_name(agent_binary);
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse::<u32>().ok()?;
            let stat = fields.next()?;
            let args: Vec<&str> = fields.collect();
            if program_name(args.first()?) != binary {
                return None;
            }
            let socket = args
                .iter()
                .position(|a| *a == "-a")
                .and_then(|i| args.get(i + 1))
                .map(PathBuf::from)?;
            if !is_agent_socket(&socket, node_dir) {
                return None;
            }
            Some(AgentProcess {
                pid,
                socket,
                zombie: stat.starts_with('Z'),
            })
        })
        .collect()
}

fn program_name(program: &str) -> &str {
    program.rsplit('/').next().unwrap_or(program)
}

fn is_agent_socket(path: &Path, node_dir: &Path) -> bool {
    let in_dir = path.parent().map_or(false, |p| p == node_dir);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    in_dir && name.starts_with(AGENT_SOCKET_PREFIX) && name.ends_with(AGENT_SOCKET_SUFFIX)
}

/// Discovery passes against one manager's pools
#[derive(Clone)]
pub struct OrphanDiscovery {
    manager: Arc<PoolManager>,
}

impl OrphanDiscovery {
    pub fn new(manager: Arc<PoolManager>) -> Self {
        Self { manager }
    }

    /// Reconcile containers and agents of `node`
    pub async fn run(&self, node: &Node) -> DiscoveryReport {
        let mut report = DiscoveryReport::new(node.name());
        self.discover_containers(node, &mut report).await;
        self.discover_agents(node, &mut report).await;

        if report.is_noop() && report.failures == 0 {
            debug!("Discovery on {}: nothing to reconcile", node.name());
        } else {
            info!(
                "Discovery on {}: containers adopted={} removed={}, agents adopted={} killed={}, sockets removed={}, failures={}",
                node.name(),
                report.containers_adopted,
                report.containers_removed,
                report.agents_adopted,
                report.agents_killed,
                report.sockets_removed,
                report.failures
            );
        }
        report
    }

    async fn discover_containers(&self, node: &Node, report: &mut DiscoveryReport) {
        let pool = self.manager.containers();
        let lifecycle = pool.lifecycle();

        let output = match node.run(&lifecycle.docker().list_managed(node.name())).await {
            Ok(output) if output.success() => output,
            Ok(output) => return report.failed("container listing", output.failure_message()),
            Err(e) => return report.failed("container listing", e),
        };

        for listing in parse_container_listing(&output.stdout) {
            if listing.tags.node != node.name() {
                continue;
            }
            let container = lifecycle.attach(
                listing.id.clone(),
                listing.tags.identity.clone(),
                node.clone(),
                listing.tags.created_at,
            );

            if !listing.running {
                match pool.discard(container).await {
                    Ok(()) => report.containers_removed += 1,
                    Err(e) => report.failed(&format!("removal of exited container {}", listing.id), e),
                }
                continue;
            }

            let key = ResourceKey::new(node.name(), &listing.tags.identity);
            if let Some(tracked) = pool.get(&key).await {
                if tracked.id() == listing.id && !tracked.is_killed() {
                    continue;
                }
            }

            match pool.adopt(key, container, 0).await {
                Adoption::Adopted(_) => report.containers_adopted += 1,
                Adoption::AlreadyTracked { tracked, orphan } => {
                    if tracked.id() == orphan.id() {
                        continue;
                    }
                    debug!(
                        "Container {} duplicates tracked {} for {}",
                        orphan.short_id(),
                        tracked.short_id(),
                        tracked.key()
                    );
                    match pool.discard(orphan).await {
                        Ok(()) => report.containers_removed += 1,
                        Err(e) => report.failed(&format!("removal of duplicate container {}", listing.id), e),
                    }
                }
            }
        }
    }

    async fn discover_agents(&self, node: &Node, report: &mut DiscoveryReport) {
        let pool = self.manager.agents();
        let lifecycle = pool.lifecycle();
        let node_dir = lifecycle.node_dir(node.name());

        let processes = match node.run(&lifecycle.process().list_processes()).await {
            Ok(output) if output.success() => {
                parse_agent_processes(&output.stdout, lifecycle.agent_binary(), &node_dir)
            }
            Ok(output) => return report.failed("process listing", output.failure_message()),
            Err(e) => return report.failed("process listing", e),
        };

        let sockets: Vec<PathBuf> = match node.run(&lifecycle.process().list_sockets(&node_dir)).await {
            Ok(output) if output.success() => output.lines().map(PathBuf::from).collect(),
            Ok(output) => {
                report.failed("socket listing", output.failure_message());
                Vec::new()
            }
            Err(e) => {
                report.failed("socket listing", e);
                Vec::new()
            }
        };

        let (zombies, active): (Vec<AgentProcess>, Vec<AgentProcess>) =
            processes.into_iter().partition(|p| p.zombie);
        for zombie in &zombies {
            debug!("Ignoring zombie ssh-agent {} on {}", zombie.pid, node.name());
        }

        // Sockets no live process is bound to
        let active_sockets: HashSet<&Path> = active.iter().map(|p| p.socket.as_path()).collect();
        let mut present: HashSet<PathBuf> = HashSet::new();
        for socket in sockets {
            if active_sockets.contains(socket.as_path()) {
                present.insert(socket);
                continue;
            }
            match node.run(&lifecycle.process().remove_file(&socket)).await {
                Ok(output) if output.success() => {
                    debug!("Removed stale agent socket {}", socket.display());
                    report.sockets_removed += 1;
                }
                Ok(output) => report.failed(&format!("removal of {}", socket.display()), output.failure_message()),
                Err(e) => report.failed(&format!("removal of {}", socket.display()), e),
            }
        }

        let key = agent_key(node.name());
        let tracked_pid = match pool.get(&key).await {
            Some(tracked) if !tracked.is_killed() && active.iter().any(|p| p.pid == tracked.pid()) => {
                Some(tracked.pid())
            }
            _ => None,
        };

        let keep = match tracked_pid {
            Some(pid) => Some(pid),
            None => self.adopt_one_agent(node, &key, &active, &present, report).await,
        };

        for process in active.iter().filter(|p| Some(p.pid) != keep) {
            let extra = lifecycle.attach(node.clone(), process.pid, process.socket.clone());
            warn!(
                "Terminating extra ssh-agent {} on {} ({})",
                process.pid,
                node.name(),
                process.socket.display()
            );
            match pool.discard(extra).await {
                Ok(()) => report.agents_killed += 1,
                Err(e) => report.failed(&format!("termination of ssh-agent {}", process.pid), e),
            }
        }
    }

    /// Adopt the oldest live agent whose socket exists. Returns its pid.
    async fn adopt_one_agent(
        &self,
        node: &Node,
        key: &ResourceKey,
        active: &[AgentProcess],
        present: &HashSet<PathBuf>,
        report: &mut DiscoveryReport,
    ) -> Option<u32> {
        let pool = self.manager.agents();
        let mut candidates: Vec<&AgentProcess> =
            active.iter().filter(|p| present.contains(&p.socket)).collect();
        candidates.sort_by_key(|p| p.pid);

        for candidate in candidates {
            let agent = pool
                .lifecycle()
                .attach(node.clone(), candidate.pid, candidate.socket.clone());
            if let Err(e) = agent.refresh_fingerprint().await {
                report.failed(&format!("probe of ssh-agent {}", candidate.pid), e);
                continue;
            }
            match pool.adopt(key.clone(), agent, 0).await {
                Adoption::Adopted(lease) => {
                    report.agents_adopted += 1;
                    return Some(lease.pid());
                }
                // Created concurrently by an acquire; that one wins
                Adoption::AlreadyTracked { tracked, .. } => return Some(tracked.pid()),
            }
        }
        None
    }
}

/// Runs one detached discovery pass per node-online event
#[derive(Clone)]
pub struct NodeConnectListener {
    discovery: OrphanDiscovery,
    settings: DiscoverySettings,
}

impl NodeConnectListener {
    pub fn new(discovery: OrphanDiscovery, settings: DiscoverySettings) -> Self {
        Self { discovery, settings }
    }

    /// Spawn a pass after the settle delay. `None` when discovery is disabled.
    pub fn node_online(&self, node: Node) -> Option<JoinHandle<DiscoveryReport>> {
        if !self.settings.enabled {
            debug!("Discovery disabled, skipping {}", node.name());
            return None;
        }
        let discovery = self.discovery.clone();
        let delay = self.settings.settle_delay();
        Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            discovery.run(&node).await
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{LABEL_CREATED, LABEL_IMAGE, LABEL_MANAGED, LABEL_NODE};

    #[test]
    fn test_parse_container_listing_skips_unmanaged() {
        let output = format!(
            "abc\trunning\t{}=true,{}=ubuntu:22.04,{}=node1,{}=2024-01-01T00:00:00+00:00\n\
             def\texited\tmaintainer=someone\n",
            LABEL_MANAGED, LABEL_IMAGE, LABEL_NODE, LABEL_CREATED
        );
        let listings = parse_container_listing(&output);
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].id, "abc");
        assert!(listings[0].running);
        assert_eq!(listings[0].tags.identity, "ubuntu:22.04");
    }

    #[test]
    fn test_parse_agent_processes_scopes_to_node_dir() {
        let output = "    1 Ss   /sbin/init\n\
                      4001 S    ssh-agent -s -a /tmp/agents/node1/agent.aaa.sock\n\
                      4002 Z    /usr/bin/ssh-agent -s -a /tmp/agents/node1/agent.bbb.sock\n\
                      4003 S    ssh-agent -s -a /tmp/agents/node2/agent.ccc.sock\n\
                      4004 S    ssh-agent -s -a /tmp/agents/node1/unrelated.sock\n";
        let found = parse_agent_processes(output, "ssh-agent", Path::new("/tmp/agents/node1"));
        assert_eq!(
            found,
            vec![
                AgentProcess {
                    pid: 4001,
                    socket: PathBuf::from("/tmp/agents/node1/agent.aaa.sock"),
                    zombie: false,
                },
                AgentProcess {
                    pid: 4002,
                    socket: PathBuf::from("/tmp/agents/node1/agent.bbb.sock"),
                    zombie: true,
                },
            ]
        );
    }
}
