//! Pool manager
//!
//! Owns the container pool and the ssh-agent pool of one process. Nothing is
//! global: construct one manager per process (or per test) and share it.

use dockhand_foundation::{DockhandConfig, Node, Result};
use std::sync::Arc;
use tracing::info;

use crate::commands::DockerCommands;
use crate::container::{Container, ContainerLifecycle, ContainerOptions, ContainerSpec};
use crate::discovery::{NodeConnectListener, OrphanDiscovery};
use crate::key::ResourceKey;
use crate::pool::{Lease, PoolEntrySummary, ResourcePool};
use crate::ssh_agent::{agent_key, AgentSpec, SshAgent, SshAgentLifecycle};

/// Container and agent pools sharing one configuration
pub struct PoolManager {
    config: DockhandConfig,
    containers: ResourcePool<ContainerLifecycle>,
    agents: ResourcePool<SshAgentLifecycle>,
}

impl PoolManager {
    pub fn new(config: DockhandConfig) -> Self {
        let timeout = config.command_timeout();
        Self {
            containers: ResourcePool::new(ContainerLifecycle::new(DockerCommands::from_config(&config))),
            agents: ResourcePool::new(SshAgentLifecycle::new(config.agent.clone(), timeout)),
            config,
        }
    }

    pub fn config(&self) -> &DockhandConfig {
        &self.config
    }

    pub fn containers(&self) -> &ResourcePool<ContainerLifecycle> {
        &self.containers
    }

    pub fn agents(&self) -> &ResourcePool<SshAgentLifecycle> {
        &self.agents
    }

    /// Shared container for (node, image)
    pub async fn acquire_container(
        &self,
        node: &Node,
        image: &str,
        options: ContainerOptions,
    ) -> Result<Lease<Container>> {
        let key = ResourceKey::new(node.name(), image);
        self.containers
            .acquire(key, &ContainerSpec::new(node.clone(), options))
            .await
    }

    pub async fn release_container(&self, lease: &Lease<Container>, retain: bool) {
        self.containers.release(lease, retain).await
    }

    /// The node's ssh-agent, started on first use
    pub async fn acquire_agent(&self, node: &Node) -> Result<Lease<SshAgent>> {
        self.agents
            .acquire(agent_key(node.name()), &AgentSpec::new(node.clone()))
            .await
    }

    pub async fn release_agent(&self, lease: &Lease<SshAgent>, retain: bool) {
        self.agents.release(lease, retain).await
    }

    /// Discovery bound to this manager
    pub fn discovery(self: &Arc<Self>) -> OrphanDiscovery {
        OrphanDiscovery::new(Arc::clone(self))
    }

    /// Node-online hook using the configured settle delay
    pub fn node_connect_listener(self: &Arc<Self>) -> NodeConnectListener {
        NodeConnectListener::new(self.discovery(), self.config.discovery.clone())
    }

    /// Tracked containers then agents
    pub async fn snapshot(&self) -> Vec<PoolEntrySummary> {
        let mut rows = self.containers.snapshot().await;
        rows.extend(self.agents.snapshot().await);
        rows
    }

    /// Destroy everything tracked, containers first
    pub async fn shutdown(&self) -> usize {
        let containers = self.containers.drain().await;
        let agents = self.agents.drain().await;
        info!(
            "Pool shutdown: destroyed {} container(s), {} ssh-agent(s)",
            containers, agents
        );
        containers + agents
    }
}
