//! Orphan discovery integration tests
//!
//! Each test plants the leftovers of a previous process on a simulated host,
//! then checks how a fresh manager reconciles them.

use dockhand_foundation::DockhandConfig;
use dockhand_pool::{ContainerOptions, PoolManager, SimulatedHost};
use std::path::PathBuf;
use std::sync::Arc;

const AGENT_ROOT: &str = "/tmp/dockhand-discovery-agents";

fn config() -> DockhandConfig {
    let mut config = DockhandConfig::default();
    config.agent.root_dir = PathBuf::from(AGENT_ROOT);
    config.discovery.settle_delay_secs = 0;
    config
}

fn setup() -> (Arc<SimulatedHost>, Arc<PoolManager>) {
    (Arc::new(SimulatedHost::new()), Arc::new(PoolManager::new(config())))
}

fn socket(node: &str, name: &str) -> PathBuf {
    PathBuf::from(AGENT_ROOT).join(node).join(format!("agent.{}.sock", name))
}

#[tokio::test]
async fn test_running_container_is_adopted_and_reused() {
    let (host, manager) = setup();
    let id = host.plant_container("node1", "img", true);
    let node = host.node("node1");

    let report = manager.discovery().run(&node).await;
    assert_eq!(report.containers_adopted, 1);
    assert_eq!(report.failures, 0);

    let lease = manager
        .acquire_container(&node, "img", ContainerOptions::new())
        .await
        .unwrap();
    assert_eq!(lease.id(), id);
    assert_eq!(lease.ref_count(), 1);
    assert_eq!(host.count_calls("docker run"), 0);
}

#[tokio::test]
async fn test_exited_and_duplicate_containers_are_removed() {
    let (host, manager) = setup();
    host.plant_container("node1", "img", false);
    host.plant_container("node1", "img", true);
    host.plant_container("node1", "img", true);
    let other_node = host.plant_container("node2", "img", true);

    let report = manager.discovery().run(&host.node("node1")).await;

    assert_eq!(report.containers_adopted, 1);
    assert_eq!(report.containers_removed, 2);
    assert_eq!(host.container_ids().len(), 2);
    assert!(host.is_container_running(&other_node));
    assert_eq!(manager.containers().len().await, 1);
}

#[tokio::test]
async fn test_tracked_container_wins_over_orphan() {
    let (host, manager) = setup();
    let node = host.node("node1");
    let tracked = manager
        .acquire_container(&node, "img", ContainerOptions::new())
        .await
        .unwrap();
    let orphan = host.plant_container("node1", "img", true);

    let report = manager.discovery().run(&node).await;

    assert_eq!(report.containers_adopted, 0);
    assert_eq!(report.containers_removed, 1);
    assert!(!host.is_container_running(&orphan));
    assert!(host.is_container_running(tracked.id()));
    assert_eq!(tracked.ref_count(), 1);
}

#[tokio::test]
async fn test_two_live_agents_leave_exactly_one() {
    let (host, manager) = setup();
    let first = host.spawn_agent(&socket("node1", "one"));
    let second = host.spawn_agent(&socket("node1", "two"));
    let node = host.node("node1");

    let report = manager.discovery().run(&node).await;

    assert_eq!(report.agents_adopted, 1);
    assert_eq!(report.agents_killed, 1);
    assert_eq!(host.agent_pids(), vec![first]);
    assert!(!host.socket_exists(&socket("node1", "two")));

    // acquire reuses the adopted agent
    let agent = manager.acquire_agent(&node).await.unwrap();
    assert_eq!(agent.pid(), first);
    assert_ne!(agent.pid(), second);
    assert_eq!(host.count_calls("ssh-agent -s"), 0);
}

#[tokio::test]
async fn test_stale_sockets_removed_and_zombies_ignored() {
    let (host, manager) = setup();
    host.plant_socket(&socket("node1", "stale"));
    let zombie = host.spawn_agent(&socket("node1", "zombie"));
    host.mark_zombie(zombie);
    let live = host.spawn_agent(&socket("node1", "live"));
    // other nodes are out of scope
    host.spawn_agent(&socket("node2", "elsewhere"));

    let report = manager.discovery().run(&host.node("node1")).await;

    assert_eq!(report.sockets_removed, 2);
    assert_eq!(report.agents_adopted, 1);
    assert_eq!(report.agents_killed, 0);
    assert!(host.socket_exists(&socket("node1", "live")));
    assert!(host.socket_exists(&socket("node2", "elsewhere")));
    assert!(!host.socket_exists(&socket("node1", "stale")));
    assert!(!host.socket_exists(&socket("node1", "zombie")));
    assert_eq!(manager.agents().get(&dockhand_pool::agent_key("node1")).await.unwrap().pid(), live);
}

#[tokio::test]
async fn test_tracked_agent_kept_and_stray_killed() {
    let (host, manager) = setup();
    let node = host.node("node1");
    let tracked = manager.acquire_agent(&node).await.unwrap();
    let stray = host.spawn_agent(&socket("node1", "stray"));

    let report = manager.discovery().run(&node).await;

    assert_eq!(report.agents_adopted, 0);
    assert_eq!(report.agents_killed, 1);
    assert_eq!(host.agent_pids(), vec![tracked.pid()]);
    assert!(!host.agent_pids().contains(&stray));
}

#[tokio::test]
async fn test_second_pass_is_idempotent() {
    let (host, manager) = setup();
    host.plant_container("node1", "img", true);
    host.plant_container("node1", "other", false);
    host.spawn_agent(&socket("node1", "one"));
    host.spawn_agent(&socket("node1", "two"));
    host.plant_socket(&socket("node1", "stale"));
    let node = host.node("node1");

    let first = manager.discovery().run(&node).await;
    assert!(!first.is_noop());

    let containers = host.container_ids();
    let agents = host.agent_pids();
    let second = manager.discovery().run(&node).await;

    assert!(second.is_noop(), "second pass changed state: {:?}", second);
    assert_eq!(second.failures, 0);
    assert_eq!(host.container_ids(), containers);
    assert_eq!(host.agent_pids(), agents);
}

#[tokio::test]
async fn test_listing_failure_is_counted_not_fatal() {
    let (host, manager) = setup();
    host.fail_next("docker ps");
    let live = host.spawn_agent(&socket("node1", "live"));

    let report = manager.discovery().run(&host.node("node1")).await;

    assert_eq!(report.failures, 1);
    assert_eq!(report.agents_adopted, 1);
    assert_eq!(host.agent_pids(), vec![live]);
}

#[tokio::test]
async fn test_node_connect_listener() {
    let (host, manager) = setup();
    host.plant_container("node1", "img", true);

    let listener = manager.node_connect_listener();
    let report = listener
        .node_online(host.node("node1"))
        .expect("discovery is enabled")
        .await
        .unwrap();
    assert_eq!(report.containers_adopted, 1);

    let mut disabled = config();
    disabled.discovery.enabled = false;
    let manager = Arc::new(PoolManager::new(disabled));
    assert!(manager.node_connect_listener().node_online(host.node("node1")).is_none());
}
