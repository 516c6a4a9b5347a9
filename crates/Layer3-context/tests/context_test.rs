//! Execution context integration tests against the simulated host
//!
//! `cargo test -p dockhand-context --test context_test`

use dockhand_context::{
    AnsibleCommand, CheckoutOutcome, CheckoutRequest, ContextKey, ContextManager, ContextRequest,
};
use dockhand_foundation::{
    DockhandConfig, Error, MemoryCredentialStore, Node, Secret, TargetEnvironment,
};
use dockhand_pool::{test_private_key, ContainerOptions, PoolManager, SimulatedHost};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const REPO: &str = "https://git.example/infra.git";

fn config() -> DockhandConfig {
    let mut config = DockhandConfig::default();
    config.agent.root_dir = PathBuf::from("/tmp/dockhand-context-agents");
    config
}

fn credentials() -> MemoryCredentialStore {
    MemoryCredentialStore::new()
        .with_secret("deploy-prod", Secret::ssh_key(test_private_key("prod")))
        .with_secret("deploy-stage", Secret::ssh_key(test_private_key("stage")))
        .with_secret("vault-prod", Secret::file("prod.vault", "prod-password"))
}

fn setup_with(config: DockhandConfig) -> (Arc<SimulatedHost>, Node, Arc<ContextManager>) {
    let host = Arc::new(SimulatedHost::new());
    let node = host.node("node1");
    let pools = Arc::new(PoolManager::new(config));
    let manager = Arc::new(ContextManager::new(pools, Arc::new(credentials())));
    (host, node, manager)
}

fn setup() -> (Arc<SimulatedHost>, Node, Arc<ContextManager>) {
    setup_with(config())
}

fn request(node: &Node, version: &str) -> ContextRequest {
    ContextRequest::new(node.clone(), "infra", CheckoutRequest::new(REPO, version))
        .with_image("ansible:latest")
}

/// Poll `check` until it holds or about a second has passed
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

fn production() -> TargetEnvironment {
    TargetEnvironment::new("production", "inventories/prod")
        .with_ssh_credential("deploy-prod")
        .with_vault_credential("vault-prod")
}

fn staging() -> TargetEnvironment {
    TargetEnvironment::new("staging", "inventories/stage").with_ssh_credential("deploy-stage")
}

#[tokio::test]
async fn test_second_request_reuses_checkout() {
    let (host, node, manager) = setup();

    let first = manager.get_or_create(&request(&node, "v1")).await.unwrap();
    let second = manager.get_or_create(&request(&node, "v1")).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.ref_count(), 2);
    assert_eq!(host.count_calls("git clone"), 1);
    assert_eq!(host.count_calls("docker run"), 1);

    manager.release(&second, false).await;
    assert!(!first.is_killed());
    manager.release(&first, false).await;
    assert!(first.is_killed());
    assert!(host.running_container_ids().is_empty());
    assert!(host.agent_pids().is_empty());
}

#[tokio::test]
async fn test_concurrent_requests_share_one_setup() {
    let (host, node, manager) = setup();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let (manager, request) = (Arc::clone(&manager), request(&node, "v1"));
            tokio::spawn(async move { manager.get_or_create(&request).await.unwrap() })
        })
        .collect();

    let mut contexts = Vec::new();
    for handle in handles {
        contexts.push(handle.await.unwrap());
    }

    assert!(contexts.iter().all(|c| Arc::ptr_eq(c, &contexts[0])));
    assert_eq!(contexts[0].ref_count(), 8);
    assert_eq!(host.count_calls("ssh-agent -s"), 1);
    assert_eq!(host.count_calls("docker run"), 1);
    assert_eq!(host.count_calls("git clone"), 1);
    assert_eq!(host.count_calls("ansible.cfg"), 1);
}

#[tokio::test]
async fn test_versions_get_separate_contexts_and_share_container() {
    let (host, node, manager) = setup();

    let v1 = manager.get_or_create(&request(&node, "v1")).await.unwrap();
    let v2 = manager.get_or_create(&request(&node, "v2")).await.unwrap();

    assert_ne!(v1.workdir(), v2.workdir());
    assert_eq!(v1.container().id(), v2.container().id());
    assert_eq!(v1.container().ref_count(), 2);
    assert_eq!(v1.agent().ref_count(), 2);
    assert_eq!(host.count_calls("git clone"), 2);
    assert_eq!(manager.snapshot().await.len(), 2);
}

#[tokio::test]
async fn test_failed_checkout_rolls_back_agent_and_container() {
    let (host, node, manager) = setup();
    host.fail_matching("git clone");

    let err = manager.get_or_create(&request(&node, "v1")).await.err().unwrap();
    match err {
        Error::Setup { key, step, .. } => {
            assert_eq!(key, "node1/infra@v1");
            assert_eq!(step, "checkout");
        }
        other => panic!("unexpected error: {}", other),
    }

    assert!(manager.get(&ContextKey::new("node1", "infra", "v1")).await.is_none());
    assert!(manager.pools().containers().is_empty().await);
    assert!(manager.pools().agents().is_empty().await);
    assert!(host.running_container_ids().is_empty());
    assert!(host.agent_pids().is_empty());
}

#[tokio::test]
async fn test_failed_container_start_releases_agent() {
    let (host, node, manager) = setup();
    host.set_start_exited(true);

    let err = manager.get_or_create(&request(&node, "v1")).await.err().unwrap();
    assert!(matches!(err, Error::Setup { ref step, .. } if step == "container"));
    assert!(host.agent_pids().is_empty());
    assert_eq!(host.count_calls("git clone"), 0);
}

#[tokio::test]
async fn test_operation_loads_and_releases_environment_credentials() {
    let (host, node, manager) = setup();
    let environment = production();

    let outcome = manager
        .with_context(&request(&node, "v1"), |context| async move {
            let agent = Arc::clone(context.agent());
            let container_id = context.container().id().to_string();
            let workdir = context.workdir().to_string();
            let (inner_host, inner_id) = (Arc::clone(&host), container_id.clone());

            let outcome = context
                .with_environment(&environment, |op| async move {
                    assert_eq!(agent.loaded_ids().await, vec!["deploy-prod".to_string()]);
                    let vault = &op.vault_files()[0];
                    assert_eq!(inner_host.container_file(&inner_id, vault).as_deref(), Some("prod-password"));
                    op.run(&AnsibleCommand::playbook("site.yml")).await
                })
                .await?;

            assert_eq!(context.agent().loaded_count("deploy-prod").await, 0);
            assert!(host
                .container_files_under(&container_id, &format!("{}/.dockhand-secrets", workdir))
                .is_empty());
            Ok(outcome)
        })
        .await
        .unwrap();

    assert!(outcome.success());
    assert_eq!(outcome.command, "playbook site.yml");
}

#[tokio::test]
async fn test_missing_credential_fails_before_operation() {
    let (host, node, manager) = setup();
    let environment = TargetEnvironment::new("broken", "inventories/prod").with_ssh_credential("nope");
    let ran = Arc::new(AtomicBool::new(false));

    let context = manager.get_or_create(&request(&node, "v1")).await.unwrap();
    let flag = Arc::clone(&ran);
    let err = context
        .with_environment(&environment, |op| async move {
            flag.store(true, Ordering::SeqCst);
            op.run(&AnsibleCommand::playbook("site.yml")).await
        })
        .await
        .err()
        .unwrap();

    assert!(matches!(err, Error::Credential { .. }));
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(host.count_calls("ansible-playbook"), 0);

    // a missing vault secret also releases the ssh keys that were loaded
    let environment = TargetEnvironment::new("half", "inventories/prod")
        .with_ssh_credential("deploy-prod")
        .with_vault_credential("vault-missing");
    let err = context
        .with_environment(&environment, |op| async move {
            op.run(&AnsibleCommand::playbook("site.yml")).await
        })
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Credential { .. }));
    assert_eq!(context.agent().loaded_count("deploy-prod").await, 0);
}

#[tokio::test]
async fn test_failed_operation_still_cleans_up() {
    let (host, node, manager) = setup();
    let context = manager.get_or_create(&request(&node, "v1")).await.unwrap();

    let result: dockhand_foundation::Result<()> = context
        .with_environment(&production(), |_op| async {
            Err(Error::InvalidInput("playbook exploded".into()))
        })
        .await;

    assert!(result.is_err());
    assert_eq!(context.agent().loaded_count("deploy-prod").await, 0);
    assert!(host
        .container_files_under(
            context.container().id(),
            &format!("{}/.dockhand-secrets", context.workdir())
        )
        .is_empty());
}

#[tokio::test]
async fn test_nested_operations_use_their_own_environment() {
    let (_host, node, manager) = setup();
    let context = manager.get_or_create(&request(&node, "v1")).await.unwrap();
    let agent = Arc::clone(context.agent());

    let inner_agent = Arc::clone(&agent);
    let outer = &context;
    outer
        .with_environment(&production(), |_prod| async move {
            // staging runs while production keys are still referenced
            let ids = outer
                .with_environment(&staging(), |_stage| async move {
                    Ok(inner_agent.loaded_ids().await)
                })
                .await?;
            assert_eq!(ids, vec!["deploy-prod".to_string(), "deploy-stage".to_string()]);
            Ok(())
        })
        .await
        .unwrap();

    assert!(agent.loaded_ids().await.is_empty());
}

#[tokio::test]
async fn test_kept_container_is_fetched_not_recloned() {
    let (host, node, manager) = setup();

    // another holder keeps the container alive across the context's lifetime
    let holder = manager
        .pools()
        .acquire_container(&node, "ansible:latest", ContainerOptions::new())
        .await
        .unwrap();

    let first = manager.get_or_create(&request(&node, "v1")).await.unwrap();
    assert_eq!(first.checkout_outcome(), CheckoutOutcome::Cloned);
    manager.release(&first, false).await;
    assert!(first.is_killed());
    assert!(!holder.is_killed());

    let second = manager.get_or_create(&request(&node, "v1")).await.unwrap();
    assert_eq!(second.checkout_outcome(), CheckoutOutcome::Fetched);
    assert_eq!(second.container().id(), holder.id());
    assert_eq!(host.count_calls("git clone"), 1);
    assert_eq!(host.repo_fetches(holder.id(), second.workdir()), 1);
}

#[tokio::test]
async fn test_stopped_container_forces_new_context() {
    let (host, node, manager) = setup();

    let stale = manager.get_or_create(&request(&node, "v1")).await.unwrap();
    host.stop_container(stale.container().id());

    let fresh = manager.get_or_create(&request(&node, "v1")).await.unwrap();
    assert!(stale.is_killed());
    assert_ne!(stale.container().id(), fresh.container().id());
    assert_eq!(host.count_calls("git clone"), 2);

    // releasing the stale lease leaves the replacement alone
    manager.release(&stale, false).await;
    assert!(!fresh.is_killed());
    assert_eq!(fresh.ref_count(), 1);
}

#[tokio::test]
async fn test_keep_alive_retains_context() {
    let mut config = config();
    config.context.keep_alive = true;
    let (host, node, manager) = setup_with(config);

    manager
        .with_context(&request(&node, "v1"), |_context| async { Ok(()) })
        .await
        .unwrap();

    let idle = manager.get(&ContextKey::new("node1", "infra", "v1")).await.unwrap();
    assert_eq!(idle.ref_count(), 0);
    assert_eq!(host.running_container_ids().len(), 1);

    assert_eq!(manager.shutdown().await, 3);
    assert!(host.running_container_ids().is_empty());
    assert!(host.agent_pids().is_empty());
}

#[tokio::test]
async fn test_aborted_context_block_still_tears_down() {
    let (host, node, manager) = setup();
    let key = ContextKey::new("node1", "infra", "v1");

    let task = {
        let (manager, request) = (Arc::clone(&manager), request(&node, "v1"));
        tokio::spawn(async move {
            manager
                .with_context(&request, |_context| {
                    std::future::pending::<dockhand_foundation::Result<()>>()
                })
                .await
        })
    };
    while manager.get(&key).await.is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert!(eventually(|| host.running_container_ids().is_empty() && host.agent_pids().is_empty()).await);
    assert!(manager.get(&key).await.is_none());
    assert!(manager.pools().snapshot().await.is_empty());
}

#[tokio::test]
async fn test_aborted_operation_releases_credentials() {
    let (host, node, manager) = setup();
    let context = manager.get_or_create(&request(&node, "v1")).await.unwrap();

    let task = {
        let context = Arc::clone(&context);
        tokio::spawn(async move {
            let environment = production();
            context
                .with_environment(&environment, |_op| {
                    std::future::pending::<dockhand_foundation::Result<()>>()
                })
                .await
        })
    };
    let secrets = format!("{}/.dockhand-secrets", context.workdir());
    let container_id = context.container().id().to_string();
    // keys are loaded before the vault file is written
    assert!(eventually(|| !host.container_files_under(&container_id, &secrets).is_empty()).await);
    assert_eq!(context.agent().loaded_count("deploy-prod").await, 1);
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    for _ in 0..200 {
        if context.agent().loaded_count("deploy-prod").await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(context.agent().loaded_count("deploy-prod").await, 0);
    assert!(eventually(|| host.container_files_under(&container_id, &secrets).is_empty()).await);
    assert!(!context.is_killed());
}

#[tokio::test]
async fn test_release_without_retain_overrides_keep_alive() {
    let mut config = config();
    config.context.keep_alive = true;
    let (host, node, manager) = setup_with(config);

    let context = manager.get_or_create(&request(&node, "v1")).await.unwrap();
    manager.release(&context, false).await;

    assert!(context.is_killed());
    assert!(context.container().is_killed());
    assert!(context.agent().is_killed());
    assert!(host.running_container_ids().is_empty());
    assert!(host.agent_pids().is_empty());
    assert!(manager.pools().snapshot().await.is_empty());
}

#[tokio::test]
async fn test_release_with_retain_keeps_sub_resources() {
    let (host, node, manager) = setup();

    let context = manager.get_or_create(&request(&node, "v1")).await.unwrap();
    manager.release(&context, true).await;
    assert!(!context.is_killed());
    assert_eq!(context.ref_count(), 0);
    assert_eq!(host.running_container_ids().len(), 1);
    assert_eq!(host.agent_pids().len(), 1);

    // the next release decides again
    let again = manager.get_or_create(&request(&node, "v1")).await.unwrap();
    assert!(Arc::ptr_eq(&context, &again));
    manager.release(&again, false).await;
    assert!(host.running_container_ids().is_empty());
    assert!(host.agent_pids().is_empty());
}

#[tokio::test]
async fn test_externally_killed_agent_forces_new_context() {
    let (host, node, manager) = setup();

    let stale = manager.get_or_create(&request(&node, "v1")).await.unwrap();
    host.kill_agent_externally(stale.agent().pid());

    let fresh = manager.get_or_create(&request(&node, "v1")).await.unwrap();
    assert!(stale.is_killed());
    assert!(stale.agent().is_killed());
    assert_ne!(stale.agent().pid(), fresh.agent().pid());

    let outcome = fresh
        .with_environment(&production(), |op| async move {
            op.run(&AnsibleCommand::playbook("site.yml")).await
        })
        .await
        .unwrap();
    assert!(outcome.success());
}
