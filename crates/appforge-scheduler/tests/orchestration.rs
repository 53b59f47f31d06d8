//! End-to-end orchestration flows over the in-memory registry.

use std::sync::Arc;

use appforge_config::SystemConfig;
use appforge_core::ProjectId;
use appforge_core::build::BuildStatus;
use appforge_core::vm::VmStatus;
use appforge_scheduler::{Coordinator, LeaseManager};
use futures::future::join_all;

fn fixture() -> (
    Coordinator,
    Arc<LeaseManager>,
    Arc<appforge_scheduler::ChainManager>,
) {
    Coordinator::in_memory(SystemConfig::default())
}

#[tokio::test]
async fn test_single_vm_contention() {
    // Pool has 1 idle VM; two concurrent acquires - exactly one wins.
    let (_, lease, _) = fixture();
    lease.register("inst-1", "http://vm-1").await.unwrap();

    let claims = ["project-1", "project-2"].map(|project| {
        let lease = lease.clone();
        tokio::spawn(async move { lease.claim(&ProjectId::from(project), None).await })
    });
    let results: Vec<_> = join_all(claims)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let won = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(won, 1);
    let lost = results.iter().find(|r| r.is_err()).unwrap();
    assert_eq!(lost.as_ref().unwrap_err().code(), "no_idle_vms");
}

#[tokio::test]
async fn test_chain_lifecycle_with_splice_repair() {
    // Active B0; staged B1(->B0), B2(->B1), B3(->B2); a 5th message is
    // rejected; deleting B2 repairs B3's dependency to B1.
    let (coordinator, lease, chain) = fixture();
    lease.register("inst-1", "http://vm-1").await.unwrap();

    let project = ProjectId::from("project-chain");
    let (b0, staged) = coordinator
        .submit_message(&project, "build a todo app", vec![])
        .await
        .unwrap();
    assert!(!staged);

    let mut staged_ids = Vec::new();
    for content in ["feature a", "feature b", "feature c"] {
        let (build, staged) = coordinator
            .submit_message(&project, content, vec![])
            .await
            .unwrap();
        assert!(staged);
        assert_eq!(build.status, BuildStatus::Pending);
        staged_ids.push(build.id);
    }
    let (b1, b2, b3) = (staged_ids[0], staged_ids[1], staged_ids[2]);

    let err = coordinator
        .submit_message(&project, "feature d", vec![])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "max_staged_builds");

    // Verify the chain links before the splice.
    let staged = chain.staged_builds(&project).await.unwrap();
    assert_eq!(staged[0].depends_on_build_id, Some(b0.id));
    assert_eq!(staged[1].depends_on_build_id, Some(b1));
    assert_eq!(staged[2].depends_on_build_id, Some(b2));

    chain.delete_staged(b2).await.unwrap();

    let staged = chain.staged_builds(&project).await.unwrap();
    assert_eq!(staged.len(), 2);
    assert_eq!(staged[1].id, b3);
    assert_eq!(staged[1].depends_on_build_id, Some(b1));
}

#[tokio::test]
async fn test_promotion_walks_the_whole_chain() {
    // Each success hands the VM to the next staged build until the chain
    // drains.
    let (coordinator, lease, chain) = fixture();
    lease.register("inst-1", "http://vm-1").await.unwrap();

    let project = ProjectId::from("project-drain");
    let (b0, _) = coordinator
        .submit_message(&project, "build a todo app", vec![])
        .await
        .unwrap();
    let (b1, _) = coordinator
        .submit_message(&project, "add dark mode", vec![])
        .await
        .unwrap();
    let (b2, _) = coordinator
        .submit_message(&project, "add auth", vec![])
        .await
        .unwrap();

    for (done, next) in [(b0.id, b1.id), (b1.id, b2.id)] {
        lease.release("inst-1").await.unwrap();
        coordinator
            .report_status(done, BuildStatus::Succeeded, None)
            .await
            .unwrap();

        let promoted = chain.build(next).await.unwrap().unwrap();
        assert_eq!(promoted.status, BuildStatus::Queued);
        let pool = lease.pool_status().await.unwrap();
        let vm = &pool.vms[0];
        assert_eq!(vm.status, VmStatus::Busy);
        assert_eq!(vm.desired_build_id, Some(next));
    }

    lease.release("inst-1").await.unwrap();
    coordinator
        .report_status(b2.id, BuildStatus::Succeeded, None)
        .await
        .unwrap();
    assert!(chain.staged_builds(&project).await.unwrap().is_empty());
    assert_eq!(lease.pool_status().await.unwrap().idle, 1);
}

#[tokio::test]
async fn test_two_projects_share_the_pool() {
    let (coordinator, lease, _) = fixture();
    lease.register("inst-1", "http://vm-1").await.unwrap();
    lease.register("inst-2", "http://vm-2").await.unwrap();

    let (a, staged_a) = coordinator
        .submit_message(&ProjectId::from("project-a"), "app one", vec![])
        .await
        .unwrap();
    let (b, staged_b) = coordinator
        .submit_message(&ProjectId::from("project-b"), "app two", vec![])
        .await
        .unwrap();
    assert!(!staged_a && !staged_b);

    let pool = lease.pool_status().await.unwrap();
    assert_eq!(pool.busy, 2);
    let desired: Vec<_> = pool.vms.iter().filter_map(|vm| vm.desired_build_id).collect();
    assert!(desired.contains(&a.id));
    assert!(desired.contains(&b.id));
}
