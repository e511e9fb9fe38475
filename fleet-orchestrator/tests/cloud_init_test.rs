mod common;

use fleet_common::VmStatus;
use fleet_orchestrator::{cloud_init_job, registry};

#[tokio::test]
async fn stale_provisioning_vm_is_failed_exactly_once_with_a_log_row() {
    let Some(db) = common::test_pool().await else {
        return;
    };

    let name = common::unique_name("stale");
    let vm_id = registry::insert_vm(
        &db,
        &name,
        "mock",
        "srv-stale",
        Some("10.255.255.1"),
        None,
        None,
        VmStatus::Provisioning,
    )
    .await
    .unwrap();

    // Backdate creation past the 30-minute ceiling.
    sqlx::query("UPDATE vms SET created_at = NOW() - INTERVAL '31 minutes' WHERE id = $1")
        .bind(vm_id)
        .execute(&db)
        .await
        .unwrap();

    let summary = cloud_init_job::run(&db).await;
    assert!(summary.timed_out >= 1);

    let vm = registry::fetch_vm(&db, vm_id).await.unwrap().unwrap();
    assert_eq!(vm.status, VmStatus::Failed);

    let log_rows: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM action_logs WHERE vm_id = $1 AND action_type = 'CLOUD_INIT_TIMEOUT'",
    )
    .bind(vm_id)
    .fetch_one(&db)
    .await
    .unwrap();
    assert_eq!(log_rows, 1);

    let history: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM vm_state_history WHERE vm_id = $1 AND to_status = 'failed'",
    )
    .bind(vm_id)
    .fetch_one(&db)
    .await
    .unwrap();
    assert_eq!(history, 1);

    // A second pass skips the failed VM entirely.
    cloud_init_job::run(&db).await;
    let log_rows: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM action_logs WHERE vm_id = $1 AND action_type = 'CLOUD_INIT_TIMEOUT'",
    )
    .bind(vm_id)
    .fetch_one(&db)
    .await
    .unwrap();
    assert_eq!(log_rows, 1, "failed VMs are never polled again");
}
