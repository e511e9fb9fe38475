mod common;

use fleet_common::{HealthStatus, VmStatus};
use fleet_orchestrator::registry;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

async fn clean(db: &Pool<Postgres>) {
    for table in [
        "configure_attempt_log",
        "vm_state_history",
        "action_logs",
        "backups",
        "pending_configs",
        "vms",
    ] {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(db)
            .await
            .unwrap();
    }
}

async fn insert_ready(db: &Pool<Postgres>, name: &str, ip: &str) -> Uuid {
    registry::insert_vm(
        db,
        name,
        "mock",
        &format!("srv-{name}"),
        Some(ip),
        Some("fsn1"),
        Some("cpx21"),
        VmStatus::Ready,
    )
    .await
    .unwrap()
}

// The claim operation is the single point that must guarantee exactly one
// winner, so every phase that claims from the shared pool runs inside this
// one sequential test.
#[tokio::test]
async fn claim_lifecycle_against_a_live_registry() {
    let Some(db) = common::test_pool().await else {
        return;
    };
    clean(&db).await;

    // --- exactly one winner under concurrent claims ---
    let vm_id = insert_ready(&db, &common::unique_name("claimvm"), "10.0.0.10").await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            registry::claim_ready_vm(&db, Uuid::new_v4()).await.unwrap()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one concurrent claim may win");

    let vm = registry::fetch_vm(&db, vm_id).await.unwrap().unwrap();
    assert_eq!(vm.status, VmStatus::Assigned);
    assert!(vm.assigned_to.is_some(), "assigned iff assigned_to set");
    assert_eq!(vm.health_status, HealthStatus::Configuring);

    // --- an assigned VM is never claimed again; empty pool yields None ---
    assert!(registry::claim_ready_vm(&db, Uuid::new_v4())
        .await
        .unwrap()
        .is_none());
    let vm_after = registry::fetch_vm(&db, vm_id).await.unwrap().unwrap();
    assert_eq!(vm_after.assigned_to, vm.assigned_to);

    // --- a provisioning VM is not claimable ---
    registry::insert_vm(
        &db,
        &common::unique_name("notready"),
        "mock",
        "srv-notready",
        None,
        None,
        None,
        VmStatus::Provisioning,
    )
    .await
    .unwrap();
    assert!(registry::claim_ready_vm(&db, Uuid::new_v4())
        .await
        .unwrap()
        .is_none());

    // --- the claim picks the oldest ready VM first ---
    let second = insert_ready(&db, &common::unique_name("second"), "10.0.0.11").await;
    let third = insert_ready(&db, &common::unique_name("third"), "10.0.0.12").await;
    sqlx::query("UPDATE vms SET created_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(third)
        .execute(&db)
        .await
        .unwrap();
    let claimed = registry::claim_ready_vm(&db, Uuid::new_v4())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, third);

    // --- configure attempts bump on failure, reset on success ---
    registry::mark_configure_failed(&db, third, "boom").await.unwrap();
    registry::mark_configure_failed(&db, third, "boom again").await.unwrap();
    let vm = registry::fetch_vm(&db, third).await.unwrap().unwrap();
    assert_eq!(vm.configure_attempts, 2);
    assert_eq!(vm.health_status, HealthStatus::ConfigureFailed);

    registry::mark_configure_succeeded(&db, third).await.unwrap();
    let vm = registry::fetch_vm(&db, third).await.unwrap().unwrap();
    assert_eq!(vm.configure_attempts, 0);
    assert_eq!(vm.health_status, HealthStatus::Configuring);

    // --- health promotion is CAS and idempotent ---
    assert!(
        !registry::configuring_to_healthy(&db, second, "probe").await.unwrap(),
        "unassigned VM cannot be promoted"
    );
    assert!(registry::configuring_to_healthy(&db, third, "probe").await.unwrap());
    assert!(!registry::configuring_to_healthy(&db, third, "probe").await.unwrap());
    let vm = registry::fetch_vm(&db, third).await.unwrap().unwrap();
    assert_eq!(vm.health_status, HealthStatus::Healthy);
    assert!(vm.last_health_check.is_some());

    // --- attempt reservation is atomic, even for overlapping callers ---
    let mut reservations = Vec::new();
    for _ in 0..5 {
        let db = db.clone();
        reservations.push(tokio::spawn(async move {
            registry::try_record_configure_attempt(&db, third, 600, 3)
                .await
                .unwrap()
        }));
    }
    let mut granted = 0;
    for handle in reservations {
        if handle.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 3, "the window admits exactly three attempts");
    assert!(
        !registry::try_record_configure_attempt(&db, third, 600, 3)
            .await
            .unwrap(),
        "a later attempt inside the window is rejected"
    );
    let attempts = registry::recent_configure_attempts(&db, third, 600).await.unwrap();
    assert_eq!(attempts.len(), 3);
    let retry = fleet_orchestrator::configurator::retry_after_secs(&attempts, chrono::Utc::now());
    assert!(retry.unwrap() > 0, "fourth attempt in window is rejected");

    // --- failed VMs still count toward the cost ceiling ---
    let total_before = registry::count_total(&db).await.unwrap();
    let doomed = registry::insert_vm(
        &db,
        &common::unique_name("doomed"),
        "mock",
        "srv-doomed",
        None,
        None,
        None,
        VmStatus::Provisioning,
    )
    .await
    .unwrap();
    registry::provisioning_to_failed(&db, doomed, "never booted").await.unwrap();
    assert_eq!(
        registry::count_total(&db).await.unwrap(),
        total_before + 1,
        "a failed VM still exists at the provider"
    );

    // --- every transition left an audit row ---
    let history: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM vm_state_history WHERE vm_id = $1",
    )
    .bind(third)
    .fetch_one(&db)
    .await
    .unwrap();
    assert!(history >= 3, "claim, failure, and promotion each logged");
}
