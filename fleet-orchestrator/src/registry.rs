use chrono::{DateTime, Utc};
use fleet_common::{Vm, VmStatus};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

/// Shared column list so every fetch maps onto `fleet_common::Vm` the same
/// way (INET cast included).
const VM_COLUMNS: &str = "id, name, provider, provider_instance_id, ip_address::text AS ip_address, \
     region, instance_class, ssh_port, ssh_user, status, health_status, assigned_to, \
     configure_attempts, tier, api_mode, channels, gateway_url, gateway_token, control_url, \
     model, created_at, last_health_check";

/// Record a state transition in vm_state_history (best effort).
async fn log_state_transition(
    db: &Pool<Postgres>,
    vm_id: Uuid,
    from_status: &str,
    to_status: &str,
    reason: &str,
) {
    let _ = sqlx::query(
        "INSERT INTO vm_state_history (vm_id, from_status, to_status, reason)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(vm_id)
    .bind(from_status)
    .bind(to_status)
    .bind(reason)
    .execute(db)
    .await;
}

pub async fn insert_vm(
    db: &Pool<Postgres>,
    name: &str,
    provider: &str,
    provider_instance_id: &str,
    ip: Option<&str>,
    region: Option<&str>,
    instance_class: Option<&str>,
    status: VmStatus,
) -> Result<Uuid, sqlx::Error> {
    let id: Uuid = sqlx::query_scalar(
        "INSERT INTO vms (name, provider, provider_instance_id, ip_address, region, instance_class, status)
         VALUES ($1, $2, $3, $4::inet, $5, $6, $7)
         RETURNING id",
    )
    .bind(name)
    .bind(provider)
    .bind(provider_instance_id)
    .bind(ip)
    .bind(region)
    .bind(instance_class)
    .bind(status)
    .fetch_one(db)
    .await?;
    Ok(id)
}

/// Every row counts toward the cost ceiling. Failed VMs still exist at the
/// provider and cost money until an operator removes them.
pub async fn count_total(db: &Pool<Postgres>) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT count(*) FROM vms")
        .fetch_one(db)
        .await
}

pub async fn count_ready(db: &Pool<Postgres>) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT count(*) FROM vms WHERE status = 'ready' AND assigned_to IS NULL")
        .fetch_one(db)
        .await
}

pub async fn existing_names(db: &Pool<Postgres>) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT name FROM vms").fetch_all(db).await
}

/// Transition PROVISIONING -> READY once the cloud-init sentinel appears
/// (idempotent).
pub async fn provisioning_to_ready(
    db: &Pool<Postgres>,
    vm_id: Uuid,
    reason: &str,
) -> Result<bool, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE vms
         SET status = 'ready'
         WHERE id = $1 AND status = 'provisioning'",
    )
    .bind(vm_id)
    .execute(db)
    .await?;

    if res.rows_affected() > 0 {
        log_state_transition(db, vm_id, "provisioning", "ready", reason).await;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Transition PROVISIONING -> FAILED past the cloud-init age ceiling
/// (idempotent). Failed VMs are never polled again.
pub async fn provisioning_to_failed(
    db: &Pool<Postgres>,
    vm_id: Uuid,
    reason: &str,
) -> Result<bool, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE vms
         SET status = 'failed'
         WHERE id = $1 AND status = 'provisioning'",
    )
    .bind(vm_id)
    .execute(db)
    .await?;

    if res.rows_affected() > 0 {
        log_state_transition(db, vm_id, "provisioning", "failed", reason).await;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Atomically claim one ready, unassigned VM for a customer. The SKIP LOCKED
/// subselect plus the status guard on the outer UPDATE guarantees exactly one
/// winner under concurrent callers; None means the pool is empty.
pub async fn claim_ready_vm(
    db: &Pool<Postgres>,
    customer_id: Uuid,
) -> Result<Option<Vm>, sqlx::Error> {
    let sql = format!(
        "UPDATE vms
         SET status = 'assigned',
             assigned_to = $1,
             health_status = 'configuring'
         WHERE status = 'ready' AND id = (
             SELECT id FROM vms
             WHERE status = 'ready' AND assigned_to IS NULL
             ORDER BY created_at ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED
         )
         RETURNING {VM_COLUMNS}"
    );
    let vm: Option<Vm> = sqlx::query_as(&sql)
        .bind(customer_id)
        .fetch_optional(db)
        .await?;

    if let Some(vm) = &vm {
        log_state_transition(db, vm.id, "ready", "assigned", "claimed by customer").await;
    }
    Ok(vm)
}

pub async fn fetch_vm(db: &Pool<Postgres>, vm_id: Uuid) -> Result<Option<Vm>, sqlx::Error> {
    let sql = format!("SELECT {VM_COLUMNS} FROM vms WHERE id = $1");
    sqlx::query_as(&sql).bind(vm_id).fetch_optional(db).await
}

pub async fn fetch_vm_for_customer(
    db: &Pool<Postgres>,
    customer_id: Uuid,
) -> Result<Option<Vm>, sqlx::Error> {
    let sql = format!(
        "SELECT {VM_COLUMNS} FROM vms WHERE status = 'assigned' AND assigned_to = $1
         ORDER BY created_at DESC LIMIT 1"
    );
    sqlx::query_as(&sql).bind(customer_id).fetch_optional(db).await
}

/// Set health_status = configuring at the start of a configure run. Only the
/// configurator and health monitor ever touch health_status; `status` stays
/// owned by the provisioning/assignment jobs.
pub async fn begin_configuring(db: &Pool<Postgres>, vm_id: Uuid) -> Result<bool, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE vms
         SET health_status = 'configuring'
         WHERE id = $1 AND status = 'assigned'",
    )
    .bind(vm_id)
    .execute(db)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Configure run failed: health_status -> configure_failed, bump attempts.
pub async fn mark_configure_failed(
    db: &Pool<Postgres>,
    vm_id: Uuid,
    error: &str,
) -> Result<bool, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE vms
         SET health_status = 'configure_failed',
             configure_attempts = configure_attempts + 1
         WHERE id = $1 AND status = 'assigned'",
    )
    .bind(vm_id)
    .execute(db)
    .await?;

    if res.rows_affected() > 0 {
        log_state_transition(db, vm_id, "configuring", "configure_failed", error).await;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Configure run observed its success marker: reset the attempt counter.
/// health_status stays `configuring` until a liveness probe passes.
pub async fn mark_configure_succeeded(db: &Pool<Postgres>, vm_id: Uuid) -> Result<bool, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE vms
         SET configure_attempts = 0,
             health_status = 'configuring'
         WHERE id = $1 AND status = 'assigned'",
    )
    .bind(vm_id)
    .execute(db)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// CONFIGURING -> HEALTHY once a signed liveness probe succeeds (idempotent).
pub async fn configuring_to_healthy(
    db: &Pool<Postgres>,
    vm_id: Uuid,
    reason: &str,
) -> Result<bool, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE vms
         SET health_status = 'healthy',
             last_health_check = NOW()
         WHERE id = $1 AND status = 'assigned' AND health_status = 'configuring'",
    )
    .bind(vm_id)
    .execute(db)
    .await?;

    if res.rows_affected() > 0 {
        log_state_transition(db, vm_id, "configuring", "healthy", reason).await;
        Ok(true)
    } else {
        Ok(false)
    }
}

pub async fn touch_health_check(db: &Pool<Postgres>, vm_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE vms SET last_health_check = NOW() WHERE id = $1")
        .bind(vm_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Persist the customer-facing endpoint fields. Runs BEFORE the optional
/// synchronous liveness phase so a caller timeout there cannot lose
/// already-completed work.
#[allow(clippy::too_many_arguments)]
pub async fn record_endpoints(
    db: &Pool<Postgres>,
    vm_id: Uuid,
    gateway_url: &str,
    control_url: &str,
    gateway_token: &str,
    model: &str,
    tier: &str,
    api_mode: fleet_common::ApiMode,
    channels: &serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE vms
         SET gateway_url = $2,
             control_url = $3,
             gateway_token = $4,
             model = $5,
             tier = $6,
             api_mode = $7,
             channels = $8
         WHERE id = $1 AND status = 'assigned'",
    )
    .bind(vm_id)
    .bind(gateway_url)
    .bind(control_url)
    .bind(gateway_token)
    .bind(model)
    .bind(tier)
    .bind(api_mode)
    .bind(channels)
    .execute(db)
    .await?;
    Ok(())
}

// --- Pending configuration staging ---

pub async fn fetch_pending_config(
    db: &Pool<Postgres>,
    customer_id: Uuid,
) -> Result<Option<fleet_common::PendingConfig>, sqlx::Error> {
    sqlx::query_as(
        "SELECT customer_id, api_mode, api_key, tier, model, channels, search_key, seed_memory,
                system_prompt, created_at
         FROM pending_configs WHERE customer_id = $1",
    )
    .bind(customer_id)
    .fetch_optional(db)
    .await
}

/// Consumed exactly once: deleted after the configurator succeeds.
pub async fn delete_pending_config(
    db: &Pool<Postgres>,
    customer_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM pending_configs WHERE customer_id = $1")
        .bind(customer_id)
        .execute(db)
        .await?;
    Ok(())
}

// --- Configure attempt rate-limit bookkeeping ---

/// Reserve one configure attempt inside the rolling window. The per-VM
/// advisory lock serializes overlapping callers, so the count-then-insert
/// sees every committed reservation and the window never admits more than
/// `max_attempts`. Returns false when the window is already full.
pub async fn try_record_configure_attempt(
    db: &Pool<Postgres>,
    vm_id: Uuid,
    window_secs: i64,
    max_attempts: i64,
) -> Result<bool, sqlx::Error> {
    let mut tx = db.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
        .bind(vm_id)
        .execute(&mut *tx)
        .await?;
    let res = sqlx::query(
        "INSERT INTO configure_attempt_log (vm_id)
         SELECT $1
         WHERE (SELECT count(*) FROM configure_attempt_log
                WHERE vm_id = $1
                  AND attempted_at > NOW() - make_interval(secs => $2::float8)) < $3",
    )
    .bind(vm_id)
    .bind(window_secs as f64)
    .bind(max_attempts)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(res.rows_affected() > 0)
}

pub async fn recent_configure_attempts(
    db: &Pool<Postgres>,
    vm_id: Uuid,
    window_secs: i64,
) -> Result<Vec<DateTime<Utc>>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT attempted_at FROM configure_attempt_log
         WHERE vm_id = $1 AND attempted_at > NOW() - make_interval(secs => $2::float8)
         ORDER BY attempted_at ASC",
    )
    .bind(vm_id)
    .bind(window_secs as f64)
    .fetch_all(db)
    .await
}
