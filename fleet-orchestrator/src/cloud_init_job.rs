use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Pool, Postgres};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::{logger, registry, shell};

/// Past this age a provisioning VM is written off; it is never polled again.
const MAX_PROVISIONING_AGE_SECS: i64 = 30 * 60;
/// Concurrent sentinel checks per invocation.
const CHECK_CONCURRENCY: usize = 8;

#[derive(Debug, Serialize)]
pub struct CloudInitSummary {
    pub checked: i64,
    pub ready: i64,
    pub timed_out: i64,
    pub pending: i64,
}

fn sentinel_path() -> String {
    std::env::var("FLEET_SENTINEL_PATH").unwrap_or_else(|_| "/opt/agentd/.provision-done".to_string())
}

/// Cloud-init runs before the application account exists, so first-boot
/// detection has to use the platform account the image ships with.
fn platform_ssh_user() -> String {
    std::env::var("FLEET_PLATFORM_SSH_USER").unwrap_or_else(|_| "root".to_string())
}

enum CheckOutcome {
    Ready,
    TimedOut,
    Pending,
}

#[allow(clippy::too_many_arguments)]
async fn check_vm(
    db: Pool<Postgres>,
    vm_id: Uuid,
    name: String,
    provider: String,
    provider_instance_id: Option<String>,
    ip: Option<String>,
    ssh_port: i32,
    created_at: DateTime<Utc>,
) -> CheckOutcome {
    let age_secs = (Utc::now() - created_at).num_seconds();
    if age_secs > MAX_PROVISIONING_AGE_SECS {
        println!(
            "⏱️  [cloud-init] {} stuck provisioning for {}s, marking failed",
            name, age_secs
        );
        let reason = format!("cloud-init did not finish within {MAX_PROVISIONING_AGE_SECS}s");
        let _ = registry::provisioning_to_failed(&db, vm_id, &reason).await;
        let _ = logger::log_event(&db, "CLOUD_INIT_TIMEOUT", "failed", vm_id, Some(&reason)).await;
        return CheckOutcome::TimedOut;
    }

    // No IP yet: ask the provider before giving up on this cycle.
    let ip = match ip {
        Some(ip) => ip,
        None => {
            let Some(pid) = provider_instance_id.as_deref() else {
                return CheckOutcome::Pending;
            };
            let Some(provider) = fleet_providers::get_provider(&provider) else {
                return CheckOutcome::Pending;
            };
            match provider.get_server(pid).await {
                Ok(state) => match state.ip {
                    Some(found_ip) => {
                        let _ = sqlx::query(
                            "UPDATE vms SET ip_address = $1::inet WHERE id = $2 AND ip_address IS NULL",
                        )
                        .bind(&found_ip)
                        .bind(vm_id)
                        .execute(&db)
                        .await;
                        found_ip
                    }
                    None => return CheckOutcome::Pending,
                },
                Err(e) => {
                    eprintln!("⚠️  [cloud-init] IP lookup failed for {}: {}", name, e);
                    return CheckOutcome::Pending;
                }
            }
        }
    };

    // Cheap TCP probe first; a VM mid-boot has no sshd listening yet.
    if !shell::check_port(&ip, ssh_port).await {
        return CheckOutcome::Pending;
    }

    let target = shell::SshTarget::new(&ip, ssh_port, &platform_ssh_user());
    let script = format!(
        "test -f {} && echo ::sentinel::present || echo ::sentinel::absent",
        sentinel_path()
    );

    // An unreachable shell just means the VM is still booting; re-checked
    // next cycle, not an error.
    let output = match shell::run_script(&target, &script, Duration::from_secs(20)).await {
        Ok(out) => out,
        Err(_) => return CheckOutcome::Pending,
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.contains("::sentinel::present") {
        println!("✅ [cloud-init] {} finished first-boot customization", name);
        let flipped = registry::provisioning_to_ready(&db, vm_id, "cloud-init sentinel present")
            .await
            .unwrap_or(false);
        if flipped {
            let _ = logger::log_event(&db, "VM_READY", "success", vm_id, None).await;
        }
        CheckOutcome::Ready
    } else {
        CheckOutcome::Pending
    }
}

/// Scheduled pass over every provisioning VM.
pub async fn run(db: &Pool<Postgres>) -> CloudInitSummary {
    #[allow(clippy::type_complexity)]
    let rows: Vec<(Uuid, String, String, Option<String>, Option<String>, i32, DateTime<Utc>)> =
        sqlx::query_as(
            "SELECT id, name, provider, provider_instance_id, ip_address::text, ssh_port, created_at
             FROM vms
             WHERE status = 'provisioning'
             ORDER BY created_at ASC
             LIMIT 100",
        )
        .fetch_all(db)
        .await
        .unwrap_or_default();

    let mut summary = CloudInitSummary {
        checked: rows.len() as i64,
        ready: 0,
        timed_out: 0,
        pending: 0,
    };
    if rows.is_empty() {
        return summary;
    }

    println!("🔍 [cloud-init] checking {} provisioning VM(s)", rows.len());

    let semaphore = Arc::new(Semaphore::new(CHECK_CONCURRENCY));
    let mut set = JoinSet::new();
    for (vm_id, name, provider, provider_instance_id, ip, ssh_port, created_at) in rows {
        let db = db.clone();
        let semaphore = semaphore.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            check_vm(db, vm_id, name, provider, provider_instance_id, ip, ssh_port, created_at)
                .await
        });
    }

    while let Some(res) = set.join_next().await {
        match res {
            Ok(CheckOutcome::Ready) => summary.ready += 1,
            Ok(CheckOutcome::TimedOut) => summary.timed_out += 1,
            Ok(CheckOutcome::Pending) => summary.pending += 1,
            Err(e) => {
                eprintln!("⚠️  [cloud-init] check task panicked: {}", e);
                summary.pending += 1;
            }
        }
    }

    summary
}
