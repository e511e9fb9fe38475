use std::time::Duration;

use serde::Serialize;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::{logger, registry};

#[derive(Debug, Serialize)]
pub struct HealthSummary {
    pub checked: i64,
    pub promoted: i64,
    pub still_configuring: i64,
}

/// Signed liveness probe against the VM's gateway.
async fn probe(gateway_url: &str, token: &str) -> bool {
    let client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .timeout(Duration::from_secs(5))
        .danger_accept_invalid_certs(gateway_url.starts_with("https"))
        .build()
    {
        Ok(c) => c,
        Err(_) => return false,
    };
    let url = format!("{}/healthz", gateway_url.trim_end_matches('/'));
    match client.get(&url).bearer_auth(token).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// Promote configuring VMs whose gateway answers a signed probe. VMs in
/// configure_failed are left alone for a human-triggered retry.
pub async fn run(db: &Pool<Postgres>) -> HealthSummary {
    let rows: Vec<(Uuid, String, Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT id, name, gateway_url, gateway_token FROM vms
         WHERE status = 'assigned' AND health_status = 'configuring'
         ORDER BY created_at ASC
         LIMIT 100",
    )
    .fetch_all(db)
    .await
    .unwrap_or_default();

    let mut summary = HealthSummary {
        checked: rows.len() as i64,
        promoted: 0,
        still_configuring: 0,
    };
    if rows.is_empty() {
        return summary;
    }

    println!("💓 [health] probing {} configuring VM(s)", rows.len());

    for (vm_id, name, gateway_url, gateway_token) in rows {
        let (Some(url), Some(token)) = (gateway_url, gateway_token) else {
            // Configure has not recorded endpoints yet; nothing to probe.
            summary.still_configuring += 1;
            continue;
        };

        if probe(&url, &token).await {
            let promoted = registry::configuring_to_healthy(db, vm_id, "liveness probe passed")
                .await
                .unwrap_or(false);
            if promoted {
                println!("✅ [health] {} is healthy", name);
                let _ = logger::log_event(db, "VM_HEALTHY", "success", vm_id, None).await;
                summary.promoted += 1;
            } else {
                summary.still_configuring += 1;
            }
        } else {
            let _ = registry::touch_health_check(db, vm_id).await;
            summary.still_configuring += 1;
        }
    }

    summary
}
