use fleet_common::VmStatus;
use fleet_providers::{wait_for_server, CloudProvider, ProviderError};
use serde::Serialize;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::{alerts, logger, registry};

#[derive(Debug, Serialize)]
pub struct PoolSummary {
    pub total: i64,
    pub ready: i64,
    pub needed: i64,
    pub provisioned: i64,
    pub failed_slots: i64,
    pub cost_ceiling_hit: bool,
}

fn env_i64(var: &str, default: i64) -> i64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v >= 0)
        .unwrap_or(default)
}

fn env_flag(var: &str) -> bool {
    std::env::var(var)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// How many VMs this run may create: the shortfall, capped per run and by
/// the remaining headroom under the hard ceiling.
pub fn slots_to_provision(
    total: i64,
    ready: i64,
    min_pool: i64,
    per_run_cap: i64,
    max_total: i64,
) -> i64 {
    if total >= max_total || ready >= min_pool {
        return 0;
    }
    let needed = min_pool - ready;
    let remaining_ceiling = max_total - total;
    needed.min(per_run_cap).min(remaining_ceiling)
}

/// Derive the next sequential name from the existing "{prefix}-{n}" names.
pub fn next_vm_name(prefix: &str, existing: &[String]) -> String {
    let lead = format!("{prefix}-");
    let max_seq = existing
        .iter()
        .filter_map(|name| name.strip_prefix(&lead))
        .filter_map(|suffix| suffix.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    format!("{prefix}-{}", max_seq + 1)
}

enum SlotOutcome {
    /// Row inserted (ready or still provisioning).
    Inserted,
    /// Both the primary and the single fallback provider failed.
    Failed,
}

/// Provision one slot: try the first provider in the chain, then exactly one
/// fallback. The chain is an ordered list; no provider variable is reassigned
/// mid-loop.
async fn provision_slot(
    db: &Pool<Postgres>,
    chain: &[Box<dyn CloudProvider>],
    name: &str,
    prebaked: bool,
) -> SlotOutcome {
    for (attempt, provider) in chain.iter().take(2).enumerate() {
        let start = std::time::Instant::now();
        let server_id = match provider.create_server(name).await {
            Ok(id) => id,
            Err(e) => {
                eprintln!(
                    "❌ [pool-monitor] create failed on {} for {} (attempt {}): {}",
                    provider.name(),
                    name,
                    attempt + 1,
                    e
                );
                continue;
            }
        };

        // Create succeeded: this slot belongs to this provider now, so a
        // wait failure must not spill into a second instance elsewhere.
        let (ip, region, instance_class, status) = match wait_for_server(provider.as_ref(), &server_id)
            .await
        {
            Ok(info) => {
                let status = if prebaked {
                    VmStatus::Ready
                } else {
                    VmStatus::Provisioning
                };
                (Some(info.ip), info.region, info.instance_class, status)
            }
            Err(ProviderError::Timeout { .. }) => {
                // Left provisioning without an IP; the cloud-init poller
                // fetches it or ages the row out after 30 minutes.
                eprintln!(
                    "⏱️  [pool-monitor] {} never reported an IP within the wait ceiling",
                    name
                );
                (None, None, None, VmStatus::Provisioning)
            }
            Err(e) => {
                eprintln!("⚠️  [pool-monitor] wait failed for {}: {}", name, e);
                (None, None, None, VmStatus::Provisioning)
            }
        };

        match registry::insert_vm(
            db,
            name,
            provider.name(),
            &server_id,
            ip.as_deref(),
            region.as_deref(),
            instance_class.as_deref(),
            status,
        )
        .await
        {
            Ok(vm_id) => {
                let dur = start.elapsed().as_millis() as i32;
                let log_id = logger::log_event_with_metadata(
                    db,
                    "VM_PROVISIONED",
                    "in_progress",
                    vm_id,
                    None,
                    Some(serde_json::json!({
                        "name": name,
                        "provider": provider.name(),
                        "provider_instance_id": server_id,
                        "ip": ip,
                        "status": status,
                        "fallback_used": attempt > 0,
                    })),
                )
                .await
                .ok();
                if let Some(lid) = log_id {
                    let _ = logger::log_event_complete(db, lid, "success", dur, None).await;
                }
                println!(
                    "✅ [pool-monitor] provisioned {} on {} ({:?})",
                    name,
                    provider.name(),
                    status
                );
                return SlotOutcome::Inserted;
            }
            Err(e) => {
                eprintln!("❌ [pool-monitor] registry insert failed for {}: {}", name, e);
                return SlotOutcome::Failed;
            }
        }
    }
    SlotOutcome::Failed
}

/// Maintain the minimum buffer of ready VMs under the hard cost ceiling.
pub async fn run(db: &Pool<Postgres>) -> PoolSummary {
    let min_pool = env_i64("FLEET_MIN_POOL_SIZE", 2);
    let per_run_cap = env_i64("FLEET_PROVISION_PER_RUN", 3);
    let max_total = env_i64("FLEET_MAX_TOTAL_VMS", 20);
    let prefix =
        std::env::var("FLEET_VM_NAME_PREFIX").unwrap_or_else(|_| "agentvm".to_string());
    let prebaked = env_flag("FLEET_PREBAKED_IMAGE");

    let total = registry::count_total(db).await.unwrap_or(0);
    let ready = registry::count_ready(db).await.unwrap_or(0);
    let needed = (min_pool - ready).max(0);

    let mut summary = PoolSummary {
        total,
        ready,
        needed,
        provisioned: 0,
        failed_slots: 0,
        cost_ceiling_hit: false,
    };

    // Hard cost ceiling: never exceed it, even with an empty pool.
    if total >= max_total {
        if needed > 0 {
            summary.cost_ceiling_hit = true;
            let msg = format!(
                "VM pool at cost ceiling: {total}/{max_total} VMs, {needed} more needed to reach min pool of {min_pool}"
            );
            eprintln!("🚨 [pool-monitor] {}", msg);
            let _ = logger::log_event(db, "POOL_COST_CEILING", "failed", Uuid::nil(), Some(&msg))
                .await;
            alerts::notify_operator(&msg).await;
        }
        return summary;
    }

    let to_provision = slots_to_provision(total, ready, min_pool, per_run_cap, max_total);
    if to_provision == 0 {
        return summary;
    }

    println!(
        "🏗️  [pool-monitor] ready={} min={} -> provisioning {} VM(s)",
        ready, min_pool, to_provision
    );

    let chain = fleet_providers::provider_chain();
    if chain.is_empty() {
        let msg = "pool monitor: no cloud provider credentials configured".to_string();
        eprintln!("🚨 [pool-monitor] {}", msg);
        alerts::notify_operator(&msg).await;
        summary.failed_slots = to_provision;
        return summary;
    }

    let mut names = registry::existing_names(db).await.unwrap_or_default();
    for _ in 0..to_provision {
        let name = next_vm_name(&prefix, &names);
        match provision_slot(db, &chain, &name, prebaked).await {
            SlotOutcome::Inserted => {
                summary.provisioned += 1;
                names.push(name);
            }
            SlotOutcome::Failed => summary.failed_slots += 1,
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_one_ready_of_two_provisions_exactly_one() {
        // 1 ready, min pool 2, per-run cap 3, ceiling 20, existing total 5.
        assert_eq!(slots_to_provision(5, 1, 2, 3, 20), 1);
    }

    #[test]
    fn ceiling_is_never_exceeded_even_when_pool_is_empty() {
        assert_eq!(slots_to_provision(20, 0, 5, 3, 20), 0);
        assert_eq!(slots_to_provision(25, 0, 5, 3, 20), 0);
        // One slot of headroom left: only one is provisioned.
        assert_eq!(slots_to_provision(19, 0, 5, 3, 20), 1);
    }

    #[test]
    fn per_run_cap_bounds_a_large_shortfall() {
        assert_eq!(slots_to_provision(0, 0, 10, 3, 20), 3);
    }

    #[test]
    fn full_pool_is_a_noop() {
        assert_eq!(slots_to_provision(5, 2, 2, 3, 20), 0);
        assert_eq!(slots_to_provision(5, 4, 2, 3, 20), 0);
    }

    #[test]
    fn names_continue_the_sequence() {
        let existing = vec![
            "agentvm-1".to_string(),
            "agentvm-7".to_string(),
            "agentvm-3".to_string(),
            "other-99".to_string(),
        ];
        assert_eq!(next_vm_name("agentvm", &existing), "agentvm-8");
    }

    #[test]
    fn names_start_at_one_on_an_empty_fleet() {
        assert_eq!(next_vm_name("agentvm", &[]), "agentvm-1");
    }

    #[test]
    fn malformed_suffixes_are_ignored() {
        let existing = vec!["agentvm-x".to_string(), "agentvm-2".to_string()];
        assert_eq!(next_vm_name("agentvm", &existing), "agentvm-3");
    }
}
