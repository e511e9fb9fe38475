pub mod channels;
pub mod dns;
pub mod scripts;
pub mod shell_arg;

use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_common::{ApiMode, Error, PendingConfig, Vm};
use serde::Serialize;
use sqlx::{Pool, Postgres};

use crate::{logger, registry, shell};
use scripts::{CONTROL_PORT, DONE_MARKER, GATEWAY_PORT};
use shell_arg::{OpaquePayload, ShellArg};

/// Rolling rate-limit window for configure attempts on one VM.
pub const WINDOW_SECS: i64 = 600;
pub const MAX_ATTEMPTS_PER_WINDOW: usize = 3;

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(120);
const PAIRING_POLL_TRIES: u32 = 10;
const PAIRING_POLL_DELAY: Duration = Duration::from_secs(2);
const PROBE_TRIES: u32 = 3;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_SYSTEM_PROMPT: &str = include_str!("default_system_prompt.md");
const DEFAULT_HEARTBEAT: &str = "\
# Heartbeat tasks

- Check each connected channel for unread messages and respond.
- Review MEMORY.md and prune anything stale.
- Report anything requiring operator attention.
";

#[derive(Debug, Serialize)]
pub struct ConfigureOutcome {
    pub configured: bool,
    pub healthy: bool,
}

/// Seconds until the next configure attempt is allowed, or None when under
/// the limit. `attempts` holds in-window timestamps in ascending order; the
/// slot frees when the oldest one ages out.
pub fn retry_after_secs(attempts: &[DateTime<Utc>], now: DateTime<Utc>) -> Option<i64> {
    if attempts.len() < MAX_ATTEMPTS_PER_WINDOW {
        return None;
    }
    let oldest = attempts[attempts.len() - MAX_ATTEMPTS_PER_WINDOW];
    let free_at = oldest + chrono::Duration::seconds(WINDOW_SECS);
    Some((free_at - now).num_seconds().max(1))
}

/// Endpoint URL the customer gets: TLS hostname when the whole DNS+TLS step
/// succeeded, plain http against the IP otherwise.
pub fn gateway_url_for(tls_ok: bool, hostname: Option<&str>, ip: &str) -> String {
    match (tls_ok, hostname) {
        (true, Some(host)) => format!("https://{host}"),
        _ => format!("http://{}:{}", shell::clean_ip(ip), GATEWAY_PORT),
    }
}

struct Endpoints {
    gateway_url: String,
    gateway_token: String,
    phases: Vec<String>,
}

/// Full configure run for one assigned VM. Failures inside the remote
/// procedure come back as `configured: false` with the VM marked
/// configure_failed; only the rate limiter rejects with an Err.
pub async fn run(
    db: &Pool<Postgres>,
    vm: &Vm,
    pending: &PendingConfig,
) -> Result<ConfigureOutcome, Error> {
    // The reservation is a single conditional INSERT; overlapping calls
    // cannot both slip under the window limit.
    let reserved = registry::try_record_configure_attempt(
        db,
        vm.id,
        WINDOW_SECS,
        MAX_ATTEMPTS_PER_WINDOW as i64,
    )
    .await?;
    if !reserved {
        let attempts = registry::recent_configure_attempts(db, vm.id, WINDOW_SECS).await?;
        let retry_after = retry_after_secs(&attempts, Utc::now()).unwrap_or(1);
        return Err(Error::RateLimit {
            retry_after_secs: retry_after,
        });
    }
    registry::begin_configuring(db, vm.id).await?;

    let start = std::time::Instant::now();
    let log_id = logger::log_event_with_metadata(
        db,
        "VM_CONFIGURE",
        "in_progress",
        vm.id,
        None,
        Some(serde_json::json!({
            "customer_id": pending.customer_id,
            "api_mode": pending.api_mode,
            "model": pending.model,
        })),
    )
    .await
    .ok();

    println!("🔧 [configure] starting run for {} ({})", vm.name, vm.id);

    match do_configure(db, vm, pending).await {
        Ok(endpoints) => {
            registry::mark_configure_succeeded(db, vm.id).await?;
            registry::delete_pending_config(db, pending.customer_id).await?;

            // Bounded synchronous probe so success can report healthy
            // immediately; the health monitor picks up whatever misses it.
            let healthy = probe_gateway(&endpoints.gateway_url, &endpoints.gateway_token).await;
            if healthy {
                let _ = registry::configuring_to_healthy(db, vm.id, "post-configure probe passed")
                    .await;
            }

            let dur = start.elapsed().as_millis() as i32;
            if let Some(lid) = log_id {
                let _ = logger::log_event_complete_with_metadata(
                    db,
                    lid,
                    "success",
                    dur,
                    None,
                    Some(serde_json::json!({ "phases": endpoints.phases })),
                )
                .await;
            }
            println!(
                "✅ [configure] {} configured (healthy={}) in {}ms",
                vm.name, healthy, dur
            );
            Ok(ConfigureOutcome {
                configured: true,
                healthy,
            })
        }
        Err(e) => {
            let msg = e.to_string();
            eprintln!("❌ [configure] {} failed: {}", vm.name, msg);
            let _ = registry::mark_configure_failed(db, vm.id, &msg).await;

            // Terminal after the attempt ceiling: a human takes over.
            if let Ok(Some(failed)) = registry::fetch_vm(db, vm.id).await {
                if failed.configure_attempts >= MAX_ATTEMPTS_PER_WINDOW as i32 {
                    crate::alerts::notify_operator(&format!(
                        "VM {} hit {} configure attempts, last error: {}",
                        vm.name, failed.configure_attempts, msg
                    ))
                    .await;
                }
            }
            let dur = start.elapsed().as_millis() as i32;
            if let Some(lid) = log_id {
                let _ = logger::log_event_complete(db, lid, "failed", dur, Some(&msg)).await;
            }
            Ok(ConfigureOutcome {
                configured: false,
                healthy: false,
            })
        }
    }
}

async fn do_configure(
    db: &Pool<Postgres>,
    vm: &Vm,
    pending: &PendingConfig,
) -> Result<Endpoints, Error> {
    let ip = vm
        .ip_address
        .as_deref()
        .ok_or_else(|| Error::Configuration("vm has no ip address".to_string()))?;
    let target = shell::SshTarget::new(ip, vm.ssh_port, &vm.ssh_user);

    // Validate every interpolated value up front; nothing touches the shell
    // until all of them pass.
    let model = ShellArg::new(pending.model.clone())?;
    let gateway_token = ShellArg::new(scripts::mint_token("gw_"))?;
    let upstream_key = match pending.api_mode {
        ApiMode::Byok => {
            let key = pending
                .api_key
                .as_deref()
                .ok_or_else(|| Error::Validation("byok mode requires an api key".to_string()))?;
            ShellArg::new(key)?
        }
        ApiMode::Proxied => ShellArg::new(scripts::mint_token("fgw_"))?,
    };
    let search_key = pending
        .search_key
        .as_deref()
        .map(ShellArg::new)
        .transpose()?;
    let proxy_url = match pending.api_mode {
        ApiMode::Proxied => {
            let url = std::env::var("FLEET_PROXY_URL").map_err(|_| {
                Error::Configuration("FLEET_PROXY_URL not set for proxied mode".to_string())
            })?;
            Some(ShellArg::new(url)?)
        }
        ApiMode::Byok => None,
    };
    let channel_list = pending.channel_list();
    let mut channel_args = Vec::with_capacity(channel_list.len());
    for channel in &channel_list {
        let plugin = channels::plugin_for(&channel.kind).ok_or_else(|| {
            Error::Validation(format!("unknown channel kind {:?}", channel.kind))
        })?;
        channel_args.push((
            ShellArg::new(channel.kind.clone())?,
            ShellArg::new(plugin)?,
            ShellArg::new(channel.token.clone())?,
        ));
    }

    // Platform-side validation: a token the channel rejects fails the run
    // before anything is written to the VM.
    for channel in &channel_list {
        channels::validate_channel(channel).await?;
    }

    let mut phases: Vec<String> = Vec::new();

    let out = exec_step(&target, &scripts::stop_runtime_script(), "stop_runtime").await?;
    phases.extend(shell::extract_phases(&out));
    let out = exec_step(
        &target,
        &scripts::onboard_script(pending.api_mode, &upstream_key, &gateway_token),
        "onboard",
    )
    .await?;
    phases.extend(shell::extract_phases(&out));
    for (kind, plugin, token) in &channel_args {
        let out = exec_step(
            &target,
            &scripts::channel_script(kind, plugin, token),
            "channel",
        )
        .await?;
        phases.extend(shell::extract_phases(&out));
    }
    if let Some(proxy_url) = &proxy_url {
        let out = exec_step(
            &target,
            &scripts::proxy_base_url_script(proxy_url),
            "proxy_base_url",
        )
        .await?;
        phases.extend(shell::extract_phases(&out));
    }

    let heartbeat_secs = std::env::var("FLEET_HEARTBEAT_SECS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(1800);
    let out = exec_step(
        &target,
        &scripts::model_script(&model, heartbeat_secs, search_key.as_ref()),
        "model",
    )
    .await?;
    phases.extend(shell::extract_phases(&out));

    let heartbeat = OpaquePayload::new(DEFAULT_HEARTBEAT);
    let prompt = OpaquePayload::new(
        pending
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT),
    );
    let seed_memory = pending.seed_memory.as_deref().map(OpaquePayload::new);
    let out = exec_step(
        &target,
        &scripts::workspace_script(&heartbeat, &prompt, seed_memory.as_ref()),
        "workspace",
    )
    .await?;
    phases.extend(shell::extract_phases(&out));

    let out = exec_step(&target, &scripts::start_runtime_script(), "start_runtime").await?;
    phases.extend(shell::extract_phases(&out));
    if !out.contains(DONE_MARKER) {
        return Err(Error::Configuration(
            "runtime start completed without success marker".to_string(),
        ));
    }

    approve_pairing(&target, &mut phases).await?;

    // DNS + TLS: a failure here downgrades the endpoint, never the run.
    let hostname = dns::vm_hostname(&vm.name);
    let tls_ok = match &hostname {
        Some(host) => match provision_tls(&target, host, ip).await {
            Ok(()) => true,
            Err(e) => {
                let msg = format!("tls provisioning failed for {host}: {e}");
                eprintln!("🚨 [configure] {}", msg);
                let _ = logger::log_event(db, "CONFIGURE_TLS", "failed", vm.id, Some(&msg)).await;
                false
            }
        },
        None => false,
    };
    let gateway_url = gateway_url_for(tls_ok, hostname.as_deref(), ip);
    let control_url = format!("http://{}:{}", shell::clean_ip(ip), CONTROL_PORT);

    // Endpoints land in the registry before the caller-visible probe phase,
    // so a caller timeout there cannot lose them.
    registry::record_endpoints(
        db,
        vm.id,
        &gateway_url,
        &control_url,
        gateway_token.as_str(),
        model.as_str(),
        &pending.tier,
        pending.api_mode,
        &pending.channels,
    )
    .await?;

    Ok(Endpoints {
        gateway_url,
        gateway_token: gateway_token.as_str().to_string(),
        phases,
    })
}

/// Run one remote script, mapping any abnormal exit to a ConfigurationError
/// carrying the tail of stderr.
async fn exec_step(
    target: &shell::SshTarget,
    script: &str,
    step: &str,
) -> Result<String, Error> {
    let output = shell::run_script(target, script, SCRIPT_TIMEOUT)
        .await
        .map_err(|e| Error::Configuration(format!("{step}: {e}")))?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Configuration(format!(
            "{step} exited with {:?}: {}",
            output.status.code(),
            shell::tail_str(stderr.trim(), 400)
        )));
    }
    Ok(stdout)
}

/// First-run pairing: poll for the request, approve it, restart. The control
/// plane refuses commands until this has happened.
async fn approve_pairing(
    target: &shell::SshTarget,
    phases: &mut Vec<String>,
) -> Result<(), Error> {
    for _ in 0..PAIRING_POLL_TRIES {
        let out = exec_step(target, &scripts::pairing_list_script(), "pairing_list").await?;
        let ids = scripts::extract_pairing_ids(&out);
        if let Some(id) = ids.first() {
            let request_id = ShellArg::new(id.clone())?;
            let out = exec_step(
                target,
                &scripts::pairing_approve_script(&request_id),
                "pairing_approve",
            )
            .await?;
            phases.extend(shell::extract_phases(&out));
            let out =
                exec_step(target, &scripts::restart_runtime_script(), "restart_runtime").await?;
            phases.extend(shell::extract_phases(&out));
            return Ok(());
        }
        tokio::time::sleep(PAIRING_POLL_DELAY).await;
    }
    Err(Error::Configuration(
        "no device-pairing request appeared".to_string(),
    ))
}

async fn provision_tls(
    target: &shell::SshTarget,
    hostname: &str,
    ip: &str,
) -> Result<(), Error> {
    dns::ensure_dns_record(hostname, shell::clean_ip(ip)).await?;
    let host_arg = ShellArg::new(hostname)?;
    exec_step(target, &scripts::caddy_tls_script(&host_arg), "tls").await?;
    Ok(())
}

/// Bounded local liveness phase; misses are left to the health monitor.
async fn probe_gateway(gateway_url: &str, token: &str) -> bool {
    let client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .timeout(PROBE_TIMEOUT)
        .danger_accept_invalid_certs(gateway_url.starts_with("https"))
        .build()
    {
        Ok(c) => c,
        Err(_) => return false,
    };
    let url = format!("{}/healthz", gateway_url.trim_end_matches('/'));
    for attempt in 0..PROBE_TRIES {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        match client.get(&url).bearer_auth(token).send().await {
            Ok(resp) if resp.status().is_success() => return true,
            _ => continue,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn under_three_attempts_is_not_limited() {
        let now = Utc::now();
        let attempts = vec![now - ChronoDuration::seconds(300), now - ChronoDuration::seconds(60)];
        assert_eq!(retry_after_secs(&attempts, now), None);
        assert_eq!(retry_after_secs(&[], now), None);
    }

    #[test]
    fn fourth_attempt_within_window_is_rejected_with_positive_retry_after() {
        // One failure, then two manual retries inside ten minutes.
        let now = Utc::now();
        let attempts = vec![
            now - ChronoDuration::seconds(540),
            now - ChronoDuration::seconds(240),
            now - ChronoDuration::seconds(30),
        ];
        let retry = retry_after_secs(&attempts, now).unwrap();
        assert!(retry > 0);
        // The oldest attempt ages out after 600s, so 60s remain.
        assert!((55..=60).contains(&retry), "retry was {retry}");
    }

    #[test]
    fn limit_clears_once_the_oldest_attempt_ages_out() {
        let now = Utc::now();
        let attempts = vec![
            now - ChronoDuration::seconds(240),
            now - ChronoDuration::seconds(30),
        ];
        // The attempt from 11 minutes ago is already outside the window and
        // would not be returned by the query at all.
        assert_eq!(retry_after_secs(&attempts, now), None);
    }

    #[test]
    fn tls_failure_falls_back_to_plain_http_endpoint() {
        let url = gateway_url_for(false, Some("agentvm-3.fleet.example.com"), "203.0.113.9/32");
        assert_eq!(url, "http://203.0.113.9:8787");
        let url = gateway_url_for(true, Some("agentvm-3.fleet.example.com"), "203.0.113.9");
        assert_eq!(url, "https://agentvm-3.fleet.example.com");
    }

    #[test]
    fn no_domain_means_plain_http() {
        assert_eq!(
            gateway_url_for(false, None, "10.0.0.4"),
            "http://10.0.0.4:8787"
        );
    }
}
