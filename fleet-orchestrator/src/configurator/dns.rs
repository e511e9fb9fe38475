use fleet_common::Error;
use std::time::Duration;

/// Per-VM hostname under the fleet domain, or None when no domain is set
/// (local/dev installs run plain http against the IP).
pub fn vm_hostname(vm_name: &str) -> Option<String> {
    let domain = std::env::var("FLEET_DOMAIN").ok()?;
    let domain = domain.trim().trim_matches('.');
    if domain.is_empty() {
        return None;
    }
    Some(format!("{vm_name}.{domain}"))
}

/// Create the A record for a VM via the Cloudflare API. An "already exists"
/// response is a success, the record points where we want it on re-runs.
pub async fn ensure_dns_record(hostname: &str, ip: &str) -> Result<(), Error> {
    let token = std::env::var("CLOUDFLARE_API_TOKEN")
        .map_err(|_| Error::Configuration("CLOUDFLARE_API_TOKEN not set".to_string()))?;
    let zone_id = std::env::var("CLOUDFLARE_ZONE_ID")
        .map_err(|_| Error::Configuration("CLOUDFLARE_ZONE_ID not set".to_string()))?;

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|e| Error::Configuration(format!("http client build failed: {e}")))?;

    let resp = client
        .post(format!(
            "https://api.cloudflare.com/client/v4/zones/{zone_id}/dns_records"
        ))
        .bearer_auth(&token)
        .json(&serde_json::json!({
            "type": "A",
            "name": hostname,
            "content": ip,
            "ttl": 120,
            "proxied": false,
        }))
        .send()
        .await
        .map_err(|e| Error::Configuration(format!("cloudflare request failed: {e}")))?;

    let status = resp.status();
    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    if status.is_success() && body["success"].as_bool() == Some(true) {
        return Ok(());
    }

    // 81057 / 81058: identical record already exists.
    let already_exists = body["errors"]
        .as_array()
        .map(|errs| {
            errs.iter().any(|e| {
                matches!(e["code"].as_i64(), Some(81057) | Some(81058))
            })
        })
        .unwrap_or(false);
    if already_exists {
        return Ok(());
    }

    Err(Error::Configuration(format!(
        "cloudflare dns record create failed (status {status}): {}",
        serde_json::to_string(&body["errors"]).unwrap_or_default()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_requires_a_domain() {
        std::env::remove_var("FLEET_DOMAIN");
        assert_eq!(vm_hostname("agentvm-3"), None);
        std::env::set_var("FLEET_DOMAIN", "fleet.example.com");
        assert_eq!(
            vm_hostname("agentvm-3").as_deref(),
            Some("agentvm-3.fleet.example.com")
        );
        std::env::remove_var("FLEET_DOMAIN");
    }
}
