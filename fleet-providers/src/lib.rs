use async_trait::async_trait;
use std::time::Duration;

pub mod digitalocean;
pub mod hetzner;
pub mod mock;

pub use digitalocean::DigitalOceanProvider;
pub use hetzner::HetznerProvider;
pub use mock::MockProvider;

/// Fixed poll cadence while waiting for a fresh instance to report an IP.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Bounded ceiling for the IP wait; past this the slot raises a timeout.
pub const WAIT_CEILING: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} API error: {status} - {message}")]
    Api {
        provider: &'static str,
        status: u16,
        message: String,
    },

    #[error("{provider} request failed: {source}")]
    Http {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} credentials missing or empty")]
    MissingCredentials { provider: &'static str },

    /// Distinct from API failures: the instance exists but never reported
    /// an IP within the bounded wait window.
    #[error("{provider} instance {server_id} not ready after {elapsed_secs}s")]
    Timeout {
        provider: &'static str,
        server_id: String,
        elapsed_secs: u64,
    },
}

impl From<ProviderError> for fleet_common::Error {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Timeout { elapsed_secs, .. } => {
                fleet_common::Error::ProvisioningTimeout { elapsed_secs }
            }
            other => fleet_common::Error::Provider(other.to_string()),
        }
    }
}

/// Point-in-time view of a provider instance.
#[derive(Debug, Clone)]
pub struct ServerState {
    pub ip: Option<String>,
    pub region: Option<String>,
    pub instance_class: Option<String>,
    pub running: bool,
}

/// Result of a successful create + wait cycle.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub ip: String,
    pub region: Option<String>,
    pub instance_class: Option<String>,
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create an instance and return the provider-assigned id.
    async fn create_server(&self, name: &str) -> Result<String, ProviderError>;

    /// Fetch the current state of an instance.
    async fn get_server(&self, server_id: &str) -> Result<ServerState, ProviderError>;
}

/// Poll `get_server` on a fixed interval until the instance has a public IP,
/// up to the bounded ceiling.
pub async fn wait_for_server(
    provider: &dyn CloudProvider,
    server_id: &str,
) -> Result<ServerInfo, ProviderError> {
    wait_for_server_with(provider, server_id, WAIT_POLL_INTERVAL, WAIT_CEILING).await
}

pub async fn wait_for_server_with(
    provider: &dyn CloudProvider,
    server_id: &str,
    poll_interval: Duration,
    ceiling: Duration,
) -> Result<ServerInfo, ProviderError> {
    let started = std::time::Instant::now();
    loop {
        let state = provider.get_server(server_id).await?;
        if let Some(ip) = state.ip.filter(|ip| !ip.trim().is_empty()) {
            return Ok(ServerInfo {
                ip,
                region: state.region,
                instance_class: state.instance_class,
            });
        }
        if started.elapsed() >= ceiling {
            return Err(ProviderError::Timeout {
                provider: provider.name(),
                server_id: server_id.to_string(),
                elapsed_secs: started.elapsed().as_secs(),
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Read a secret from `VAR`, falling back to the file named by `VAR_FILE`
/// (Docker/K8s friendly, same convention as the rest of the platform).
pub fn env_or_file(var: &str) -> Option<String> {
    if let Ok(v) = std::env::var(var) {
        let v = v.trim().to_string();
        if !v.is_empty() {
            return Some(v);
        }
    }
    let path = std::env::var(format!("{var}_FILE")).ok()?;
    let contents = std::fs::read_to_string(path.trim()).ok()?;
    let contents = contents.trim().to_string();
    if contents.is_empty() {
        None
    } else {
        Some(contents)
    }
}

/// Build a provider by name, returning None when its credentials are absent.
pub fn get_provider(name: &str) -> Option<Box<dyn CloudProvider>> {
    match name.trim().to_lowercase().as_str() {
        "hetzner" => HetznerProvider::from_env().map(|p| Box::new(p) as Box<dyn CloudProvider>),
        "digitalocean" | "do" => {
            DigitalOceanProvider::from_env().map(|p| Box::new(p) as Box<dyn CloudProvider>)
        }
        "mock" => Some(Box::new(MockProvider::new())),
        _ => None,
    }
}

/// Ordered list of configured providers, first entry preferred. The pool
/// monitor walks this list: primary first, then exactly one fallback.
pub fn provider_chain() -> Vec<Box<dyn CloudProvider>> {
    let order = std::env::var("FLEET_PROVIDER_ORDER")
        .unwrap_or_else(|_| "hetzner,digitalocean".to_string());
    order
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(get_provider)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_info_once_ip_is_up() {
        let provider = MockProvider::new();
        let id = provider.create_server("agentvm-1").await.unwrap();
        let info = wait_for_server_with(
            &provider,
            &id,
            Duration::from_millis(5),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        assert!(info.ip.starts_with("10."));
        assert_eq!(info.instance_class.as_deref(), Some("mock-2vcpu"));
    }

    #[tokio::test]
    async fn wait_times_out_without_ip() {
        let provider = MockProvider::never_ready();
        let id = provider.create_server("agentvm-1").await.unwrap();
        let err = wait_for_server_with(
            &provider,
            &id,
            Duration::from_millis(5),
            Duration::from_millis(30),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { .. }));
        // The timeout maps onto the distinct provisioning-timeout error.
        let mapped: fleet_common::Error = err.into();
        assert!(matches!(
            mapped,
            fleet_common::Error::ProvisioningTimeout { .. }
        ));
    }

    #[tokio::test]
    async fn failing_mock_surfaces_api_error() {
        let provider = MockProvider::failing();
        let err = provider.create_server("agentvm-1").await.unwrap_err();
        assert!(matches!(err, ProviderError::Api { .. }));
    }

    #[test]
    fn unknown_provider_name_yields_none() {
        assert!(get_provider("ovh").is_none());
    }
}
