use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "vm_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Provisioning, // Instance created at the provider, cloud-init still running
    Ready,        // First-boot customization done, waiting in the pool
    Assigned,     // Claimed by a customer
    Failed,       // Never came up (cloud-init age ceiling exceeded)
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "vm_health", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Configuring,
    Healthy,
    ConfigureFailed,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "api_mode", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ApiMode {
    /// Customer supplies their own upstream key; it is written to the VM.
    Byok,
    /// Calls are routed through the platform metering proxy; the VM only
    /// ever sees a locally generated token.
    Proxied,
}

// --- Entities (SQLx mapped) ---

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Vm {
    pub id: Uuid,
    pub name: String,
    pub provider: String,
    pub provider_instance_id: Option<String>,
    pub ip_address: Option<String>,
    pub region: Option<String>,
    pub instance_class: Option<String>,
    pub ssh_port: i32,
    pub ssh_user: String,
    pub status: VmStatus,
    pub health_status: HealthStatus,
    pub assigned_to: Option<Uuid>,
    pub configure_attempts: i32,
    pub tier: Option<String>,
    pub api_mode: Option<ApiMode>,
    pub channels: Option<serde_json::Value>,
    pub gateway_url: Option<String>,
    pub gateway_token: Option<String>,
    pub control_url: Option<String>,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// A single messaging-channel integration to configure on a VM.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChannelConfig {
    pub kind: String, // telegram | discord | slack
    pub token: String,
}

/// Staging record written by the purchase flow, consumed by the configurator.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct PendingConfig {
    pub customer_id: Uuid,
    pub api_mode: ApiMode,
    pub api_key: Option<String>,
    pub tier: String,
    pub model: String,
    pub channels: serde_json::Value,
    pub search_key: Option<String>,
    pub seed_memory: Option<String>,
    pub system_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PendingConfig {
    pub fn channel_list(&self) -> Vec<ChannelConfig> {
        serde_json::from_value(self.channels.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Backup {
    pub id: Uuid,
    pub vm_id: Uuid,
    pub storage_path: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

// --- Error taxonomy ---

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("provider error: {0}")]
    Provider(String),

    /// Instance never reported an IP within the bounded wait window.
    #[error("provisioning timed out after {elapsed_secs}s")]
    ProvisioningTimeout { elapsed_secs: u64 },

    /// Remote procedure exited abnormally or the success marker was absent.
    #[error("configuration failed: {0}")]
    Configuration(String),

    /// Unsafe or malformed input to remote scripting; rejected before any
    /// shell call is made.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Too many configure attempts in the rolling window.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimit { retry_after_secs: i64 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serde_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&VmStatus::Provisioning).unwrap(),
            "\"provisioning\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::ConfigureFailed).unwrap(),
            "\"configure_failed\""
        );
        assert_eq!(serde_json::to_string(&ApiMode::Byok).unwrap(), "\"byok\"");
    }

    #[test]
    fn pending_config_parses_channel_list() {
        let pending = PendingConfig {
            customer_id: Uuid::new_v4(),
            api_mode: ApiMode::Proxied,
            api_key: None,
            tier: "pro".to_string(),
            model: "sonnet-4".to_string(),
            channels: serde_json::json!([
                {"kind": "telegram", "token": "123:abc"},
                {"kind": "discord", "token": "xyz"}
            ]),
            search_key: None,
            seed_memory: None,
            system_prompt: None,
            created_at: Utc::now(),
        };
        let list = pending.channel_list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].kind, "telegram");
    }

    #[test]
    fn rate_limit_error_carries_retry_after() {
        let e = Error::RateLimit {
            retry_after_secs: 42,
        };
        assert!(e.to_string().contains("42"));
    }
}
