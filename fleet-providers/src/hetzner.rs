use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

use crate::{env_or_file, CloudProvider, ProviderError, ServerState};

const API_BASE: &str = "https://api.hetzner.cloud/v1";

pub struct HetznerProvider {
    client: Client,
    token: String,
    server_type: String,
    image: String,
    location: String,
    ssh_key: Option<String>,
}

impl HetznerProvider {
    pub fn new(token: String) -> Self {
        // No default reqwest timeout; a stalled provider API would hang the
        // pool monitor forever without these.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .expect("reqwest client");
        Self {
            client,
            token: token.trim().to_string(),
            server_type: std::env::var("HETZNER_SERVER_TYPE")
                .unwrap_or_else(|_| "cpx21".to_string()),
            image: std::env::var("HETZNER_IMAGE").unwrap_or_else(|_| "ubuntu-22.04".to_string()),
            location: std::env::var("HETZNER_LOCATION").unwrap_or_else(|_| "fsn1".to_string()),
            ssh_key: std::env::var("HETZNER_SSH_KEY_NAME")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn from_env() -> Option<Self> {
        env_or_file("HETZNER_API_TOKEN").map(Self::new)
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.token)
    }
}

#[async_trait]
impl CloudProvider for HetznerProvider {
    fn name(&self) -> &'static str {
        "hetzner"
    }

    async fn create_server(&self, name: &str) -> Result<String, ProviderError> {
        let url = format!("{API_BASE}/servers");
        let mut body = json!({
            "name": name,
            "server_type": self.server_type,
            "image": self.image,
            "location": self.location,
            "labels": {"managed-by": "fleet"},
        });
        if let Some(key) = &self.ssh_key {
            body["ssh_keys"] = json!([key]);
        }

        let resp = self
            .auth(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|source| ProviderError::Http {
                provider: self.name(),
                source,
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                provider: self.name(),
                status,
                message,
            });
        }

        let v: serde_json::Value = resp.json().await.map_err(|source| ProviderError::Http {
            provider: self.name(),
            source,
        })?;
        let id = v["server"]["id"].as_i64().ok_or_else(|| ProviderError::Api {
            provider: self.name(),
            status: 200,
            message: "create response missing server.id".to_string(),
        })?;
        Ok(id.to_string())
    }

    async fn get_server(&self, server_id: &str) -> Result<ServerState, ProviderError> {
        let url = format!("{API_BASE}/servers/{server_id}");
        let resp = self
            .auth(self.client.get(&url))
            .send()
            .await
            .map_err(|source| ProviderError::Http {
                provider: self.name(),
                source,
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                provider: self.name(),
                status,
                message,
            });
        }

        let v: serde_json::Value = resp.json().await.map_err(|source| ProviderError::Http {
            provider: self.name(),
            source,
        })?;
        let server = &v["server"];
        Ok(ServerState {
            ip: server["public_net"]["ipv4"]["ip"]
                .as_str()
                .map(|s| s.to_string()),
            region: server["datacenter"]["location"]["name"]
                .as_str()
                .map(|s| s.to_string()),
            instance_class: server["server_type"]["name"].as_str().map(|s| s.to_string()),
            running: server["status"].as_str() == Some("running"),
        })
    }
}
