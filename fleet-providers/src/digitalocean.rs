use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

use crate::{env_or_file, CloudProvider, ProviderError, ServerState};

const API_BASE: &str = "https://api.digitalocean.com/v2";

pub struct DigitalOceanProvider {
    client: Client,
    token: String,
    region: String,
    size: String,
    image: String,
    ssh_key: Option<String>,
}

impl DigitalOceanProvider {
    pub fn new(token: String) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .expect("reqwest client");
        Self {
            client,
            token: token.trim().to_string(),
            region: std::env::var("DO_REGION").unwrap_or_else(|_| "nyc3".to_string()),
            size: std::env::var("DO_SIZE").unwrap_or_else(|_| "s-2vcpu-4gb".to_string()),
            image: std::env::var("DO_IMAGE").unwrap_or_else(|_| "ubuntu-22-04-x64".to_string()),
            ssh_key: std::env::var("DO_SSH_KEY_ID")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn from_env() -> Option<Self> {
        env_or_file("DO_API_TOKEN").map(Self::new)
    }
}

#[async_trait]
impl CloudProvider for DigitalOceanProvider {
    fn name(&self) -> &'static str {
        "digitalocean"
    }

    async fn create_server(&self, name: &str) -> Result<String, ProviderError> {
        let url = format!("{API_BASE}/droplets");
        let mut body = json!({
            "name": name,
            "region": self.region,
            "size": self.size,
            "image": self.image,
            "tags": ["fleet"],
        });
        if let Some(key) = &self.ssh_key {
            body["ssh_keys"] = json!([key]);
        }

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
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
        let id = v["droplet"]["id"]
            .as_i64()
            .ok_or_else(|| ProviderError::Api {
                provider: self.name(),
                status: 200,
                message: "create response missing droplet.id".to_string(),
            })?;
        Ok(id.to_string())
    }

    async fn get_server(&self, server_id: &str) -> Result<ServerState, ProviderError> {
        let url = format!("{API_BASE}/droplets/{server_id}");
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
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
        let droplet = &v["droplet"];

        // Droplets list every interface; the public v4 entry carries the IP
        // we hand to the registry.
        let ip = droplet["networks"]["v4"]
            .as_array()
            .and_then(|nets| {
                nets.iter()
                    .find(|n| n["type"].as_str() == Some("public"))
                    .and_then(|n| n["ip_address"].as_str())
            })
            .map(|s| s.to_string());

        Ok(ServerState {
            ip,
            region: droplet["region"]["slug"].as_str().map(|s| s.to_string()),
            instance_class: droplet["size_slug"].as_str().map(|s| s.to_string()),
            running: droplet["status"].as_str() == Some("active"),
        })
    }
}
