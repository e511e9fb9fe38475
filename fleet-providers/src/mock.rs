use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::{CloudProvider, ProviderError, ServerState};

/// In-memory provider for tests and local bringup. Instances get a
/// deterministic 10.x address immediately unless `never_ready` is set.
pub struct MockProvider {
    servers: Mutex<HashMap<String, ServerState>>,
    counter: AtomicU32,
    fail_creates: bool,
    never_ready: bool,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            counter: AtomicU32::new(0),
            fail_creates: false,
            never_ready: false,
        }
    }

    /// Every create fails, for exercising the fallback path.
    pub fn failing() -> Self {
        Self {
            fail_creates: true,
            ..Self::new()
        }
    }

    /// Instances never report an IP, for exercising the wait ceiling.
    pub fn never_ready() -> Self {
        Self {
            never_ready: true,
            ..Self::new()
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_server(&self, _name: &str) -> Result<String, ProviderError> {
        if self.fail_creates {
            return Err(ProviderError::Api {
                provider: self.name(),
                status: 500,
                message: "mock create failure".to_string(),
            });
        }
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock-{}", uuid::Uuid::new_v4());
        let ip = if self.never_ready {
            None
        } else {
            Some(format!("10.{}.{}.{}", 10, (seq / 250) % 250, (seq % 250) + 1))
        };
        self.servers.lock().expect("mock lock").insert(
            id.clone(),
            ServerState {
                ip,
                region: Some("mock-1".to_string()),
                instance_class: Some("mock-2vcpu".to_string()),
                running: true,
            },
        );
        Ok(id)
    }

    async fn get_server(&self, server_id: &str) -> Result<ServerState, ProviderError> {
        self.servers
            .lock()
            .expect("mock lock")
            .get(server_id)
            .cloned()
            .ok_or_else(|| ProviderError::Api {
                provider: self.name(),
                status: 404,
                message: format!("mock server {server_id} not found"),
            })
    }
}
