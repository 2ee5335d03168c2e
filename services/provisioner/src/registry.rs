//! Agent settings registry.
//!
//! The registry is where an agent reads its bootstrap settings after boot.
//! The provisioner writes them at VM creation and keeps the disk and network
//! sections current as disks are attached and networks change.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{CloudError, Result};
use crate::launch::NetworkSpecs;

/// Ephemeral disk device name on every instance.
pub const EPHEMERAL_DEVICE: &str = "/dev/sdb";

const RESERVED_KEYS: &[&str] = &["vm", "agent_id", "networks", "disks", "env"];

/// Settings an agent reads at boot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub vm: VmSettings,
    pub agent_id: String,

    #[serde(default)]
    pub networks: NetworkSpecs,
    pub disks: DiskSettings,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Value>,

    /// Deployment-wide agent properties (ntp, mbus, blobstore, ...).
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSettings {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSettings {
    pub system: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<String>,

    /// Volume id to device name.
    #[serde(default)]
    pub persistent: BTreeMap<String, String>,
}

impl AgentSettings {
    /// Settings for a freshly created VM.
    ///
    /// Properties named like one of the generated sections are ignored.
    pub fn initial(
        agent_id: &str,
        root_device_name: &str,
        networks: NetworkSpecs,
        env: Option<Value>,
        properties: &Map<String, Value>,
    ) -> Self {
        let properties = properties
            .iter()
            .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Self {
            vm: VmSettings {
                name: format!("vm-{}", Uuid::new_v4()),
            },
            agent_id: agent_id.to_string(),
            networks,
            disks: DiskSettings {
                system: root_device_name.to_string(),
                ephemeral: Some(EPHEMERAL_DEVICE.to_string()),
                persistent: BTreeMap::new(),
            },
            env,
            properties,
        }
    }
}

/// Settings storage keyed by instance id.
#[async_trait]
pub trait SettingsRegistry: Send + Sync {
    /// Endpoint agents use to reach this registry. Embedded in user data.
    fn endpoint(&self) -> &str;

    async fn read_settings(&self, instance_id: &str) -> Result<AgentSettings>;

    async fn update_settings(&self, instance_id: &str, settings: &AgentSettings) -> Result<()>;

    async fn delete_settings(&self, instance_id: &str) -> Result<()>;
}

/// HTTP registry client.
pub struct RegistryClient {
    client: reqwest::Client,
    endpoint: String,
    user: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct SettingsResponse {
    status: String,

    /// Settings JSON, encoded as a string.
    settings: String,
}

impl RegistryClient {
    pub fn new(endpoint: &str, user: &str, password: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| CloudError::Registry(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    fn settings_url(&self, instance_id: &str) -> String {
        format!("{}/instances/{}/settings", self.endpoint, instance_id)
    }

    async fn check(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, "Registry request failed");
        Err(CloudError::Registry(format!(
            "cannot {action}, got HTTP {status}: {body}"
        )))
    }
}

fn transport(action: &str, err: reqwest::Error) -> CloudError {
    CloudError::Registry(format!("cannot {action}: {err}"))
}

#[async_trait]
impl SettingsRegistry for RegistryClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn read_settings(&self, instance_id: &str) -> Result<AgentSettings> {
        let action = format!("read settings for `{instance_id}'");
        let url = self.settings_url(instance_id);
        debug!(url = %url, "Reading agent settings");

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|err| transport(&action, err))?;
        let response = Self::check(response, &action).await?;

        let body: SettingsResponse = response
            .json()
            .await
            .map_err(|err| transport(&action, err))?;
        if body.status != "ok" {
            return Err(CloudError::Registry(format!(
                "invalid registry response for `{instance_id}': status {}",
                body.status
            )));
        }

        serde_json::from_str(&body.settings).map_err(|err| {
            CloudError::Registry(format!("invalid settings for `{instance_id}': {err}"))
        })
    }

    async fn update_settings(&self, instance_id: &str, settings: &AgentSettings) -> Result<()> {
        let action = format!("update settings for `{instance_id}'");
        let url = self.settings_url(instance_id);
        debug!(url = %url, "Updating agent settings");

        let response = self
            .client
            .put(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(settings)
            .send()
            .await
            .map_err(|err| transport(&action, err))?;
        Self::check(response, &action).await?;
        Ok(())
    }

    async fn delete_settings(&self, instance_id: &str) -> Result<()> {
        let action = format!("delete settings for `{instance_id}'");
        let url = self.settings_url(instance_id);
        debug!(url = %url, "Deleting agent settings");

        let response = self
            .client
            .delete(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|err| transport(&action, err))?;
        Self::check(response, &action).await?;
        Ok(())
    }
}

/// In-process registry for tests and development.
#[derive(Debug)]
pub struct InMemoryRegistry {
    endpoint: String,
    settings: Mutex<HashMap<String, AgentSettings>>,
    failing: AtomicBool,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new("http://127.0.0.1:25777")
    }
}

impl InMemoryRegistry {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            settings: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get(&self, instance_id: &str) -> Option<AgentSettings> {
        self.lock().get(instance_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AgentSettings>> {
        self.settings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CloudError::Registry("registry unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsRegistry for InMemoryRegistry {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn read_settings(&self, instance_id: &str) -> Result<AgentSettings> {
        self.ensure_available()?;
        self.get(instance_id).ok_or_else(|| {
            CloudError::Registry(format!("no settings for `{instance_id}'"))
        })
    }

    async fn update_settings(&self, instance_id: &str, settings: &AgentSettings) -> Result<()> {
        self.ensure_available()?;
        self.lock()
            .insert(instance_id.to_string(), settings.clone());
        info!(instance_id, "Stored agent settings");
        Ok(())
    }

    async fn delete_settings(&self, instance_id: &str) -> Result<()> {
        self.ensure_available()?;
        self.lock().remove(instance_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_initial_settings_layout() {
        let properties = json!({
            "ntp": ["0.north-america.pool.ntp.org"],
            "agent_id": "ignored",
        });
        let properties = properties.as_object().unwrap();

        let settings = AgentSettings::initial(
            "agent-1",
            "/dev/sda1",
            NetworkSpecs::new(),
            Some(json!({"bosh": {"password": "secret"}})),
            properties,
        );
        let value = serde_json::to_value(&settings).unwrap();

        assert!(value["vm"]["name"].as_str().unwrap().starts_with("vm-"));
        assert_eq!(value["agent_id"], "agent-1");
        assert_eq!(
            value["disks"],
            json!({"system": "/dev/sda1", "ephemeral": "/dev/sdb", "persistent": {}})
        );
        assert_eq!(value["env"]["bosh"]["password"], "secret");
        assert_eq!(value["ntp"][0], "0.north-america.pool.ntp.org");
    }

    #[test]
    fn test_settings_round_trip_keeps_properties() {
        let raw = json!({
            "vm": {"name": "vm-1"},
            "agent_id": "agent-1",
            "networks": {},
            "disks": {"system": "/dev/sda", "persistent": {"vol-1": "/dev/sdf"}},
            "mbus": "nats://localhost:4222",
        });

        let settings: AgentSettings = serde_json::from_value(raw).unwrap();
        assert_eq!(settings.disks.persistent["vol-1"], "/dev/sdf");
        assert_eq!(settings.properties["mbus"], "nats://localhost:4222");
        assert!(settings.env.is_none());
    }

    #[tokio::test]
    async fn test_in_memory_registry() {
        let registry = InMemoryRegistry::default();
        let settings =
            AgentSettings::initial("a", "/dev/sda", NetworkSpecs::new(), None, &Map::new());

        registry.update_settings("i-1", &settings).await.unwrap();
        assert_eq!(registry.read_settings("i-1").await.unwrap(), settings);

        registry.set_failing(true);
        assert!(registry.delete_settings("i-1").await.is_err());
        registry.set_failing(false);

        registry.delete_settings("i-1").await.unwrap();
        assert!(registry.read_settings("i-1").await.is_err());
        assert!(registry.is_empty());
    }
}
