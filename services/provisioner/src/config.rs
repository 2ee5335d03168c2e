//! Configuration for the provisioner.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stratus_reconcile::BackoffPolicy;
use std::time::Duration;

/// Provisioner process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Provider region, e.g. `us-east-1`.
    pub region: Option<String>,

    /// Key pair used when the resource pool names none.
    pub default_key_name: Option<String>,

    /// Security groups used when no network declares any.
    pub default_security_groups: Vec<String>,

    pub default_availability_zone: Option<String>,

    /// Settings registry URL. Without one an in-memory registry is used.
    pub registry_endpoint: Option<String>,
    pub registry_user: String,
    pub registry_password: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Seconds between on-demand create retries.
    pub instance_create_wait_secs: u64,

    /// Total seconds a spot request may stay open.
    pub spot_wait_secs: u64,

    /// Seconds between spot request polls.
    pub spot_poll_secs: u64,

    /// Tag instances for deletion instead of waiting for termination.
    pub fast_path_delete: bool,

    /// Extra properties merged into every agent's settings (ntp, mbus, ...).
    pub agent_properties: Map<String, Value>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        let default_security_groups = non_empty("STRATUS_DEFAULT_SECURITY_GROUPS")
            .map(|groups| {
                groups
                    .split(',')
                    .map(str::trim)
                    .filter(|g| !g.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_else(|| vec!["default".to_string()]);

        let seconds = |key: &str, default: u64| -> Result<u64> {
            match non_empty(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{key} must be a number of seconds, got {raw:?}")),
                None => Ok(default),
            }
        };

        let agent_properties = match non_empty("STRATUS_AGENT_PROPERTIES") {
            Some(raw) => serde_json::from_str(&raw)
                .context("STRATUS_AGENT_PROPERTIES must be a JSON object")?,
            None => Map::new(),
        };

        let fast_path_delete = non_empty("STRATUS_FAST_PATH_DELETE")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            region: non_empty("STRATUS_REGION"),
            default_key_name: non_empty("STRATUS_DEFAULT_KEY_NAME"),
            default_security_groups,
            default_availability_zone: non_empty("STRATUS_DEFAULT_AVAILABILITY_ZONE"),
            registry_endpoint: non_empty("STRATUS_REGISTRY_ENDPOINT"),
            registry_user: var("STRATUS_REGISTRY_USER").unwrap_or_else(|| "admin".to_string()),
            registry_password: var("STRATUS_REGISTRY_PASSWORD").unwrap_or_default(),
            log_level: non_empty("STRATUS_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            instance_create_wait_secs: seconds(
                "STRATUS_INSTANCE_CREATE_WAIT",
                DEFAULT_INSTANCE_CREATE_WAIT_SECS,
            )?,
            spot_wait_secs: seconds("STRATUS_SPOT_WAIT", DEFAULT_SPOT_WAIT_SECS)?,
            spot_poll_secs: seconds("STRATUS_SPOT_POLL", DEFAULT_SPOT_POLL_SECS)?,
            fast_path_delete,
            agent_properties,
        })
    }

    /// Options handed to every cloud operation.
    pub fn cloud_options(&self) -> CloudOptions {
        CloudOptions {
            region: self.region.clone(),
            default_key_name: self.default_key_name.clone(),
            default_security_groups: self.default_security_groups.clone(),
            default_availability_zone: self.default_availability_zone.clone(),
            instance_create_wait_secs: self.instance_create_wait_secs,
            fast_path_delete: self.fast_path_delete,
            spot: SpotOptions {
                wait_secs: self.spot_wait_secs,
                poll_secs: self.spot_poll_secs,
                ..SpotOptions::default()
            },
            waits: WaitPolicies::default(),
            agent: self.agent_properties.clone(),
        }
    }
}

const DEFAULT_INSTANCE_CREATE_WAIT_SECS: u64 = 30;
const DEFAULT_SPOT_WAIT_SECS: u64 = 300;
const DEFAULT_SPOT_POLL_SECS: u64 = 30;
const DEFAULT_SPOT_DESCRIBE_TRIES: u32 = 10;

/// Attempts for the on-demand create retry.
pub const INSTANCE_CREATE_TRIES: u32 = 10;

/// Provider-level options for cloud operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudOptions {
    pub region: Option<String>,
    pub default_key_name: Option<String>,
    pub default_security_groups: Vec<String>,
    pub default_availability_zone: Option<String>,
    pub instance_create_wait_secs: u64,
    pub fast_path_delete: bool,
    pub spot: SpotOptions,
    pub waits: WaitPolicies,

    /// Properties merged into initial agent settings.
    pub agent: Map<String, Value>,
}

impl Default for CloudOptions {
    fn default() -> Self {
        Self {
            region: None,
            default_key_name: None,
            default_security_groups: vec!["default".to_string()],
            default_availability_zone: None,
            instance_create_wait_secs: DEFAULT_INSTANCE_CREATE_WAIT_SECS,
            fast_path_delete: false,
            spot: SpotOptions::default(),
            waits: WaitPolicies::default(),
            agent: Map::new(),
        }
    }
}

impl CloudOptions {
    /// Retry schedule for on-demand instance creation.
    pub fn instance_create_retry(&self) -> BackoffPolicy {
        BackoffPolicy::fixed(
            Duration::from_secs(self.instance_create_wait_secs),
            INSTANCE_CREATE_TRIES,
        )
    }
}

/// Spot request timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotOptions {
    /// Total seconds the request may stay unfulfilled.
    pub wait_secs: u64,

    /// Seconds between state checks.
    pub poll_secs: u64,

    /// Describe attempts while the request id is not yet visible.
    pub describe_tries: u32,
}

impl Default for SpotOptions {
    fn default() -> Self {
        Self {
            wait_secs: DEFAULT_SPOT_WAIT_SECS,
            poll_secs: DEFAULT_SPOT_POLL_SECS,
            describe_tries: DEFAULT_SPOT_DESCRIBE_TRIES,
        }
    }
}

impl SpotOptions {
    /// Outer poll schedule: one check every `poll_secs`, the last one at the
    /// end of the budget.
    pub fn poll_policy(&self) -> BackoffPolicy {
        let poll = self.poll_secs.max(1);
        let checks = u32::try_from(self.wait_secs / poll)
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        BackoffPolicy::fixed(Duration::from_secs(poll), checks)
    }

    /// Inner retry while the request id propagates.
    pub fn describe_policy(&self) -> BackoffPolicy {
        BackoffPolicy::fixed(Duration::from_secs(1), self.describe_tries)
    }
}

/// Serializable wait schedule for one resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitPolicy {
    pub interval: f64,
    pub max: f64,
    pub total: u32,
    pub exponential: bool,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        let policy = BackoffPolicy::resource_wait();
        Self {
            interval: policy.interval,
            max: policy.max.unwrap_or(stratus_reconcile::DEFAULT_MAX_DELAY_SECS),
            total: policy.total,
            exponential: policy.exponential,
        }
    }
}

impl WaitPolicy {
    pub fn to_backoff(self) -> BackoffPolicy {
        let policy = if self.exponential {
            BackoffPolicy::exponential(self.interval)
        } else {
            BackoffPolicy::linear(self.interval)
        };
        policy.with_max(self.max).with_total(self.total)
    }
}

/// Per-kind wait schedules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitPolicies {
    pub instance: WaitPolicy,
    pub volume: WaitPolicy,
    pub snapshot: WaitPolicy,
    pub image: WaitPolicy,
    pub subnet: WaitPolicy,
    pub attachment: WaitPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.default_security_groups, vec!["default"]);
        assert_eq!(config.instance_create_wait_secs, 30);
        assert_eq!(config.spot_wait_secs, 300);
        assert_eq!(config.log_level, "info");
        assert!(config.registry_endpoint.is_none());
        assert_eq!(config.cloud_options().spot, SpotOptions::default());
    }

    #[test]
    fn test_parses_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("STRATUS_REGION", "eu-west-1"),
            ("STRATUS_DEFAULT_SECURITY_GROUPS", "bosh, ssh ,"),
            ("STRATUS_SPOT_WAIT", "60"),
            ("STRATUS_AGENT_PROPERTIES", r#"{"ntp":["0.pool.ntp.org"]}"#),
            ("STRATUS_FAST_PATH_DELETE", "true"),
        ]))
        .unwrap();

        assert_eq!(config.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.default_security_groups, vec!["bosh", "ssh"]);
        assert_eq!(config.spot_wait_secs, 60);
        assert!(config.agent_properties.contains_key("ntp"));

        let options = config.cloud_options();
        assert!(options.fast_path_delete);
        assert_eq!(options.spot.wait_secs, 60);
    }

    #[test]
    fn test_rejects_bad_numbers_and_json() {
        assert!(Config::from_lookup(lookup(&[("STRATUS_SPOT_POLL", "soon")])).is_err());
        assert!(Config::from_lookup(lookup(&[("STRATUS_AGENT_PROPERTIES", "[1]")])).is_err());
    }

    #[test]
    fn test_spot_poll_policy_covers_budget() {
        let policy = SpotOptions::default().poll_policy();
        assert_eq!(policy.total, 11);
        assert_eq!(stratus_reconcile::delay(0, &policy), Duration::from_secs(30));
    }

    #[test]
    fn test_cloud_options_deserialize_partial() {
        let options: CloudOptions =
            serde_json::from_str(r#"{"region":"us-west-2","spot":{"wait_secs":10}}"#).unwrap();
        assert_eq!(options.region.as_deref(), Some("us-west-2"));
        assert_eq!(options.spot.wait_secs, 10);
        assert_eq!(options.spot.poll_secs, 30);
        assert_eq!(options.default_security_groups, vec!["default"]);
        assert_eq!(options.waits.volume.to_backoff(), BackoffPolicy::resource_wait());
    }
}
