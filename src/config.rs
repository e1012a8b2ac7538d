//! Configuration surface: a JSON document deserialized with
//! `serde`/`serde_json`, the teacher's own serialization stack.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::registry::EndpointBindingPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub virtual_clusters: Vec<VirtualClusterConfig>,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualClusterConfig {
    pub name: String,
    pub upstream_bootstrap: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    pub endpoint_binding_policy: EndpointBindingPolicy,
    #[serde(default)]
    pub log_frames: bool,
    #[serde(default)]
    pub log_network: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

/// An entry in the ordered filter list: a type tag plus opaque config,
/// deserialized late by the plugin registry the type tag names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// The encryption filter's own config block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionFilterConfig {
    pub kms: KmsSelectorConfig,
    pub kek_selector: KekSelectorConfig,
    #[serde(default)]
    pub cache_tuning: CacheTuningConfig,
    #[serde(default = "default_max_encryptions_per_dek")]
    pub max_encryptions_per_dek: u64,
    /// Which record fields every mapped topic encrypts (see
    /// `encryption::EncryptionScheme`). Applied uniformly across every
    /// kek_id/topic this filter instance
    /// handles; a deployment wanting a different selection per topic
    /// configures a second filter instance instead.
    #[serde(default = "default_record_fields")]
    pub record_fields: Vec<RecordFieldConfig>,
}

fn default_max_encryptions_per_dek() -> u64 {
    5_000_000
}

fn default_record_fields() -> Vec<RecordFieldConfig> {
    vec![RecordFieldConfig::RecordValue]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordFieldConfig {
    RecordValue,
    RecordHeaderValues,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsSelectorConfig {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KekSelectorConfig {
    pub name: String,
    #[serde(default)]
    pub topic_to_kek: HashMap<String, String>,
}

/// Cache tuning knobs for the KMS-fronting caches, with their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTuningConfig {
    pub resolved_alias_cache_size: u64,
    pub resolved_alias_expire_after_write: Duration,
    pub resolved_alias_refresh_after_write: Duration,
    pub not_found_alias_expire_after_write: Duration,
    pub decrypted_dek_cache_size: u64,
    pub decrypted_dek_expire_after_access: Duration,
    pub encryption_dek_expire_after_write: Duration,
    pub encryption_dek_refresh_after_write: Duration,
}

impl Default for CacheTuningConfig {
    fn default() -> Self {
        CacheTuningConfig {
            resolved_alias_cache_size: 1000,
            resolved_alias_expire_after_write: Duration::from_secs(10 * 60),
            resolved_alias_refresh_after_write: Duration::from_secs(8 * 60),
            not_found_alias_expire_after_write: Duration::from_secs(30),
            decrypted_dek_cache_size: 1000,
            decrypted_dek_expire_after_access: Duration::from_secs(60 * 60),
            encryption_dek_expire_after_write: Duration::from_secs(2 * 60 * 60),
            encryption_dek_refresh_after_write: Duration::from_secs(60 * 60),
        }
    }
}

impl ProxyConfig {
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let config: ProxyConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Port-collision check: two virtual clusters must not claim the same
    /// listener. Fatal at startup.
    fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for vc in &self.virtual_clusters {
            for addr in vc.endpoint_binding_policy.listen_addrs() {
                if !seen.insert(addr.clone()) {
                    anyhow::bail!("port collision: {addr} claimed by more than one virtual cluster");
                }
            }
        }
        Ok(())
    }
}
