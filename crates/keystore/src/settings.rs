//! On-disk tunnel settings.
//!
//! A JSON file with the node's listen configuration and the payment
//! section. Missing file → defaults are generated and written back, so
//! there is always a concrete file for the operator to edit.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::paths::expand_path;
use crate::{KeystoreError, Result};

/// Policy applied to virtual channels this node opens or proxies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPolicy {
    /// Fee taken for proxying a virtual channel, in display units.
    pub virtual_channel_proxy_fee: String,
    pub quarantine_duration_sec: u32,
    pub misbehavior_fine: String,
    pub conditional_close_duration_sec: u32,
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self {
            virtual_channel_proxy_fee: "0.01".into(),
            quarantine_duration_sec: 600,
            misbehavior_fine: "0.15".into(),
            conditional_close_duration_sec: 180,
        }
    }
}

/// Payment-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentsSettings {
    pub enabled: bool,
    pub listen_addr: String,
    pub db_path: String,
    pub secure_proof_policy: bool,
    pub channel_policy: ChannelPolicy,
    /// Floor for the per-packet price of routing hops, in nano units.
    pub min_price_per_packet_route: u64,
    /// Floor for the per-packet price of in/out gateway hops.
    pub min_price_per_packet_in_out: u64,
}

impl Default for PaymentsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "0.0.0.0:17331".into(),
            db_path: "./payments-db/".into(),
            secure_proof_policy: false,
            channel_policy: ChannelPolicy::default(),
            min_price_per_packet_route: 0,
            min_price_per_packet_in_out: 0,
        }
    }
}

/// Top-level node settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelSettings {
    pub listen_addr: String,
    pub threads: u32,
    pub network_config_url: String,
    /// Manually pinned external IP; empty means undiscovered.
    pub external_ip: String,
    pub payments: PaymentsSettings,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:17330".into(),
            threads: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            network_config_url: String::new(),
            external_ip: String::new(),
            payments: PaymentsSettings::default(),
        }
    }
}

impl TunnelSettings {
    /// Load settings from `path`, writing defaults there first if the
    /// file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let path = expand_path(path);

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(KeystoreError::CreateDir)?;
            }
        }

        if !path.exists() {
            let settings = Self::default();
            settings.save(&path)?;
            info!(path = %path.display(), "wrote default settings");
            return Ok(settings);
        }

        let data = std::fs::read(&path).map_err(KeystoreError::Read)?;
        serde_json::from_slice(&data)
            .map_err(|e| KeystoreError::InvalidSettings(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| KeystoreError::InvalidSettings(e.to_string()))?;
        std::fs::write(expand_path(path), data).map_err(KeystoreError::Write)
    }
}
