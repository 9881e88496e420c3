//! Ambient configuration layer, in the shape of `rust-dns-dhcp`'s
//! `Config`: a serde-derived struct with `#[serde(default = ...)]` knobs,
//! loaded from a JSON file and saved back atomically (temp file + rename)
//! so a crash mid-write never corrupts the on-disk copy.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dpt::DEFAULT_DPT_CAPACITY;
use crate::policy::OmrConfig as RuntimeOmrConfig;
use crate::wire::Preference;

fn default_infra_if_index() -> u32 {
    0
}

fn default_dpt_capacity() -> usize {
    DEFAULT_DPT_CAPACITY
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrmConfig {
    #[serde(default = "default_infra_if_index")]
    pub infra_if_index: u32,

    /// Device name of the infra link, e.g. `"eth0"`; the agent binary
    /// resolves `infra_if_index` from this at startup rather than
    /// requiring the caller to know the kernel index up front.
    #[serde(default)]
    pub infra_interface: String,

    #[serde(default = "default_dpt_capacity")]
    pub dpt_capacity: usize,

    #[serde(default = "default_true")]
    pub nat64_enabled: bool,

    #[serde(default)]
    pub omr_mode: OmrConfigMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OmrConfigMode {
    #[default]
    Auto,
    Custom {
        prefix: String,
        preference: SerdePreference,
    },
    Disabled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerdePreference {
    Low,
    Medium,
    High,
}

impl From<SerdePreference> for Preference {
    fn from(p: SerdePreference) -> Self {
        match p {
            SerdePreference::Low => Preference::Low,
            SerdePreference::Medium => Preference::Medium,
            SerdePreference::High => Preference::High,
        }
    }
}

impl Default for BrmConfig {
    fn default() -> Self {
        Self {
            infra_if_index: default_infra_if_index(),
            infra_interface: String::new(),
            dpt_capacity: default_dpt_capacity(),
            nat64_enabled: default_true(),
            omr_mode: OmrConfigMode::default(),
        }
    }
}

impl BrmConfig {
    pub fn load_from_file(path: &Path) -> io::Result<Self> {
        let data = fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Atomic save: write to `<path>.tmp` then rename over `path`, so a
    /// reader never observes a partially-written file.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let tmp_path: PathBuf = path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn runtime_omr_config(&self) -> Option<RuntimeOmrConfig> {
        match &self.omr_mode {
            OmrConfigMode::Auto => Some(RuntimeOmrConfig::Auto),
            OmrConfigMode::Disabled => Some(RuntimeOmrConfig::Disabled),
            OmrConfigMode::Custom { prefix, preference } => {
                let addr: std::net::Ipv6Addr = prefix.parse().ok()?;
                let prefix = crate::prefix::IPv6Prefix::new(addr, 64)?;
                Some(RuntimeOmrConfig::Custom {
                    prefix,
                    preference: (*preference).into(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let cfg = BrmConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: BrmConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.infra_if_index, cfg.infra_if_index);
        assert_eq!(back.dpt_capacity, cfg.dpt_capacity);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: BrmConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.nat64_enabled);
        assert_eq!(cfg.dpt_capacity, DEFAULT_DPT_CAPACITY);
    }

    #[test]
    fn save_then_load_is_atomic_and_idempotent() {
        let dir = std::env::temp_dir().join(format!("brm-config-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("brm.json");

        let cfg = BrmConfig {
            infra_if_index: 7,
            ..BrmConfig::default()
        };
        cfg.save(&path).unwrap();
        let loaded = BrmConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.infra_if_index, 7);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn custom_mode_parses_into_runtime_config() {
        let cfg = BrmConfig {
            omr_mode: OmrConfigMode::Custom {
                prefix: "2001:db8::".to_string(),
                preference: SerdePreference::High,
            },
            ..BrmConfig::default()
        };
        let runtime = cfg.runtime_omr_config().unwrap();
        assert!(matches!(runtime, RuntimeOmrConfig::Custom { .. }));
    }
}
