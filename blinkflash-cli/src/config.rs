//! Configuration file support for blinkflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (BLINKFLASH_*)
//! 3. Local config file (./blinkflash.toml)
//! 4. Global config file (~/.config/blinkflash/config.toml)

use blinkflash::{DiscoveryFilter, MtuPolicy, ReconnectPolicy, SessionConfig, Slot};
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::CliError;

/// Device selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Advertised name prefix to scan for.
    pub name_prefix: Option<String>,
    /// Preferred device name; skips the selection prompt.
    pub name: Option<String>,
    /// Scan duration in milliseconds.
    pub scan_timeout_ms: Option<u64>,
    /// Upper bound on a single connect, in milliseconds.
    pub connect_timeout_ms: Option<u64>,
}

/// Transfer defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Default program slot.
    pub slot: Option<u8>,
}

/// Reconnection tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Attempts before giving up.
    pub max_attempts: Option<u32>,
    /// Delay before the first attempt, in milliseconds.
    pub initial_delay_ms: Option<u64>,
    /// Backoff multiplier.
    pub multiplier: Option<u32>,
}

/// MTU negotiation tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MtuConfig {
    /// MTU requested from the transport.
    pub preferred: Option<u16>,
    /// MTU used when negotiation fails.
    pub fallback: Option<u16>,
    /// Subtracted from the device-reported MTU.
    pub report_overhead: Option<u16>,
    /// Subtracted from a transport-granted MTU.
    pub granted_overhead: Option<u16>,
}

/// Compiler settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Path to the `mrbc` executable.
    pub mrbc: Option<PathBuf>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Device selection.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Transfer defaults.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Reconnection tuning.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// MTU negotiation tuning.
    #[serde(default)]
    pub mtu: MtuConfig,
    /// Compiler settings.
    #[serde(default)]
    pub compiler: CompilerConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new("blinkflash.toml")) {
            debug!("Loaded local config from blinkflash.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "blinkflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.device.name_prefix, other.device.name_prefix);
        take(&mut self.device.name, other.device.name);
        take(&mut self.device.scan_timeout_ms, other.device.scan_timeout_ms);
        take(
            &mut self.device.connect_timeout_ms,
            other.device.connect_timeout_ms,
        );

        take(&mut self.transfer.slot, other.transfer.slot);

        take(&mut self.reconnect.max_attempts, other.reconnect.max_attempts);
        take(
            &mut self.reconnect.initial_delay_ms,
            other.reconnect.initial_delay_ms,
        );
        take(&mut self.reconnect.multiplier, other.reconnect.multiplier);

        take(&mut self.mtu.preferred, other.mtu.preferred);
        take(&mut self.mtu.fallback, other.mtu.fallback);
        take(&mut self.mtu.report_overhead, other.mtu.report_overhead);
        take(&mut self.mtu.granted_overhead, other.mtu.granted_overhead);

        take(&mut self.compiler.mrbc, other.compiler.mrbc);
    }

    /// Default slot from the config file, if one is set.
    pub fn slot(&self) -> Result<Option<Slot>, CliError> {
        self.transfer
            .slot
            .map(|n| {
                Slot::try_from(n).map_err(|_| {
                    CliError::Config(format!(
                        "Configuration error: transfer.slot = {n} (expected 1 or 2)"
                    ))
                })
            })
            .transpose()
    }

    /// Build the session configuration, filling gaps with library defaults.
    ///
    /// Values the session cannot run with are rejected here, together with
    /// the default slot, so a bad file fails before any device is touched.
    pub fn session_config(&self) -> Result<SessionConfig, CliError> {
        self.slot()?;

        let mut discovery = DiscoveryFilter::default();
        if let Some(prefix) = &self.device.name_prefix {
            discovery = discovery.with_name_prefix(prefix.clone());
        }
        if let Some(ms) = self.device.scan_timeout_ms {
            discovery = discovery.with_scan_timeout(Duration::from_millis(ms));
        }

        let defaults = ReconnectPolicy::default();
        let reconnect = ReconnectPolicy {
            max_attempts: self.reconnect.max_attempts.unwrap_or(defaults.max_attempts),
            initial_delay: self
                .reconnect
                .initial_delay_ms
                .map_or(defaults.initial_delay, Duration::from_millis),
            multiplier: self.reconnect.multiplier.unwrap_or(defaults.multiplier),
        };

        let defaults = MtuPolicy::default();
        let mtu = MtuPolicy {
            preferred: self.mtu.preferred.unwrap_or(defaults.preferred),
            fallback: self.mtu.fallback.unwrap_or(defaults.fallback),
            granted_overhead: self
                .mtu
                .granted_overhead
                .unwrap_or(defaults.granted_overhead),
            report_overhead: self.mtu.report_overhead.unwrap_or(defaults.report_overhead),
        };

        let mut session = SessionConfig::default()
            .with_discovery(discovery)
            .with_reconnect(reconnect)
            .with_mtu(mtu);
        if let Some(ms) = self.device.connect_timeout_ms {
            session = session.with_connect_timeout(Duration::from_millis(ms));
        }

        session
            .validate()
            .map_err(|e| CliError::Config(e.to_string()))?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- Default values ----

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.device.name.is_none());
        assert!(config.device.name_prefix.is_none());
        assert!(config.transfer.slot.is_none());
        assert!(config.reconnect.max_attempts.is_none());
        assert!(config.mtu.fallback.is_none());
        assert!(config.compiler.mrbc.is_none());
    }

    #[test]
    fn test_default_session_config_matches_library() {
        let session = Config::default().session_config().unwrap();
        assert_eq!(session.reconnect, ReconnectPolicy::default());
        assert_eq!(session.mtu, MtuPolicy::default());
        assert_eq!(session.discovery.name_prefix, "OpenBlink");
    }

    // ---- Config merge ----

    #[test]
    fn test_config_merge_overrides() {
        let mut base = Config::default();
        base.device.name = Some("OpenBlink-1".to_string());
        base.transfer.slot = Some(1);

        let mut other = Config::default();
        other.device.name = Some("OpenBlink-2".to_string());
        other.reconnect.max_attempts = Some(3);

        base.merge(other);

        assert_eq!(base.device.name.as_deref(), Some("OpenBlink-2"));
        assert_eq!(base.transfer.slot, Some(1));
        assert_eq!(base.reconnect.max_attempts, Some(3));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.mtu.fallback = Some(23);
        base.compiler.mrbc = Some(PathBuf::from("/opt/mruby/bin/mrbc"));

        base.merge(Config::default());

        assert_eq!(base.mtu.fallback, Some(23));
        assert_eq!(
            base.compiler.mrbc.as_deref(),
            Some(Path::new("/opt/mruby/bin/mrbc"))
        );
    }

    // ---- TOML ----

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[device]
name_prefix = "OpenBlink"
name = "OpenBlink-A1B2"
scan_timeout_ms = 3000
connect_timeout_ms = 4000

[transfer]
slot = 1

[reconnect]
max_attempts = 3
initial_delay_ms = 500
multiplier = 3

[mtu]
preferred = 247
fallback = 23
report_overhead = 3
granted_overhead = 0

[compiler]
mrbc = "/usr/local/bin/mrbc"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.device.name.as_deref(), Some("OpenBlink-A1B2"));
        assert_eq!(config.transfer.slot, Some(1));

        let session = config.session_config().unwrap();
        assert_eq!(session.discovery.scan_timeout, Duration::from_secs(3));
        assert_eq!(session.connect_timeout, Duration::from_secs(4));
        assert_eq!(session.reconnect.max_attempts, 3);
        assert_eq!(session.reconnect.delay_for(2), Duration::from_millis(1500));
        assert_eq!(session.mtu.preferred, 247);
        assert_eq!(session.mtu.fallback, 23);
    }

    // ---- Validation ----

    #[test]
    fn test_invalid_slot_is_config_error() {
        let config: Config = toml::from_str("[transfer]\nslot = 7\n").unwrap();
        assert!(matches!(config.slot(), Err(CliError::Config(_))));
        let err = config.session_config().unwrap_err();
        assert!(matches!(err, CliError::Config(ref msg) if msg.contains("transfer.slot")));
    }

    #[test]
    fn test_valid_slot_is_resolved() {
        let config: Config = toml::from_str("[transfer]\nslot = 2\n").unwrap();
        assert_eq!(config.slot().unwrap(), Some(Slot::Two));
        assert_eq!(Config::default().slot().unwrap(), None);
    }

    #[test]
    fn test_unusable_session_values_are_config_errors() {
        let zero_multiplier: Config = toml::from_str("[reconnect]\nmultiplier = 0\n").unwrap();
        assert!(matches!(
            zero_multiplier.session_config(),
            Err(CliError::Config(ref msg)) if msg.contains("multiplier")
        ));

        let tiny_mtu: Config = toml::from_str("[mtu]\nfallback = 4\n").unwrap();
        assert!(matches!(tiny_mtu.session_config(), Err(CliError::Config(_))));

        let no_timeout: Config = toml::from_str("[device]\nconnect_timeout_ms = 0\n").unwrap();
        assert!(matches!(no_timeout.session_config(), Err(CliError::Config(_))));
    }

    #[test]
    fn test_zero_attempts_is_accepted() {
        let config: Config = toml::from_str("[reconnect]\nmax_attempts = 0\n").unwrap();
        let session = config.session_config().unwrap();
        assert!(!session.reconnect.is_enabled());
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.device.name.is_none());
        assert!(config.transfer.slot.is_none());
    }

    #[test]
    fn test_config_roundtrip_toml() {
        let mut config = Config::default();
        config.device.name = Some("OpenBlink-X".to_string());
        config.mtu.granted_overhead = Some(3);

        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();

        assert_eq!(deserialized.device.name.as_deref(), Some("OpenBlink-X"));
        assert_eq!(deserialized.mtu.granted_overhead, Some(3));
    }

    // ---- load_from_path with tempfile ----

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blinkflash.toml");
        fs::write(&path, "[transfer]\nslot = 1\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.transfer.slot, Some(1));
    }

    #[test]
    fn test_load_from_path_invalid_toml_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[transfer\nslot = ").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.transfer.slot.is_none());
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.device.name.is_none());
    }

    #[test]
    fn test_global_config_path_is_some() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_str().unwrap().contains("blinkflash"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
