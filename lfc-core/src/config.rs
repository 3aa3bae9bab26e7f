//! Daemon configuration
//!
//! One typed record with explicit defaults and a single load/save pair.
//! Merge rule: defaults overlaid by file values; caller-provided overrides
//! (CLI flags) go on top. A missing config file is created with defaults on
//! first load.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use lfc_error::{LfcError, Result};

use crate::constants::{paths, rpc, shm, timing, vendor};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    pub tick_ms: u64,
    pub force_tick_ms: u64,
    pub delta_c: f64,
    pub pidfile: String,
    pub logfile: String,
    pub shm_path: String,
    pub profiles_path: String,
    pub profile_name: String,
    pub debug: bool,
    pub vendor_map_path: String,
    pub vendor_map_watch_mode: String,
    pub vendor_map_throttle_ms: u64,
}

fn parent_writable(path: &str) -> bool {
    let p = Path::new(path);
    let Some(dir) = p.parent() else { return false };
    if fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(".lfc_write_test");
    match fs::write(&probe, b"") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

fn config_base() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(paths::CONFIG_DIR_NAME))
}

/// Default location of the daemon config file.
pub fn default_config_path() -> PathBuf {
    config_base()
        .map(|b| b.join(paths::CONFIG_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(paths::CONFIG_FILE_NAME))
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let profiles_path = config_base()
            .map(|b| b.join(paths::PROFILES_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(paths::PROFILES_DIR_NAME));

        Self {
            host: rpc::DEFAULT_HOST.to_string(),
            port: rpc::DEFAULT_PORT,
            tick_ms: timing::TICK_MS_DEFAULT,
            force_tick_ms: timing::FORCE_TICK_MS_DEFAULT,
            delta_c: timing::DELTA_C_DEFAULT,
            pidfile: if parent_writable(paths::PIDFILE_PREFERRED) {
                paths::PIDFILE_PREFERRED.to_string()
            } else {
                paths::PIDFILE_FALLBACK.to_string()
            },
            logfile: if parent_writable(paths::LOGFILE_PREFERRED) {
                paths::LOGFILE_PREFERRED.to_string()
            } else {
                paths::LOGFILE_FALLBACK.to_string()
            },
            shm_path: shm::DEFAULT_NAME.to_string(),
            profiles_path: profiles_path.to_string_lossy().to_string(),
            profile_name: String::new(),
            debug: false,
            vendor_map_path: String::new(),
            vendor_map_watch_mode: vendor::WATCH_MODE_MTIME.to_string(),
            vendor_map_throttle_ms: vendor::THROTTLE_MS_DEFAULT,
        }
    }
}

impl DaemonConfig {
    /// Load from `path`, creating the file with defaults when absent.
    /// Accepts both a plain object and the wrapped `{"config": {...}}` form.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let cfg = Self::default();
            cfg.save(path)?;
            info!(path = %path.display(), "wrote default config");
            return Ok(cfg);
        }

        let text = fs::read_to_string(path).map_err(|e| LfcError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut root: Value = serde_json::from_str(&text)?;
        let obj = match root.get_mut("config") {
            Some(inner) if inner.is_object() => inner.take(),
            _ => root,
        };
        let cfg: Self = serde_json::from_value(obj)?;
        cfg.validate()?;
        debug!(path = %path.display(), "config loaded");
        Ok(cfg)
    }

    /// Persist as pretty JSON, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| LfcError::FileWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text + "\n").map_err(|e| LfcError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Range checks for the engine-facing values.
    pub fn validate(&self) -> Result<()> {
        if !(timing::TICK_MS_MIN..=timing::TICK_MS_MAX).contains(&self.tick_ms) {
            return Err(LfcError::InvalidConfig {
                field: "tickMs".to_string(),
                reason: format!(
                    "{} out of range [{}, {}]",
                    self.tick_ms,
                    timing::TICK_MS_MIN,
                    timing::TICK_MS_MAX
                ),
            });
        }
        if !(timing::FORCE_TICK_MS_MIN..=timing::FORCE_TICK_MS_MAX).contains(&self.force_tick_ms) {
            return Err(LfcError::InvalidConfig {
                field: "forceTickMs".to_string(),
                reason: format!(
                    "{} out of range [{}, {}]",
                    self.force_tick_ms,
                    timing::FORCE_TICK_MS_MIN,
                    timing::FORCE_TICK_MS_MAX
                ),
            });
        }
        if !(timing::DELTA_C_MIN..=timing::DELTA_C_MAX).contains(&self.delta_c) {
            return Err(LfcError::InvalidConfig {
                field: "deltaC".to_string(),
                reason: format!(
                    "{} out of range [{}, {}]",
                    self.delta_c,
                    timing::DELTA_C_MIN,
                    timing::DELTA_C_MAX
                ),
            });
        }
        if self.vendor_map_watch_mode != vendor::WATCH_MODE_NONE
            && self.vendor_map_watch_mode != vendor::WATCH_MODE_MTIME
        {
            return Err(LfcError::InvalidConfig {
                field: "vendorMapWatchMode".to_string(),
                reason: format!("unknown mode '{}'", self.vendor_map_watch_mode),
            });
        }
        Ok(())
    }

    /// Apply a single `config.set` key/value pair. The change is validated
    /// against the full record before it takes effect.
    pub fn set_key(&mut self, key: &str, value: &Value) -> Result<()> {
        let mut next = self.clone();

        fn want_str(key: &str, value: &Value) -> Result<String> {
            value
                .as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| LfcError::InvalidConfig {
                    field: key.to_string(),
                    reason: "expected string".to_string(),
                })
        }
        fn want_u64(key: &str, value: &Value) -> Result<u64> {
            value.as_u64().ok_or_else(|| LfcError::InvalidConfig {
                field: key.to_string(),
                reason: "expected non-negative integer".to_string(),
            })
        }

        match key {
            "host" => next.host = want_str(key, value)?,
            "port" => {
                let port = want_u64(key, value)?;
                next.port = u16::try_from(port).map_err(|_| LfcError::InvalidConfig {
                    field: key.to_string(),
                    reason: format!("{} not a valid port", port),
                })?;
            }
            "tickMs" => next.tick_ms = want_u64(key, value)?,
            "forceTickMs" => next.force_tick_ms = want_u64(key, value)?,
            "deltaC" => {
                next.delta_c = value.as_f64().ok_or_else(|| LfcError::InvalidConfig {
                    field: key.to_string(),
                    reason: "expected number".to_string(),
                })?;
            }
            "pidfile" => next.pidfile = want_str(key, value)?,
            "logfile" => next.logfile = want_str(key, value)?,
            "shmPath" => next.shm_path = want_str(key, value)?,
            "profilesPath" => next.profiles_path = want_str(key, value)?,
            "profileName" => next.profile_name = want_str(key, value)?,
            "debug" => {
                next.debug = value.as_bool().ok_or_else(|| LfcError::InvalidConfig {
                    field: key.to_string(),
                    reason: "expected bool".to_string(),
                })?;
            }
            "vendorMapPath" => next.vendor_map_path = want_str(key, value)?,
            "vendorMapWatchMode" => next.vendor_map_watch_mode = want_str(key, value)?,
            "vendorMapThrottleMs" => next.vendor_map_throttle_ms = want_u64(key, value)?,
            other => {
                return Err(LfcError::InvalidConfig {
                    field: other.to_string(),
                    reason: "unknown key".to_string(),
                })
            }
        }

        next.validate()?;
        *self = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = DaemonConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 8777);
        assert_eq!(cfg.tick_ms, 25);
        assert_eq!(cfg.force_tick_ms, 2000);
        assert_eq!(cfg.shm_path, "lfc.telemetry");
    }

    #[test]
    fn test_missing_file_creates_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub").join("daemon.json");
        let cfg = DaemonConfig::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg, DaemonConfig::default());
    }

    #[test]
    fn test_file_values_overlay_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.json");
        std::fs::write(&path, r#"{"port": 9000, "tickMs": 100}"#).unwrap();

        let cfg = DaemonConfig::load(&path).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.tick_ms, 100);
        // untouched keys keep their defaults
        assert_eq!(cfg.host, "127.0.0.1");
    }

    #[test]
    fn test_wrapped_form_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.json");
        std::fs::write(&path, r#"{"config": {"port": 9001}}"#).unwrap();
        assert_eq!(DaemonConfig::load(&path).unwrap().port, 9001);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.json");
        let mut cfg = DaemonConfig::default();
        cfg.port = 12345;
        cfg.profile_name = "Quiet".to_string();
        cfg.save(&path).unwrap();

        assert_eq!(DaemonConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn test_set_key_ranges() {
        let mut cfg = DaemonConfig::default();
        cfg.set_key("tickMs", &json!(50)).unwrap();
        assert_eq!(cfg.tick_ms, 50);

        assert!(cfg.set_key("tickMs", &json!(2)).is_err());
        assert!(cfg.set_key("tickMs", &json!(5000)).is_err());
        // failed set leaves the previous value
        assert_eq!(cfg.tick_ms, 50);

        cfg.set_key("deltaC", &json!(1.5)).unwrap();
        assert!(cfg.set_key("deltaC", &json!(-0.1)).is_err());
        assert!(cfg.set_key("deltaC", &json!(11.0)).is_err());

        assert!(cfg.set_key("vendorMapWatchMode", &json!("mtime")).is_ok());
        assert!(cfg.set_key("vendorMapWatchMode", &json!("inotify")).is_err());

        assert!(cfg.set_key("port", &json!("not a port")).is_err());
        assert!(cfg.set_key("unknownKey", &json!(1)).is_err());
    }
}
