//! Chip-name to vendor resolution
//!
//! Maps hwmon chip names ("nct6798", "k10temp", "amdgpu", ...) to vendor
//! strings for inventory and telemetry. A built-in table covers the common
//! drivers; a JSON map file (`vendorMapPath`) can extend or override it and
//! is re-read on mtime change when `vendorMapWatchMode` is `"mtime"`, at most
//! once per `vendorMapThrottleMs`.
//!
//! Map file format: a flat JSON object `{ "name-prefix": "Vendor", ... }`.
//! Matching is by longest prefix, case-insensitive.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use crate::constants::vendor;

/// Built-in fallback table: chip-name prefix -> vendor.
const BUILTIN: &[(&str, &str)] = &[
    ("nct", "Nuvoton"),
    ("it8", "ITE"),
    ("w836", "Winbond"),
    ("f718", "Fintek"),
    ("k10temp", "AMD"),
    ("k8temp", "AMD"),
    ("zenpower", "AMD"),
    ("amdgpu", "AMD"),
    ("coretemp", "Intel"),
    ("i915", "Intel"),
    ("xe", "Intel"),
    ("pch_", "Intel"),
    ("nouveau", "NVIDIA"),
    ("nvme", "NVMe"),
    ("drivetemp", "SATA"),
    ("acpitz", "ACPI"),
    ("thinkpad", "Lenovo"),
    ("dell_smm", "Dell"),
    ("asus", "ASUS"),
    ("applesmc", "Apple"),
];

/// Watch behavior for the external map file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    None,
    Mtime,
}

impl WatchMode {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case(vendor::WATCH_MODE_MTIME) {
            Self::Mtime
        } else {
            Self::None
        }
    }
}

#[derive(Debug)]
pub struct VendorMap {
    entries: HashMap<String, String>,
    path: Option<PathBuf>,
    watch_mode: WatchMode,
    throttle: Duration,
    last_check: Option<Instant>,
    last_mtime: Option<SystemTime>,
}

impl VendorMap {
    /// Map with only the built-in table, no external file.
    pub fn builtin() -> Self {
        Self {
            entries: BUILTIN
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            path: None,
            watch_mode: WatchMode::None,
            throttle: Duration::from_millis(vendor::THROTTLE_MS_DEFAULT),
            last_check: None,
            last_mtime: None,
        }
    }

    /// Map backed by an external JSON file, loaded immediately.
    pub fn with_file(path: PathBuf, watch_mode: WatchMode, throttle_ms: u64) -> Self {
        let mut map = Self::builtin();
        map.path = Some(path);
        map.watch_mode = watch_mode;
        map.throttle = Duration::from_millis(throttle_ms);
        map.reload();
        map
    }

    /// Resolve a chip name to its vendor by longest case-insensitive prefix.
    /// Unknown names resolve to an empty string.
    pub fn resolve(&self, chip_name: &str) -> String {
        let lower = chip_name.to_ascii_lowercase();
        let mut best: Option<(&str, &str)> = None;
        for (prefix, vendor) in &self.entries {
            if lower.starts_with(&prefix.to_ascii_lowercase()) {
                match best {
                    Some((bp, _)) if bp.len() >= prefix.len() => {}
                    _ => best = Some((prefix.as_str(), vendor.as_str())),
                }
            }
        }
        best.map(|(_, v)| v.to_string()).unwrap_or_default()
    }

    /// Re-read the map file if watching is enabled, its mtime changed, and
    /// the throttle window has elapsed.
    pub fn maybe_reload(&mut self) {
        if self.watch_mode != WatchMode::Mtime || self.path.is_none() {
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_check {
            if now.duration_since(last) < self.throttle {
                return;
            }
        }
        self.last_check = Some(now);

        let Some(path) = self.path.clone() else { return };
        let mtime = match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => return,
        };
        if self.last_mtime == Some(mtime) {
            return;
        }
        self.reload();
    }

    fn reload(&mut self) {
        let Some(ref path) = self.path else { return };
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<HashMap<String, String>>(&text) {
                Ok(overrides) => {
                    debug!(path = %path.display(), entries = overrides.len(), "vendor map loaded");
                    self.entries.extend(overrides);
                    self.last_mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
                }
                Err(e) => warn!(path = %path.display(), error = %e, "vendor map not valid JSON"),
            },
            Err(e) => debug!(path = %path.display(), error = %e, "vendor map not readable"),
        }
    }
}

impl Default for VendorMap {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_resolution() {
        let m = VendorMap::builtin();
        assert_eq!(m.resolve("nct6798"), "Nuvoton");
        assert_eq!(m.resolve("k10temp"), "AMD");
        assert_eq!(m.resolve("NCT6775"), "Nuvoton");
        assert_eq!(m.resolve("totally-unknown"), "");
    }

    #[test]
    fn test_file_overrides_builtin() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vendors.json");
        std::fs::write(&path, r#"{"nct": "Custom Corp", "mychip": "MyVendor"}"#).unwrap();

        let m = VendorMap::with_file(path, WatchMode::None, 0);
        assert_eq!(m.resolve("nct6798"), "Custom Corp");
        assert_eq!(m.resolve("mychip42"), "MyVendor");
        // untouched builtins still resolve
        assert_eq!(m.resolve("coretemp"), "Intel");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vendors.json");
        std::fs::write(&path, r#"{"nct67": "Specific"}"#).unwrap();

        let m = VendorMap::with_file(path, WatchMode::None, 0);
        assert_eq!(m.resolve("nct6798"), "Specific");
        assert_eq!(m.resolve("nct5562"), "Nuvoton");
    }
}
