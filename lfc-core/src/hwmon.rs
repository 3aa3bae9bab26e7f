//! Hwmon inventory: discovery and refresh
//!
//! Scans `/sys/class/hwmon/*` for chips and enumerates their temperature
//! inputs, fan tachs and PWM outputs. The resulting [`Inventory`] is
//! read-mostly: the daemon owns it and shares snapshots with the engine,
//! detection worker and telemetry publisher.
//!
//! `scan` discovers hardware; `refresh_values` only re-reads labels and drops
//! entries whose backing files vanished. Both are idempotent and tolerate
//! directories disappearing mid-walk - errors on individual entries are
//! logged and the entry skipped.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info, trace, warn};

use crate::constants::pwm::MAX_RAW;
use crate::sysfs;
use crate::vendormap::VendorMap;

/// One hwmon chip directory. Identity is the path; name and vendor are
/// immutable after discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chip {
    pub path: PathBuf,
    pub name: String,
    pub vendor: String,
}

/// A temperature input (`tempN_input`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempSensor {
    pub chip_path: PathBuf,
    pub input_path: PathBuf,
    pub label: String,
}

/// A fan tach input (`fanN_input`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fan {
    pub chip_path: PathBuf,
    pub input_path: PathBuf,
    pub label: String,
}

/// A PWM output (`pwmN` plus optional `pwmN_enable`). When the enable node is
/// absent, mode save/restore is a no-op for this output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pwm {
    pub chip_path: PathBuf,
    pub pwm_path: PathBuf,
    pub enable_path: Option<PathBuf>,
    pub max_raw: i64,
    pub label: String,
}

/// Complete discovered hardware view.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub chips: Vec<Chip>,
    pub temps: Vec<TempSensor>,
    pub fans: Vec<Fan>,
    pub pwms: Vec<Pwm>,
}

impl Inventory {
    pub fn find_temp(&self, input_path: &str) -> Option<&TempSensor> {
        self.temps
            .iter()
            .find(|t| t.input_path.as_os_str() == input_path)
    }

    pub fn find_pwm(&self, pwm_path: &str) -> Option<&Pwm> {
        self.pwms.iter().find(|p| p.pwm_path.as_os_str() == pwm_path)
    }

    pub fn chip_name(&self, chip_path: &Path) -> &str {
        self.chips
            .iter()
            .find(|c| c.path == chip_path)
            .map(|c| c.name.as_str())
            .unwrap_or("")
    }
}

fn temp_input_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^temp(\d+)_input$").unwrap())
}

fn fan_input_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^fan(\d+)_input$").unwrap())
}

fn pwm_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^pwm(\d+)$").unwrap())
}

fn read_label(chip_path: &Path, base: &str) -> Option<String> {
    let label_path = chip_path.join(format!("{}_label", base));
    sysfs::read_text(&label_path)
        .ok()
        .filter(|s| !s.is_empty())
}

/// Scan the hwmon tree for chips and their sensors.
pub fn scan(root: &Path, vendors: &VendorMap) -> Inventory {
    let mut inv = Inventory::default();

    debug!(root = %root.display(), "scanning hwmon tree");

    let entries = match fs::read_dir(root) {
        Ok(e) => e,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "hwmon root not readable");
            return inv;
        }
    };

    let mut chip_dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    chip_dirs.sort();

    for chip_path in chip_dirs {
        match scan_chip(&chip_path, vendors, &mut inv) {
            Some(chip) => {
                trace!(
                    chip = %chip.name,
                    path = %chip_path.display(),
                    "found hwmon chip"
                );
                inv.chips.push(chip);
            }
            None => {
                trace!(path = %chip_path.display(), "skipped hwmon entry");
            }
        }
    }

    info!(
        chips = inv.chips.len(),
        temps = inv.temps.len(),
        fans = inv.fans.len(),
        pwms = inv.pwms.len(),
        "hwmon scan complete"
    );
    inv
}

fn scan_chip(chip_path: &Path, vendors: &VendorMap, inv: &mut Inventory) -> Option<Chip> {
    let name = match sysfs::read_text(&chip_path.join("name")) {
        Ok(n) if !n.is_empty() => n,
        _ => chip_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    };

    let entries = match fs::read_dir(chip_path) {
        Ok(e) => e,
        Err(e) => {
            // Directory may have vanished between the outer read_dir and now.
            debug!(path = %chip_path.display(), error = %e, "chip directory unreadable");
            return None;
        }
    };

    let mut files: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    files.sort();

    let mut found_any = false;

    for file in &files {
        if let Some(caps) = temp_input_re().captures(file) {
            let base = format!("temp{}", &caps[1]);
            let label = read_label(chip_path, &base).unwrap_or(base);
            inv.temps.push(TempSensor {
                chip_path: chip_path.to_path_buf(),
                input_path: chip_path.join(file),
                label,
            });
            found_any = true;
        } else if let Some(caps) = fan_input_re().captures(file) {
            let base = format!("fan{}", &caps[1]);
            let label = read_label(chip_path, &base).unwrap_or(base);
            inv.fans.push(Fan {
                chip_path: chip_path.to_path_buf(),
                input_path: chip_path.join(file),
                label,
            });
            found_any = true;
        } else if let Some(caps) = pwm_re().captures(file) {
            let idx = &caps[1];
            let enable = chip_path.join(format!("{}_enable", file));
            // PWM outputs rarely carry their own label; the matching fan's
            // label is the next best thing.
            let label = read_label(chip_path, file)
                .or_else(|| read_label(chip_path, &format!("fan{}", idx)))
                .unwrap_or_else(|| file.clone());
            inv.pwms.push(Pwm {
                chip_path: chip_path.to_path_buf(),
                pwm_path: chip_path.join(file),
                enable_path: enable.exists().then_some(enable),
                max_raw: MAX_RAW,
                label,
            });
            found_any = true;
        }
    }

    if !found_any {
        return None;
    }

    Some(Chip {
        path: chip_path.to_path_buf(),
        name: name.clone(),
        vendor: vendors.resolve(&name),
    })
}

/// Refresh an existing inventory in place: re-read label files and drop
/// entries whose input files vanished. Does **not** discover new devices.
pub fn refresh_values(inv: &mut Inventory) {
    inv.temps.retain_mut(|t| {
        if !t.input_path.exists() {
            debug!(path = %t.input_path.display(), "temp input vanished, dropping");
            return false;
        }
        if let Some(label) = label_for_input(&t.input_path) {
            t.label = label;
        }
        true
    });

    inv.fans.retain_mut(|f| {
        if !f.input_path.exists() {
            debug!(path = %f.input_path.display(), "fan input vanished, dropping");
            return false;
        }
        if let Some(label) = label_for_input(&f.input_path) {
            f.label = label;
        }
        true
    });

    inv.pwms.retain_mut(|p| {
        if !p.pwm_path.exists() {
            debug!(path = %p.pwm_path.display(), "pwm output vanished, dropping");
            return false;
        }
        if let Some(ref enable) = p.enable_path {
            if !enable.exists() {
                p.enable_path = None;
            }
        }
        true
    });

    inv.chips.retain(|c| c.path.exists());
}

/// Derive the label for a `*_input` path from its sibling `*_label` file.
fn label_for_input(input_path: &Path) -> Option<String> {
    let file = input_path.file_name()?.to_str()?;
    let base = file.strip_suffix("_input")?;
    let chip = input_path.parent()?;
    read_label(chip, base)
}

#[cfg(test)]
pub(crate) mod test_fixture {
    use std::fs;
    use std::path::{Path, PathBuf};

    /// Build a fake hwmon chip directory under `root` and return its path.
    pub fn make_chip(root: &Path, index: u32, name: &str) -> PathBuf {
        let chip = root.join(format!("hwmon{}", index));
        fs::create_dir_all(&chip).unwrap();
        fs::write(chip.join("name"), format!("{}\n", name)).unwrap();
        chip
    }

    pub fn add_temp(chip: &Path, n: u32, milli_c: i64, label: Option<&str>) {
        fs::write(chip.join(format!("temp{}_input", n)), format!("{}\n", milli_c)).unwrap();
        if let Some(l) = label {
            fs::write(chip.join(format!("temp{}_label", n)), format!("{}\n", l)).unwrap();
        }
    }

    pub fn add_fan(chip: &Path, n: u32, rpm: i64, label: Option<&str>) {
        fs::write(chip.join(format!("fan{}_input", n)), format!("{}\n", rpm)).unwrap();
        if let Some(l) = label {
            fs::write(chip.join(format!("fan{}_label", n)), format!("{}\n", l)).unwrap();
        }
    }

    pub fn add_pwm(chip: &Path, n: u32, raw: i64, enable: Option<i64>) {
        fs::write(chip.join(format!("pwm{}", n)), format!("{}\n", raw)).unwrap();
        if let Some(mode) = enable {
            fs::write(chip.join(format!("pwm{}_enable", n)), format!("{}\n", mode)).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixture::*;
    use super::*;
    use tempfile::TempDir;

    fn scan_dir(root: &Path) -> Inventory {
        scan(root, &VendorMap::builtin())
    }

    #[test]
    fn test_scan_enumerates_sensors() {
        let dir = TempDir::new().unwrap();
        let chip = make_chip(dir.path(), 0, "nct6798");
        add_temp(&chip, 1, 42000, Some("SYSTIN"));
        add_temp(&chip, 2, 55000, None);
        add_fan(&chip, 1, 900, Some("CPU Fan"));
        add_pwm(&chip, 1, 128, Some(2));
        add_pwm(&chip, 2, 255, None);

        let inv = scan_dir(dir.path());
        assert_eq!(inv.chips.len(), 1);
        assert_eq!(inv.chips[0].name, "nct6798");
        assert_eq!(inv.chips[0].vendor, "Nuvoton");

        assert_eq!(inv.temps.len(), 2);
        assert_eq!(inv.temps[0].label, "SYSTIN");
        assert_eq!(inv.temps[1].label, "temp2");

        assert_eq!(inv.fans.len(), 1);
        assert_eq!(inv.fans[0].label, "CPU Fan");

        assert_eq!(inv.pwms.len(), 2);
        assert!(inv.pwms[0].enable_path.is_some());
        assert!(inv.pwms[1].enable_path.is_none());
        assert_eq!(inv.pwms[0].max_raw, 255);
        // pwm1 falls back to fan1's label
        assert_eq!(inv.pwms[0].label, "CPU Fan");
        assert_eq!(inv.pwms[1].label, "pwm2");
    }

    #[test]
    fn test_scan_skips_empty_chip() {
        let dir = TempDir::new().unwrap();
        make_chip(dir.path(), 0, "empty");
        let inv = scan_dir(dir.path());
        assert!(inv.chips.is_empty());
    }

    #[test]
    fn test_scan_missing_root_is_empty() {
        let inv = scan_dir(Path::new("/nonexistent/hwmon/root"));
        assert!(inv.chips.is_empty());
    }

    #[test]
    fn test_refresh_drops_vanished_entries() {
        let dir = TempDir::new().unwrap();
        let chip = make_chip(dir.path(), 0, "k10temp");
        add_temp(&chip, 1, 50000, Some("Tctl"));
        add_fan(&chip, 1, 1200, None);
        add_pwm(&chip, 1, 100, Some(1));

        let mut inv = scan_dir(dir.path());
        assert_eq!(inv.temps.len(), 1);

        std::fs::remove_file(chip.join("temp1_input")).unwrap();
        std::fs::remove_file(chip.join("pwm1_enable")).unwrap();
        refresh_values(&mut inv);

        assert!(inv.temps.is_empty());
        assert_eq!(inv.fans.len(), 1);
        assert_eq!(inv.pwms.len(), 1);
        assert!(inv.pwms[0].enable_path.is_none());
    }

    #[test]
    fn test_refresh_rereads_labels() {
        let dir = TempDir::new().unwrap();
        let chip = make_chip(dir.path(), 0, "k10temp");
        add_temp(&chip, 1, 50000, Some("Tctl"));

        let mut inv = scan_dir(dir.path());
        assert_eq!(inv.temps[0].label, "Tctl");

        std::fs::write(chip.join("temp1_label"), "Tdie\n").unwrap();
        refresh_values(&mut inv);
        assert_eq!(inv.temps[0].label, "Tdie");
    }
}
