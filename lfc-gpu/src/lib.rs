//! GPU sample enrichment over hwmon
//!
//! Recognizes GPU hwmon chips by driver name (amdgpu, nouveau, i915, xe) and
//! annotates telemetry samples with vendor, temperatures, fan RPM and PWM
//! capability. Everything is read from sysfs; vendor SDKs are out of scope.
//!
//! AMD exposes labeled temperature channels (`edge`, `junction`, `mem`);
//! other drivers fall back to positional channels.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, trace};

use lfc_error::Result;

/// GPU vendor classification by hwmon driver name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GpuVendor {
    Amd,
    Nvidia,
    Intel,
}

impl GpuVendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            GpuVendor::Amd => "AMD",
            GpuVendor::Nvidia => "NVIDIA",
            GpuVendor::Intel => "Intel",
        }
    }

    fn from_chip_name(name: &str) -> Option<Self> {
        match name {
            "amdgpu" | "radeon" => Some(GpuVendor::Amd),
            "nouveau" => Some(GpuVendor::Nvidia),
            "i915" | "xe" => Some(GpuVendor::Intel),
            _ => None,
        }
    }
}

/// One GPU's telemetry annotation.
#[derive(Debug, Clone, Serialize)]
pub struct GpuSample {
    pub vendor: GpuVendor,
    pub index: u32,
    pub name: String,
    pub pci_bus_id: String,
    pub drm_card: String,
    pub hwmon_path: String,
    pub has_fan_tach: bool,
    pub has_fan_pwm: bool,
    pub fan_rpm: Option<i32>,
    pub temp_edge_c: Option<f64>,
    pub temp_hotspot_c: Option<f64>,
    pub temp_memory_c: Option<f64>,
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_temp_c(path: &Path) -> Option<f64> {
    let raw: f64 = read_trimmed(path)?.parse().ok()?;
    if raw.abs() > 200.0 {
        Some(raw / 1000.0)
    } else {
        Some(raw)
    }
}

/// PCI bus id ("0000:0b:00.0") from the chip's resolved device path.
fn pci_bus_id(chip_path: &Path) -> String {
    let Ok(device) = fs::canonicalize(chip_path.join("device")) else {
        return String::new();
    };
    for component in device.iter().rev() {
        let s = component.to_string_lossy();
        let bytes = s.as_bytes();
        // dddd:bb:dd.f
        if bytes.len() == 12
            && bytes[4] == b':'
            && bytes[7] == b':'
            && bytes[10] == b'.'
            && s.chars()
                .enumerate()
                .all(|(i, c)| matches!(i, 4 | 7 | 10) || c.is_ascii_hexdigit())
        {
            return s.to_string();
        }
    }
    String::new()
}

/// DRM card name ("card0") when the device exposes one.
fn drm_card(chip_path: &Path) -> String {
    let drm_dir = chip_path.join("device/drm");
    let Ok(entries) = fs::read_dir(drm_dir) else {
        return String::new();
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("card") {
            return name;
        }
    }
    String::new()
}

/// Resolve a labeled temperature channel, e.g. the channel whose
/// `tempN_label` reads "edge".
fn labeled_temp(chip_path: &Path, wanted: &str) -> Option<f64> {
    for n in 1..=8 {
        let label_path = chip_path.join(format!("temp{}_label", n));
        if read_trimmed(&label_path).as_deref() == Some(wanted) {
            return read_temp_c(&chip_path.join(format!("temp{}_input", n)));
        }
    }
    None
}

fn sample_chip(chip_path: &Path, index: u32, name: &str, vendor: GpuVendor) -> GpuSample {
    let fan_input = chip_path.join("fan1_input");
    let pwm = chip_path.join("pwm1");

    let (edge, hotspot, memory) = match vendor {
        GpuVendor::Amd => (
            labeled_temp(chip_path, "edge")
                .or_else(|| read_temp_c(&chip_path.join("temp1_input"))),
            labeled_temp(chip_path, "junction"),
            labeled_temp(chip_path, "mem"),
        ),
        _ => (
            read_temp_c(&chip_path.join("temp1_input")),
            read_temp_c(&chip_path.join("temp2_input")),
            read_temp_c(&chip_path.join("temp3_input")),
        ),
    };

    GpuSample {
        vendor,
        index,
        name: name.to_string(),
        pci_bus_id: pci_bus_id(chip_path),
        drm_card: drm_card(chip_path),
        hwmon_path: chip_path.to_string_lossy().to_string(),
        has_fan_tach: fan_input.exists(),
        has_fan_pwm: pwm.exists(),
        fan_rpm: read_trimmed(&fan_input).and_then(|s| s.parse().ok()),
        temp_edge_c: edge,
        temp_hotspot_c: hotspot,
        temp_memory_c: memory,
    }
}

/// Walk the hwmon tree and sample every recognized GPU chip.
pub fn sample_gpus(hwmon_root: &Path) -> Result<Vec<GpuSample>> {
    let mut samples = Vec::new();
    let Ok(entries) = fs::read_dir(hwmon_root) else {
        debug!(root = %hwmon_root.display(), "hwmon root not readable, no gpus");
        return Ok(samples);
    };

    let mut chip_dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    chip_dirs.sort();

    let mut index = 0u32;
    for chip_path in chip_dirs {
        let Some(name) = read_trimmed(&chip_path.join("name")) else {
            continue;
        };
        let Some(vendor) = GpuVendor::from_chip_name(&name) else {
            continue;
        };
        trace!(chip = %name, path = %chip_path.display(), "sampling gpu chip");
        samples.push(sample_chip(&chip_path, index, &name, vendor));
        index += 1;
    }

    debug!(count = samples.len(), "gpu sampling complete");
    Ok(samples)
}
