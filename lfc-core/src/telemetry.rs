//! Shared-memory telemetry publisher
//!
//! Publishes a compact JSON snapshot of engine/hwmon/gpu state. The primary
//! sink is a POSIX shared-memory object written atomically (truncate, mmap,
//! copy, msync, unmap); when SHM is unavailable the same bytes go to a plain
//! file. The blob is NUL-terminated so readers can treat the mapping as a C
//! string.
//!
//! Name normalization: a bare name becomes `/name` in the SHM namespace; a
//! path under `/dev/shm/` or any multi-component path is treated as a plain
//! file target instead.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use lfc_error::{LfcError, Result};
use lfc_gpu::GpuSample;
use lfc_protocol::Profile;

use crate::constants::shm;
use crate::hwmon::Inventory;

/// Where the snapshot bytes go.
#[derive(Debug)]
enum Sink {
    /// POSIX SHM object name (with leading '/'), plus a file fallback
    Shm { name: CString, fallback: PathBuf },
    /// Plain file only
    File(PathBuf),
}

/// Telemetry writer. Single writer: the daemon's control thread is the only
/// publisher.
pub struct ShmTelemetry {
    sink: Sink,
    last_json: Mutex<String>,
}

fn fallback_for(name: &str) -> PathBuf {
    PathBuf::from("/dev/shm").join(name.trim_start_matches('/'))
}

impl ShmTelemetry {
    /// Build a publisher from the `shmPath` config value.
    pub fn new(path_or_name: &str) -> Self {
        let sink = if path_or_name.is_empty() {
            let name = format!("/{}", shm::DEFAULT_NAME);
            Sink::Shm {
                fallback: fallback_for(&name),
                name: CString::new(name).expect("static shm name"),
            }
        } else if !path_or_name.starts_with('/') {
            // bare name -> SHM namespace
            let name = format!("/{}", path_or_name);
            Sink::Shm {
                fallback: fallback_for(&name),
                name: CString::new(name).unwrap_or_else(|_| {
                    CString::new(format!("/{}", shm::DEFAULT_NAME)).expect("static shm name")
                }),
            }
        } else if path_or_name.starts_with("/dev/shm/") || path_or_name[1..].contains('/') {
            // looks like a filesystem path
            Sink::File(PathBuf::from(path_or_name))
        } else {
            // "/name": already a SHM object name
            Sink::Shm {
                fallback: fallback_for(path_or_name),
                name: CString::new(path_or_name).unwrap_or_else(|_| {
                    CString::new(format!("/{}", shm::DEFAULT_NAME)).expect("static shm name")
                }),
            }
        };

        match &sink {
            Sink::Shm { name, fallback } => info!(
                shm = %name.to_string_lossy(),
                fallback = %fallback.display(),
                "telemetry sink"
            ),
            Sink::File(path) => info!(file = %path.display(), "telemetry sink (file only)"),
        }

        Self {
            sink,
            last_json: Mutex::new(String::new()),
        }
    }

    /// The most recently published document, for RPC readback.
    pub fn last(&self) -> Option<String> {
        let guard = self.last_json.lock();
        if guard.is_empty() {
            None
        } else {
            Some(guard.clone())
        }
    }

    /// Publish one snapshot. SHM failures fall back to the file sink; only a
    /// failure of both is an error.
    pub fn publish(&self, json_text: &str) -> Result<()> {
        let result = match &self.sink {
            Sink::Shm { name, fallback } => write_shm(name, json_text.as_bytes())
                .or_else(|e| {
                    debug!(error = %e, "shm publish failed, using file fallback");
                    write_file(fallback, json_text.as_bytes())
                }),
            Sink::File(path) => write_file(path, json_text.as_bytes()),
        };
        if result.is_ok() {
            *self.last_json.lock() = json_text.to_string();
        }
        result
    }

    /// Remove the published object/file on shutdown.
    pub fn close(&self) {
        match &self.sink {
            Sink::Shm { name, fallback } => {
                // SAFETY: name is a valid NUL-terminated C string owned by self.
                unsafe {
                    libc::shm_unlink(name.as_ptr());
                }
                let _ = std::fs::remove_file(fallback);
            }
            Sink::File(path) => {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let mut payload = Vec::with_capacity(bytes.len() + 1);
    payload.extend_from_slice(bytes);
    payload.push(0);
    std::fs::write(path, payload).map_err(|e| LfcError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })
}

fn write_shm(name: &CString, bytes: &[u8]) -> Result<()> {
    let len = bytes.len() + 1;

    // SAFETY: shm_open takes a valid NUL-terminated name; the returned fd is
    // checked before use and closed on every path below.
    let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o644) };
    if fd < 0 {
        return Err(LfcError::internal(format!(
            "shm_open({}) failed: {}",
            name.to_string_lossy(),
            std::io::Error::last_os_error()
        )));
    }

    // SAFETY: fd is a valid shared-memory descriptor; ftruncate sizes the
    // object to hold the payload plus the terminating NUL.
    if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
        let err = std::io::Error::last_os_error();
        // SAFETY: fd is valid and owned here.
        unsafe { libc::close(fd) };
        return Err(LfcError::internal(format!("ftruncate failed: {}", err)));
    }

    // SAFETY: mapping `len` bytes of a freshly truncated object with
    // PROT_READ|PROT_WRITE and MAP_SHARED; the result is checked against
    // MAP_FAILED before any access.
    let map = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if map == libc::MAP_FAILED {
        let err = std::io::Error::last_os_error();
        // SAFETY: fd is valid and owned here.
        unsafe { libc::close(fd) };
        return Err(LfcError::internal(format!("mmap failed: {}", err)));
    }

    // SAFETY: map points to `len` writable bytes; bytes.len() + 1 == len.
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), map as *mut u8, bytes.len());
        *(map as *mut u8).add(bytes.len()) = 0;
        libc::msync(map, len, libc::MS_ASYNC);
        libc::munmap(map, len);
        libc::close(fd);
    }

    Ok(())
}

// ============================================================================
// Snapshot builder
// ============================================================================

fn set_opt<T: Into<Value>>(obj: &mut Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(v) = value {
        obj.insert(key.to_string(), v.into());
    }
}

fn gpu_json(g: &GpuSample) -> Value {
    let mut obj = Map::new();
    obj.insert("vendor".to_string(), json!(g.vendor.as_str()));
    obj.insert("index".to_string(), json!(g.index));
    obj.insert("name".to_string(), json!(g.name));
    obj.insert("pci".to_string(), json!(g.pci_bus_id));
    obj.insert("drm".to_string(), json!(g.drm_card));
    obj.insert("hwmon".to_string(), json!(g.hwmon_path));
    obj.insert("hasFanTach".to_string(), json!(g.has_fan_tach as i32));
    obj.insert("hasFanPwm".to_string(), json!(g.has_fan_pwm as i32));
    set_opt(&mut obj, "fanRpm", g.fan_rpm);
    set_opt(&mut obj, "tempEdgeC", g.temp_edge_c);
    set_opt(&mut obj, "tempHotspotC", g.temp_hotspot_c);
    set_opt(&mut obj, "tempMemoryC", g.temp_memory_c);
    Value::Object(obj)
}

/// Build the telemetry JSON document.
pub fn build_snapshot(
    inv: &Inventory,
    gpus: &[GpuSample],
    profile: &Profile,
    engine_enabled: bool,
) -> Value {
    let chips: Vec<Value> = inv
        .chips
        .iter()
        .map(|c| {
            json!({
                "name": c.name,
                "vendor": c.vendor,
                "hwmonPath": c.path.to_string_lossy(),
            })
        })
        .collect();

    let temps: Vec<Value> = inv
        .temps
        .iter()
        .map(|t| {
            json!({
                "path": t.input_path.to_string_lossy(),
                "label": t.label,
                "chipPath": t.chip_path.to_string_lossy(),
            })
        })
        .collect();

    let fans: Vec<Value> = inv
        .fans
        .iter()
        .map(|f| {
            json!({
                "path": f.input_path.to_string_lossy(),
                "label": f.label,
                "chipPath": f.chip_path.to_string_lossy(),
            })
        })
        .collect();

    let pwms: Vec<Value> = inv
        .pwms
        .iter()
        .map(|p| {
            json!({
                "path": p.pwm_path.to_string_lossy(),
                "pathEnable": p
                    .enable_path
                    .as_ref()
                    .map(|e| e.to_string_lossy().to_string())
                    .unwrap_or_default(),
                "pwmMax": p.max_raw,
                "label": p.label,
                "chipPath": p.chip_path.to_string_lossy(),
            })
        })
        .collect();

    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "engineEnabled": engine_enabled,
        "hwmon": {
            "chips": chips,
            "temps": temps,
            "fans": fans,
            "pwms": pwms,
        },
        "gpus": gpus.iter().map(gpu_json).collect::<Vec<_>>(),
        "profile": {
            "name": profile.name,
            "description": profile.description,
            "schema": profile.schema,
            "curveCount": profile.fan_curves.len(),
            "controlCount": profile.controls.len(),
        },
    })
}
