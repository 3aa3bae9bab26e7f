//! FanControl.Releases profile import
//!
//! Maps a third-party FanControl configuration document onto a native
//! profile: one graph curve plus one control per source `Controls[]` entry,
//! with temperature and PWM identifiers resolved against the live inventory
//! by case-insensitive substring match. The mapping itself is a pure
//! function; `run_import` wraps it in the staged job pipeline.

use std::fs;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use lfc_core::hwmon::Inventory;
use lfc_core::profile::validate_profile;
use lfc_core::sysfs;
use lfc_error::{LfcError, Result};
use lfc_protocol::{Control, CurveKind, CurvePoint, FanCurve, MixFunction, Profile};

use crate::jobs::JobSlot;

/// Parameters of a `profile.importAs` request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub validate_detect: bool,
    #[serde(default)]
    pub rpm_min: i32,
    #[serde(default)]
    pub timeout_ms: u64,
}

/// Run the import pipeline inside a job slot: read, parse, map, validate,
/// finish. Cancellation and the overall deadline are checked between stages.
pub fn run_import(slot: &JobSlot, req: &ImportRequest, inv: &Inventory) {
    let started = Instant::now();
    let deadline = Duration::from_millis(if req.timeout_ms == 0 {
        60_000
    } else {
        req.timeout_ms
    });

    macro_rules! stage {
        ($pct:expr, $msg:expr) => {
            if slot.canceled() {
                return;
            }
            if started.elapsed() > deadline {
                slot.fail("import timed out");
                return;
            }
            slot.set_progress($pct, $msg);
        };
    }

    stage!(5, "read");
    let text = match fs::read_to_string(&req.path) {
        Ok(t) => t,
        Err(e) => {
            slot.fail(format!("cannot read {}: {}", req.path, e));
            return;
        }
    };

    stage!(20, "parse");
    let doc: Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            slot.fail(format!("invalid json: {}", e));
            return;
        }
    };

    stage!(50, "map");
    let mut profile = match map_document(&doc, inv, &req.name) {
        Ok(p) => p,
        Err(e) => {
            slot.fail(e.to_string());
            return;
        }
    };

    if req.validate_detect {
        stage!(70, "check tach response");
        let before = profile.controls.len();
        retain_controls_with_live_fans(&mut profile, inv, req.rpm_min);
        if profile.controls.len() < before {
            warn!(
                dropped = before - profile.controls.len(),
                "controls without live tach dropped"
            );
        }
        if profile.controls.is_empty() {
            slot.fail(format!("no mapped pwm shows a fan above {} rpm", req.rpm_min));
            return;
        }
    }

    stage!(85, "validate");
    if let Err(e) = validate_profile(&profile, inv) {
        slot.fail(format!("mapped profile invalid: {}", e));
        return;
    }

    slot.finish(profile);
}

/// Keep only controls whose PWM's chip carries a fan spinning at or above
/// `rpm_min` right now.
fn retain_controls_with_live_fans(profile: &mut Profile, inv: &Inventory, rpm_min: i32) {
    profile.controls.retain(|control| {
        let Some(pwm) = inv.find_pwm(&control.pwm_path) else {
            return false;
        };
        inv.fans
            .iter()
            .filter(|f| f.chip_path == pwm.chip_path)
            .any(|f| sysfs::read_rpm(&f.input_path).unwrap_or(0) >= rpm_min)
    });
}

// ============================================================================
// Pure mapping
// ============================================================================

fn lower(s: &str) -> String {
    s.to_ascii_lowercase()
}

/// Resolve a source temperature identifier to a sensor path by substring
/// match against path, basename and label.
fn match_temp(inv: &Inventory, ident: &str) -> Option<String> {
    let id = lower(ident.trim());
    if id.is_empty() {
        return None;
    }
    for t in &inv.temps {
        let full = lower(&t.input_path.to_string_lossy());
        let base = t
            .input_path
            .file_name()
            .map(|n| lower(&n.to_string_lossy()))
            .unwrap_or_default();
        let label = lower(&t.label);
        if full.contains(&id) || base.contains(&id) || (!label.is_empty() && label.contains(&id)) {
            return Some(t.input_path.to_string_lossy().to_string());
        }
    }
    None
}

/// Resolve a source PWM identifier, falling back to positional order.
fn match_pwm(inv: &Inventory, ident: &str, position: usize) -> Option<String> {
    let id = lower(ident.trim());
    if !id.is_empty() {
        for p in &inv.pwms {
            let full = lower(&p.pwm_path.to_string_lossy());
            let base = p
                .pwm_path
                .file_name()
                .map(|n| lower(&n.to_string_lossy()))
                .unwrap_or_default();
            let label = lower(&p.label);
            if full.contains(&id)
                || base.contains(&id)
                || (!label.is_empty() && label.contains(&id))
            {
                return Some(p.pwm_path.to_string_lossy().to_string());
            }
        }
    }
    inv.pwms
        .get(position)
        .map(|p| p.pwm_path.to_string_lossy().to_string())
}

/// Accept the point spellings seen in the wild: `{t,p}`, `{temp,percent}`,
/// `{x,y}`, `{Temperature,Value}`, `{TemperatureC,Percent}`.
fn parse_points(arr: &Value) -> Vec<CurvePoint> {
    let mut out = Vec::new();
    let Some(items) = arr.as_array() else {
        return out;
    };
    for pt in items {
        let temp_c = ["t", "temp", "x", "TemperatureC", "Temperature"]
            .iter()
            .find_map(|k| pt.get(k).and_then(Value::as_f64))
            .unwrap_or(0.0);
        let percent = ["p", "percent", "y", "Percent", "Value"]
            .iter()
            .find_map(|k| pt.get(k).and_then(Value::as_i64))
            .unwrap_or(0) as i32;
        out.push(CurvePoint {
            temp_c,
            percent: percent.clamp(0, 100),
        });
    }
    out
}

/// Temperature identifiers of a source curve object.
fn curve_temp_idents(curve: &Value) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(temps) = curve.get("Temps").and_then(Value::as_array) {
        for t in temps {
            if let Some(s) = t.as_str() {
                out.push(s.to_string());
            } else if let Some(s) = t.get("Id").and_then(Value::as_str) {
                out.push(s.to_string());
            } else if let Some(s) = t.get("Name").and_then(Value::as_str) {
                out.push(s.to_string());
            }
        }
    } else if let Some(s) = curve.get("Temp").and_then(Value::as_str) {
        out.push(s.to_string());
    } else if let Some(sel) = curve.get("SelectedTempSource") {
        for key in ["Name", "Identifier"] {
            if let Some(s) = sel.get(key).and_then(Value::as_str) {
                out.push(s.to_string());
                break;
            }
        }
    }
    out
}

/// Map a FanControl.Releases document onto a native profile.
pub fn map_document(doc: &Value, inv: &Inventory, name: &str) -> Result<Profile> {
    let controls = doc
        .get("Controls")
        .or_else(|| doc.get("controllers"))
        .and_then(Value::as_array)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| LfcError::invalid("no Controls in source config"))?;

    let mut profile = Profile::named(name);
    let mut used_names: std::collections::HashSet<String> = std::collections::HashSet::new();

    for (position, ctrl) in controls.iter().enumerate() {
        let ctrl_name = ctrl
            .get("Name")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("control{}", position + 1));

        let pwm_ident = ctrl
            .get("Identifier")
            .and_then(Value::as_str)
            .or_else(|| {
                ctrl.get("Output")
                    .and_then(|o| o.get("Name"))
                    .and_then(Value::as_str)
            })
            .unwrap_or("");

        let Some(pwm_path) = match_pwm(inv, pwm_ident, position) else {
            warn!(control = %ctrl_name, ident = %pwm_ident, "no pwm match, skipping control");
            continue;
        };

        let empty = Value::Null;
        let curve_json = ctrl
            .get("Curve")
            .or_else(|| ctrl.get("curve"))
            .unwrap_or(&empty);

        let temp_sensors: Vec<String> = curve_temp_idents(curve_json)
            .iter()
            .filter_map(|ident| match_temp(inv, ident))
            .collect();
        if temp_sensors.is_empty() {
            warn!(control = %ctrl_name, "no temp source resolved, skipping control");
            continue;
        }

        let points = curve_json
            .get("Points")
            .or_else(|| curve_json.get("Table"))
            .map(parse_points)
            .unwrap_or_default();
        if points.is_empty() {
            warn!(control = %ctrl_name, "curve without points, skipping control");
            continue;
        }

        let min_percent = curve_json
            .get("Minimum")
            .or_else(|| curve_json.get("Min"))
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .clamp(0, 100) as i32;

        // Curve names must be unique within the profile.
        let mut curve_name = curve_json
            .get("Name")
            .and_then(Value::as_str)
            .unwrap_or(&ctrl_name)
            .to_string();
        let base = curve_name.clone();
        let mut n = 1;
        while !used_names.insert(curve_name.clone()) {
            n += 1;
            curve_name = format!("{} ({})", base, n);
        }

        debug!(control = %ctrl_name, pwm = %pwm_path, curve = %curve_name, "mapped control");

        profile.fan_curves.push(FanCurve {
            name: curve_name.clone(),
            kind: CurveKind::Graph,
            mix: MixFunction::Max,
            temp_sensors,
            points,
            on_c: 0.0,
            off_c: 0.0,
        });
        profile.controls.push(Control {
            name: ctrl_name,
            pwm_path,
            curve_ref: curve_name,
            min_percent,
            enabled: true,
        });
    }

    if profile.controls.is_empty() {
        return Err(LfcError::invalid(
            "no source control could be mapped to local hardware",
        ));
    }
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lfc_core::hwmon::scan;
    use lfc_core::vendormap::VendorMap;
    use serde_json::json;
    use tempfile::TempDir;

    fn fixture(dir: &TempDir) -> Inventory {
        let chip = dir.path().join("hwmon0");
        fs::create_dir_all(&chip).unwrap();
        fs::write(chip.join("name"), "nct6798\n").unwrap();
        fs::write(chip.join("temp1_input"), "41000\n").unwrap();
        fs::write(chip.join("temp1_label"), "CPU Temp\n").unwrap();
        fs::write(chip.join("fan1_input"), "880\n").unwrap();
        fs::write(chip.join("pwm1"), "120\n").unwrap();
        fs::write(chip.join("pwm1_enable"), "2\n").unwrap();
        scan(dir.path(), &VendorMap::builtin())
    }

    fn source_doc() -> Value {
        json!({
            "Main": {"Theme": "Dark"},
            "Controls": [
                {
                    "Name": "CPU Fan Control",
                    "Identifier": "pwm1",
                    "Curve": {
                        "Name": "CPU Curve",
                        "SelectedTempSource": {"Name": "CPU Temp"},
                        "Points": [
                            {"Temperature": 30.0, "Value": 20},
                            {"Temperature": 75.0, "Value": 100}
                        ],
                        "Minimum": 10
                    }
                }
            ]
        })
    }

    #[test]
    fn test_map_minimal_document() {
        let dir = TempDir::new().unwrap();
        let inv = fixture(&dir);

        let p = map_document(&source_doc(), &inv, "Imported").unwrap();
        assert_eq!(p.name, "Imported");
        assert_eq!(p.controls.len(), 1);
        assert_eq!(p.fan_curves.len(), 1);
        assert_eq!(p.fan_curves[0].name, "CPU Curve");
        assert_eq!(p.fan_curves[0].points.len(), 2);
        assert_eq!(p.controls[0].curve_ref, "CPU Curve");
        assert_eq!(p.controls[0].min_percent, 10);
        assert!(p.controls[0].pwm_path.ends_with("pwm1"));
        assert!(p.fan_curves[0].temp_sensors[0].ends_with("temp1_input"));

        validate_profile(&p, &inv).unwrap();
    }

    #[test]
    fn test_no_controls_is_invalid() {
        let dir = TempDir::new().unwrap();
        let inv = fixture(&dir);
        assert!(map_document(&json!({"Main": {}}), &inv, "x").is_err());
        assert!(map_document(&json!({"Controls": []}), &inv, "x").is_err());
    }

    #[test]
    fn test_point_spelling_variants() {
        let pts = parse_points(&json!([
            {"t": 20.0, "p": 10},
            {"x": 40.0, "y": 50},
            {"TemperatureC": 60.0, "Percent": 150}
        ]));
        assert_eq!(pts.len(), 3);
        assert_eq!(pts[0].percent, 10);
        assert_eq!(pts[1].temp_c, 40.0);
        // out-of-range duty clamps
        assert_eq!(pts[2].percent, 100);
    }

    #[test]
    fn test_run_import_job_to_done() {
        let dir = TempDir::new().unwrap();
        let inv = fixture(&dir);
        let src = dir.path().join("fancontrol.json");
        fs::write(&src, serde_json::to_string(&source_doc()).unwrap()).unwrap();

        let mgr = crate::jobs::JobManager::new();
        let slot = mgr.create();
        let req = ImportRequest {
            path: src.to_string_lossy().to_string(),
            name: "FromFC".to_string(),
            validate_detect: true,
            rpm_min: 500,
            timeout_ms: 10_000,
        };
        run_import(&slot, &req, &inv);

        let st = slot.status();
        assert_eq!(st.state, lfc_protocol::JobState::Done);
        assert_eq!(st.profile_name, "FromFC");
    }

    #[test]
    fn test_run_import_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let inv = fixture(&dir);
        let mgr = crate::jobs::JobManager::new();
        let slot = mgr.create();
        let req = ImportRequest {
            path: dir.path().join("absent.json").to_string_lossy().to_string(),
            name: "x".to_string(),
            validate_detect: false,
            rpm_min: 0,
            timeout_ms: 0,
        };
        run_import(&slot, &req, &inv);
        assert_eq!(slot.status().state, lfc_protocol::JobState::Error);
    }

    #[test]
    fn test_canceled_job_stops_early() {
        let dir = TempDir::new().unwrap();
        let inv = fixture(&dir);
        let mgr = crate::jobs::JobManager::new();
        let slot = mgr.create();
        mgr.cancel(slot.id()).unwrap();

        let req = ImportRequest {
            path: "/does/not/matter".to_string(),
            name: "x".to_string(),
            validate_detect: false,
            rpm_min: 0,
            timeout_ms: 0,
        };
        run_import(&slot, &req, &inv);
        // state stays at the canceled error, untouched by the worker
        let st = slot.status();
        assert_eq!(st.state, lfc_protocol::JobState::Error);
        assert_eq!(st.error, "canceled");
    }

    #[test]
    fn test_validate_detect_drops_dead_fans() {
        let dir = TempDir::new().unwrap();
        let inv = fixture(&dir);
        let src = dir.path().join("fancontrol.json");
        fs::write(&src, serde_json::to_string(&source_doc()).unwrap()).unwrap();

        let mgr = crate::jobs::JobManager::new();
        let slot = mgr.create();
        let req = ImportRequest {
            path: src.to_string_lossy().to_string(),
            name: "x".to_string(),
            validate_detect: true,
            rpm_min: 5000, // far above the fixture's 880 rpm
            timeout_ms: 0,
        };
        run_import(&slot, &req, &inv);
        let st = slot.status();
        assert_eq!(st.state, lfc_protocol::JobState::Error);
        assert!(st.error.contains("5000"));
    }
}
