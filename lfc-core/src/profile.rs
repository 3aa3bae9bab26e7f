//! Profile validation and on-disk storage
//!
//! Profiles live as single JSON documents in the profiles directory
//! (`~/.config/LinuxFanControl/profiles/<name>.json`). Validation runs
//! against a live inventory before a profile is applied; a profile that
//! fails validation is rejected atomically and the previous one stays
//! active.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use lfc_error::{LfcError, Result};
use lfc_protocol::{CurveKind, FanCurve, Profile, PROFILE_SCHEMA};

use crate::hwmon::Inventory;

/// Validate a profile against the given inventory.
///
/// Checks, in order: unique curve names, per-kind curve invariants
/// (graph needs points, trigger needs `offC <= onC`, mix needs resolvable
/// references and no cycles), controls referencing known PWMs and curves,
/// and at most one control per PWM path. The first offending item aborts
/// with its reason.
pub fn validate_profile(profile: &Profile, inv: &Inventory) -> Result<()> {
    let mut names = HashSet::new();
    for curve in &profile.fan_curves {
        if curve.name.is_empty() {
            return Err(LfcError::InvalidCurve("curve with empty name".to_string()));
        }
        if !names.insert(curve.name.as_str()) {
            return Err(LfcError::InvalidCurve(format!(
                "duplicate curve name '{}'",
                curve.name
            )));
        }
        match curve.kind {
            CurveKind::Graph => {
                if curve.points.is_empty() {
                    return Err(LfcError::InvalidCurve(format!(
                        "graph curve '{}' has no points",
                        curve.name
                    )));
                }
            }
            CurveKind::Trigger => {
                if curve.off_c > curve.on_c {
                    return Err(LfcError::InvalidCurve(format!(
                        "trigger curve '{}' has offC {} > onC {}",
                        curve.name, curve.off_c, curve.on_c
                    )));
                }
            }
            CurveKind::Mix => {
                if !curve.points.is_empty() {
                    return Err(LfcError::InvalidCurve(format!(
                        "mix curve '{}' must not carry points",
                        curve.name
                    )));
                }
                if curve.temp_sensors.is_empty() {
                    return Err(LfcError::InvalidCurve(format!(
                        "mix curve '{}' references no curves",
                        curve.name
                    )));
                }
            }
        }
        // Sensor paths that no longer resolve are tolerated (hardware may
        // come and go); the engine treats them as missing samples.
        if curve.kind != CurveKind::Mix {
            for sensor in &curve.temp_sensors {
                if inv.find_temp(sensor).is_none() {
                    warn!(curve = %curve.name, sensor = %sensor, "temp sensor not in inventory");
                }
            }
        }
    }

    for curve in &profile.fan_curves {
        if curve.kind == CurveKind::Mix {
            for referenced in &curve.temp_sensors {
                if !names.contains(referenced.as_str()) {
                    return Err(LfcError::InvalidCurve(format!(
                        "mix curve '{}' references unknown curve '{}'",
                        curve.name, referenced
                    )));
                }
            }
        }
    }

    detect_cycles(&profile.fan_curves)?;

    let mut pwm_paths = HashSet::new();
    for control in &profile.controls {
        if inv.find_pwm(&control.pwm_path).is_none() {
            return Err(LfcError::InvalidArgument(format!(
                "control '{}' references unknown pwm '{}'",
                control.name, control.pwm_path
            )));
        }
        if !names.contains(control.curve_ref.as_str()) {
            return Err(LfcError::InvalidArgument(format!(
                "control '{}' references unknown curve '{}'",
                control.name, control.curve_ref
            )));
        }
        if !pwm_paths.insert(control.pwm_path.as_str()) {
            return Err(LfcError::InvalidArgument(format!(
                "more than one control for pwm '{}'",
                control.pwm_path
            )));
        }
        if !(0..=100).contains(&control.min_percent) {
            return Err(LfcError::InvalidArgument(format!(
                "control '{}' minPercent {} out of range",
                control.name, control.min_percent
            )));
        }
    }

    Ok(())
}

/// DFS over mix references; any back-edge is a cycle.
fn detect_cycles(curves: &[FanCurve]) -> Result<()> {
    fn visit<'a>(
        name: &'a str,
        curves: &'a [FanCurve],
        visiting: &mut HashSet<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<()> {
        if done.contains(name) {
            return Ok(());
        }
        if !visiting.insert(name) {
            return Err(LfcError::InvalidCurve(format!(
                "curve reference cycle through '{}'",
                name
            )));
        }
        if let Some(curve) = curves.iter().find(|c| c.name == name) {
            if curve.kind == CurveKind::Mix {
                for referenced in &curve.temp_sensors {
                    visit(referenced, curves, visiting, done)?;
                }
            }
        }
        visiting.remove(name);
        done.insert(name);
        Ok(())
    }

    let mut visiting = HashSet::new();
    let mut done = HashSet::new();
    for curve in curves {
        visit(&curve.name, curves, &mut visiting, &mut done)?;
    }
    Ok(())
}

// ============================================================================
// Disk storage
// ============================================================================

/// Reduce a profile name to a safe file stem.
fn sanitize_name(name: &str) -> Result<String> {
    let stem: String = name
        .trim()
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'))
        .collect();
    if stem.is_empty() {
        return Err(LfcError::invalid("profile name is empty"));
    }
    Ok(stem)
}

/// Path of the file backing a named profile.
pub fn profile_path(dir: &Path, name: &str) -> Result<PathBuf> {
    Ok(dir.join(format!("{}.json", sanitize_name(name)?)))
}

/// Load and parse a profile document.
pub fn load_profile(path: &Path) -> Result<Profile> {
    let text = fs::read_to_string(path).map_err(|e| LfcError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let profile: Profile = serde_json::from_str(&text)?;
    if !profile.schema.is_empty() && profile.schema != PROFILE_SCHEMA {
        warn!(
            path = %path.display(),
            schema = %profile.schema,
            "profile carries unexpected schema tag"
        );
    }
    Ok(profile)
}

/// Write a profile document, creating the profiles directory as needed.
pub fn save_profile(profile: &Profile, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| LfcError::FileWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let mut doc = profile.clone();
    doc.schema = PROFILE_SCHEMA.to_string();
    let text = serde_json::to_string_pretty(&doc)?;
    fs::write(path, text + "\n").map_err(|e| LfcError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Delete a named profile file.
pub fn delete_profile(dir: &Path, name: &str) -> Result<()> {
    let path = profile_path(dir, name)?;
    if !path.exists() {
        return Err(LfcError::not_found(format!("profile '{}'", name)));
    }
    fs::remove_file(&path).map_err(|e| LfcError::FileWrite { path, source: e })
}

/// Rename a profile file and the `name` field inside it.
pub fn rename_profile(dir: &Path, from: &str, to: &str) -> Result<()> {
    let src = profile_path(dir, from)?;
    let dst = profile_path(dir, to)?;
    if !src.exists() {
        return Err(LfcError::not_found(format!("profile '{}'", from)));
    }
    if dst.exists() {
        return Err(LfcError::invalid(format!("profile '{}' already exists", to)));
    }
    let mut profile = load_profile(&src)?;
    profile.name = to.to_string();
    save_profile(&profile, &dst)?;
    fs::remove_file(&src).map_err(|e| LfcError::FileWrite { path: src, source: e })
}

/// List `(file, name)` pairs for every readable profile in the directory.
pub fn list_profiles(dir: &Path) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match load_profile(&path) {
            Ok(profile) => {
                let name = if profile.name.is_empty() {
                    file.trim_end_matches(".json").to_string()
                } else {
                    profile.name
                };
                out.push((file, name));
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable profile"),
        }
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hwmon::test_fixture::*;
    use crate::hwmon::{scan, Inventory};
    use crate::vendormap::VendorMap;
    use lfc_protocol::{Control, CurvePoint, MixFunction};
    use tempfile::TempDir;

    fn fixture_inventory(dir: &TempDir) -> Inventory {
        let chip = make_chip(dir.path(), 0, "nct6798");
        add_temp(&chip, 1, 40000, Some("SYSTIN"));
        add_pwm(&chip, 1, 128, Some(2));
        add_pwm(&chip, 2, 128, Some(2));
        scan(dir.path(), &VendorMap::builtin())
    }

    fn graph_curve(name: &str, sensor: &str) -> FanCurve {
        FanCurve {
            name: name.to_string(),
            kind: CurveKind::Graph,
            mix: MixFunction::Avg,
            temp_sensors: vec![sensor.to_string()],
            points: vec![
                CurvePoint { temp_c: 30.0, percent: 20 },
                CurvePoint { temp_c: 70.0, percent: 100 },
            ],
            on_c: 0.0,
            off_c: 0.0,
        }
    }

    fn mix_curve(name: &str, refs: &[&str]) -> FanCurve {
        FanCurve {
            name: name.to_string(),
            kind: CurveKind::Mix,
            mix: MixFunction::Max,
            temp_sensors: refs.iter().map(|s| s.to_string()).collect(),
            points: vec![],
            on_c: 0.0,
            off_c: 0.0,
        }
    }

    fn control(name: &str, pwm: &str, curve: &str) -> Control {
        Control {
            name: name.to_string(),
            pwm_path: pwm.to_string(),
            curve_ref: curve.to_string(),
            min_percent: 0,
            enabled: true,
        }
    }

    #[test]
    fn test_valid_profile_passes() {
        let dir = TempDir::new().unwrap();
        let inv = fixture_inventory(&dir);
        let sensor = inv.temps[0].input_path.to_string_lossy().to_string();
        let pwm = inv.pwms[0].pwm_path.to_string_lossy().to_string();

        let mut p = Profile::named("test");
        p.fan_curves.push(graph_curve("cpu", &sensor));
        p.controls.push(control("case", &pwm, "cpu"));
        assert!(validate_profile(&p, &inv).is_ok());
    }

    #[test]
    fn test_unknown_pwm_rejected() {
        let dir = TempDir::new().unwrap();
        let inv = fixture_inventory(&dir);
        let sensor = inv.temps[0].input_path.to_string_lossy().to_string();

        let mut p = Profile::named("test");
        p.fan_curves.push(graph_curve("cpu", &sensor));
        p.controls.push(control("case", "/nonexistent", "cpu"));
        match validate_profile(&p, &inv) {
            Err(LfcError::InvalidArgument(msg)) => assert!(msg.contains("/nonexistent")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_pwm_control_rejected() {
        let dir = TempDir::new().unwrap();
        let inv = fixture_inventory(&dir);
        let sensor = inv.temps[0].input_path.to_string_lossy().to_string();
        let pwm = inv.pwms[0].pwm_path.to_string_lossy().to_string();

        let mut p = Profile::named("test");
        p.fan_curves.push(graph_curve("cpu", &sensor));
        p.controls.push(control("a", &pwm, "cpu"));
        p.controls.push(control("b", &pwm, "cpu"));
        assert!(validate_profile(&p, &inv).is_err());
    }

    #[test]
    fn test_graph_without_points_rejected() {
        let dir = TempDir::new().unwrap();
        let inv = fixture_inventory(&dir);
        let mut p = Profile::named("test");
        let mut c = graph_curve("cpu", "x");
        c.points.clear();
        p.fan_curves.push(c);
        assert!(matches!(
            validate_profile(&p, &inv),
            Err(LfcError::InvalidCurve(_))
        ));
    }

    #[test]
    fn test_trigger_thresholds_rejected_when_inverted() {
        let dir = TempDir::new().unwrap();
        let inv = fixture_inventory(&dir);
        let mut p = Profile::named("test");
        p.fan_curves.push(FanCurve {
            name: "t".to_string(),
            kind: CurveKind::Trigger,
            mix: MixFunction::Avg,
            temp_sensors: vec![],
            points: vec![],
            on_c: 50.0,
            off_c: 60.0,
        });
        assert!(validate_profile(&p, &inv).is_err());
    }

    #[test]
    fn test_mix_cycle_rejected() {
        let dir = TempDir::new().unwrap();
        let inv = fixture_inventory(&dir);
        let mut p = Profile::named("test");
        p.fan_curves.push(mix_curve("a", &["b"]));
        p.fan_curves.push(mix_curve("b", &["a"]));
        match validate_profile(&p, &inv) {
            Err(LfcError::InvalidCurve(msg)) => assert!(msg.contains("cycle")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_mix_unknown_reference_rejected() {
        let dir = TempDir::new().unwrap();
        let inv = fixture_inventory(&dir);
        let mut p = Profile::named("test");
        p.fan_curves.push(mix_curve("a", &["ghost"]));
        assert!(validate_profile(&p, &inv).is_err());
    }

    #[test]
    fn test_save_load_roundtrip_and_listing() {
        let dir = TempDir::new().unwrap();
        let profiles = dir.path().join("profiles");

        let mut p = Profile::named("Quiet Mode");
        p.fan_curves.push(graph_curve("cpu", "/sys/class/hwmon/hwmon0/temp1_input"));

        let path = profile_path(&profiles, &p.name).unwrap();
        save_profile(&p, &path).unwrap();

        let loaded = load_profile(&path).unwrap();
        assert_eq!(loaded.name, "Quiet Mode");
        assert_eq!(loaded.schema, PROFILE_SCHEMA);
        assert_eq!(loaded.fan_curves.len(), 1);

        let listing = list_profiles(&profiles);
        assert_eq!(listing, vec![("Quiet Mode.json".to_string(), "Quiet Mode".to_string())]);

        rename_profile(&profiles, "Quiet Mode", "Silent").unwrap();
        assert!(load_profile(&profile_path(&profiles, "Silent").unwrap()).is_ok());
        assert!(delete_profile(&profiles, "Quiet Mode").is_err());
        delete_profile(&profiles, "Silent").unwrap();
        assert!(list_profiles(&profiles).is_empty());
    }

    #[test]
    fn test_sanitize_rejects_empty() {
        assert!(profile_path(Path::new("/tmp"), "///").is_err());
    }
}
