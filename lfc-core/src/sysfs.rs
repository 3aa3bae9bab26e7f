//! Low-level sysfs text-file access
//!
//! All hwmon reads and writes funnel through here. Values cross the sysfs
//! boundary as decimal text; temperatures arrive in milli-degrees Celsius,
//! PWM duty as a raw value in [0, max_raw].
//!
//! Writes are best-effort from the engine's point of view: callers treat
//! permission errors as non-fatal and surface them through telemetry counters
//! rather than aborting the tick loop.

use std::fs;
use std::io;
use std::path::Path;

use lfc_error::{LfcError, Result};

/// Threshold above which a temperature reading is interpreted as
/// milli-degrees. Real hardware never reports 200 °C.
const MILLIDEGREE_THRESHOLD: f64 = 200.0;

fn map_read_err(path: &Path, e: io::Error) -> LfcError {
    match e.kind() {
        io::ErrorKind::NotFound => LfcError::FileNotFound(path.to_path_buf()),
        io::ErrorKind::PermissionDenied => {
            LfcError::PermissionDenied(path.display().to_string())
        }
        _ => LfcError::FileRead {
            path: path.to_path_buf(),
            source: e,
        },
    }
}

fn map_write_err(path: &Path, e: io::Error) -> LfcError {
    match e.kind() {
        io::ErrorKind::NotFound => LfcError::FileNotFound(path.to_path_buf()),
        io::ErrorKind::PermissionDenied => {
            LfcError::PermissionDenied(path.display().to_string())
        }
        _ => LfcError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        },
    }
}

/// Read a sysfs attribute, stripping the trailing newline.
pub fn read_text(path: &Path) -> Result<String> {
    let s = fs::read_to_string(path).map_err(|e| map_read_err(path, e))?;
    Ok(s.trim_end_matches(['\n', '\r']).to_string())
}

/// Read a sysfs attribute as a signed integer.
pub fn read_int(path: &Path) -> Result<i64> {
    let s = read_text(path)?;
    s.trim().parse::<i64>().map_err(|_| LfcError::TempRead {
        path: path.to_path_buf(),
        reason: format!("not an integer: {:?}", s),
    })
}

/// Write a sysfs attribute in a single truncating write.
pub fn write_text(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(|e| map_write_err(path, e))
}

/// Read a temperature in degrees Celsius. Values with a magnitude above
/// 200 are interpreted as milli-degrees and divided by 1000.
pub fn read_temp_c(path: &Path) -> Result<f64> {
    let raw = read_int(path)? as f64;
    if raw.abs() > MILLIDEGREE_THRESHOLD {
        Ok(raw / 1000.0)
    } else {
        Ok(raw)
    }
}

/// Read a fan tach input in RPM. Negative readings clamp to zero.
pub fn read_rpm(path: &Path) -> Result<i32> {
    Ok(read_int(path)?.max(0) as i32)
}

/// Read a PWM output as a percentage of `max_raw`, clamped to [0, 100].
pub fn read_percent(pwm_path: &Path, max_raw: i64) -> Result<i32> {
    let raw = read_int(pwm_path)?;
    let max = max_raw.max(1);
    let pct = ((raw as f64) * 100.0 / (max as f64)).round() as i32;
    Ok(pct.clamp(0, 100))
}

/// Write a PWM output given a percentage; the raw value is clamped to
/// [0, max_raw].
pub fn write_percent(pwm_path: &Path, percent: i32, max_raw: i64) -> Result<()> {
    let max = max_raw.max(1);
    let raw = ((percent as f64) * (max as f64) / 100.0).round() as i64;
    let raw = raw.clamp(0, max);
    write_text(pwm_path, &raw.to_string())
}

/// Read a pwmN_enable mode (0 = disabled, 1 = manual, 2 = automatic, ...).
pub fn read_enable(path: &Path) -> Result<i64> {
    read_int(path)
}

/// Write a pwmN_enable mode.
pub fn write_enable(path: &Path, mode: i64) -> Result<()> {
    write_text(path, &mode.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn file(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let p = dir.path().join(name);
        fs::write(&p, content).unwrap();
        p
    }

    #[test]
    fn test_read_text_strips_newline() {
        let dir = TempDir::new().unwrap();
        let p = file(&dir, "name", "nct6798\n");
        assert_eq!(read_text(&p).unwrap(), "nct6798");
    }

    #[test]
    fn test_read_temp_millidegrees() {
        let dir = TempDir::new().unwrap();
        let p = file(&dir, "temp1_input", "45500\n");
        assert!((read_temp_c(&p).unwrap() - 45.5).abs() < 1e-9);
    }

    #[test]
    fn test_read_temp_plain_degrees() {
        let dir = TempDir::new().unwrap();
        let p = file(&dir, "temp1_input", "47\n");
        assert!((read_temp_c(&p).unwrap() - 47.0).abs() < 1e-9);
    }

    #[test]
    fn test_read_percent_rounds_and_clamps() {
        let dir = TempDir::new().unwrap();
        let p = file(&dir, "pwm1", "128\n");
        assert_eq!(read_percent(&p, 255).unwrap(), 50);

        let over = file(&dir, "pwm2", "400\n");
        assert_eq!(read_percent(&over, 255).unwrap(), 100);
    }

    #[test]
    fn test_write_percent_clamps_raw() {
        let dir = TempDir::new().unwrap();
        let p = file(&dir, "pwm1", "0");
        write_percent(&p, 150, 255).unwrap();
        assert_eq!(fs::read_to_string(&p).unwrap(), "255");
        write_percent(&p, -10, 255).unwrap();
        assert_eq!(fs::read_to_string(&p).unwrap(), "0");
        write_percent(&p, 50, 255).unwrap();
        assert_eq!(fs::read_to_string(&p).unwrap(), "128");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent");
        match read_text(&missing) {
            Err(LfcError::FileNotFound(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_enable_roundtrip() {
        let dir = TempDir::new().unwrap();
        let p = file(&dir, "pwm1_enable", "2");
        assert_eq!(read_enable(&p).unwrap(), 2);
        write_enable(&p, 1).unwrap();
        assert_eq!(read_enable(&p).unwrap(), 1);
    }
}
