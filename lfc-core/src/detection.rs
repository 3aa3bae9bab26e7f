//! PWM-to-fan detection worker
//!
//! Non-blocking worker that discovers which tach reacts to which PWM output.
//! Two flows share the worker:
//!
//! - **ramp**: each PWM is stepped from `rampStartPercent` to
//!   `rampEndPercent` while tach candidates are sampled; the peak RPM per
//!   PWM is recorded.
//! - **couple**: each PWM is held at 100% and temperature snapshots from
//!   before/after are compared; the sensor with the largest |deltaT| above
//!   `coupleMinDeltaC` is reported as coupled.
//!
//! Original enable mode and raw duty are captured before the first write and
//! restored on completion *and* on abort. While the worker runs it raises the
//! engine's control-hold flag so the tick loop stays off the hardware.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use lfc_protocol::DetectionStatus;

use crate::constants::detection as det;
use crate::constants::pwm::ENABLE_MANUAL;
use crate::hwmon::{Fan, Inventory, Pwm};
use crate::sysfs;

/// Which measurement flow to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectMode {
    #[default]
    Ramp,
    Couple,
}

/// Tuning knobs accepted by `detect.start`.
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub mode: DetectMode,
    pub settle_ms: u64,
    pub spinup_poll_ms: u64,
    pub ramp_start_percent: i32,
    pub ramp_end_percent: i32,
    pub min_valid_rpm: i32,
    pub couple_hold_ms: u64,
    pub couple_min_delta_c: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            mode: DetectMode::Ramp,
            settle_ms: det::SETTLE_MS,
            spinup_poll_ms: det::SPINUP_POLL_MS,
            ramp_start_percent: det::RAMP_START_PERCENT,
            ramp_end_percent: det::RAMP_END_PERCENT,
            min_valid_rpm: det::MIN_VALID_RPM,
            couple_hold_ms: det::COUPLE_HOLD_MS,
            couple_min_delta_c: det::COUPLE_MIN_DELTA_C,
        }
    }
}

/// One PWM-to-sensor coupling found by the couple flow.
#[derive(Debug, Clone)]
pub struct Coupling {
    pub pwm_path: String,
    pub temp_path: String,
    pub delta_c: f64,
}

/// Captured pre-detection state of one PWM.
#[derive(Debug, Clone)]
struct PwmOriginal {
    pwm: Pwm,
    enable_mode: Option<i64>,
    raw: i64,
}

struct Shared {
    cfg: DetectionConfig,
    running: AtomicBool,
    stop: AtomicBool,
    current: AtomicUsize,
    phase: AtomicU8,
    total: usize,
    pwm_paths: Vec<String>,
    peaks: Mutex<Vec<i32>>,
    couplings: Mutex<Vec<Coupling>>,
    error: Mutex<Option<String>>,
}

/// Handle to a detection run. Dropping without `abort` leaves the worker to
/// finish and restore on its own.
pub struct Detection {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Detection {
    /// Spawn the worker over a snapshot of the inventory. `hold` is the
    /// engine's control-hold flag; it is raised for the duration of the run.
    pub fn start(inv: Inventory, cfg: DetectionConfig, hold: Arc<AtomicBool>) -> Self {
        let total = inv.pwms.len();
        let shared = Arc::new(Shared {
            cfg: cfg.clone(),
            running: AtomicBool::new(true),
            stop: AtomicBool::new(false),
            current: AtomicUsize::new(0),
            phase: AtomicU8::new(0),
            total,
            pwm_paths: inv
                .pwms
                .iter()
                .map(|p| p.pwm_path.to_string_lossy().to_string())
                .collect(),
            peaks: Mutex::new(vec![0; total]),
            couplings: Mutex::new(Vec::new()),
            error: Mutex::new(None),
        });

        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("lfc-detect".to_string())
            .spawn(move || worker(inv, worker_shared, hold))
            .expect("failed to spawn detection thread");

        info!(pwms = total, mode = ?cfg.mode, "detection started");
        Self {
            shared,
            handle: Some(handle),
        }
    }

    pub fn running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Request cooperative cancellation and wait for the restore pass.
    pub fn abort(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Wait for a finished worker without canceling it.
    pub fn join(&mut self) {
        if !self.running() {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    pub fn status(&self) -> DetectionStatus {
        let error = self.shared.error.lock().clone().unwrap_or_default();
        let peaks = self.shared.peaks.lock();
        let mapped_pwms = peaks
            .iter()
            .filter(|&&rpm| rpm >= self.shared.cfg.min_valid_rpm)
            .count();
        DetectionStatus {
            running: self.running(),
            current_index: self.shared.current.load(Ordering::Acquire),
            total: self.shared.total,
            phase: self.shared.phase.load(Ordering::Acquire),
            ok: error.is_empty(),
            error,
            mapped_pwms,
            mapped_temps: self.shared.couplings.lock().len(),
        }
    }

    /// Peak RPM observed per PWM, in inventory order.
    pub fn peaks(&self) -> Vec<i32> {
        self.shared.peaks.lock().clone()
    }

    /// `(pwm_path, peak_rpm)` pairs, in inventory order.
    pub fn results(&self) -> Vec<(String, i32)> {
        self.shared
            .pwm_paths
            .iter()
            .cloned()
            .zip(self.shared.peaks.lock().iter().copied())
            .collect()
    }

    pub fn couplings(&self) -> Vec<Coupling> {
        self.shared.couplings.lock().clone()
    }
}

/// Sleep in small slices so cancellation is honored promptly. Returns false
/// when the stop flag was raised.
fn sleep_cancelable(ms: u64, stop: &AtomicBool) -> bool {
    let mut remaining = ms;
    while remaining > 0 {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let slice = remaining.min(det::SLEEP_SLICE_MS);
        thread::sleep(Duration::from_millis(slice));
        remaining -= slice;
    }
    !stop.load(Ordering::Acquire)
}

fn capture_originals(pwms: &[Pwm]) -> Vec<PwmOriginal> {
    pwms.iter()
        .map(|p| PwmOriginal {
            enable_mode: p
                .enable_path
                .as_ref()
                .and_then(|ep| sysfs::read_enable(ep).ok()),
            raw: sysfs::read_int(&p.pwm_path).unwrap_or(0),
            pwm: p.clone(),
        })
        .collect()
}

fn restore_originals(originals: &[PwmOriginal]) {
    for orig in originals {
        if let Err(e) = sysfs::write_text(&orig.pwm.pwm_path, &orig.raw.to_string()) {
            warn!(path = %orig.pwm.pwm_path.display(), error = %e, "failed to restore pwm duty");
        }
        if let (Some(enable_path), Some(mode)) = (&orig.pwm.enable_path, orig.enable_mode) {
            if let Err(e) = sysfs::write_enable(enable_path, mode) {
                warn!(path = %enable_path.display(), error = %e, "failed to restore enable mode");
            }
        }
    }
}

/// Tach candidates for a PWM: fans on the same chip, falling back to every
/// fan when the chip carries none.
fn tach_candidates<'a>(inv: &'a Inventory, pwm: &Pwm) -> Vec<&'a Fan> {
    let same_chip: Vec<&Fan> = inv
        .fans
        .iter()
        .filter(|f| f.chip_path == pwm.chip_path)
        .collect();
    if same_chip.is_empty() {
        inv.fans.iter().collect()
    } else {
        same_chip
    }
}

fn worker(inv: Inventory, shared: Arc<Shared>, hold: Arc<AtomicBool>) {
    let originals = capture_originals(&inv.pwms);
    hold.store(true, Ordering::Release);

    // Manual mode on everything we are about to drive (best effort).
    for pwm in &inv.pwms {
        if let Some(ref enable_path) = pwm.enable_path {
            if let Err(e) = sysfs::write_enable(enable_path, ENABLE_MANUAL) {
                debug!(path = %enable_path.display(), error = %e, "manual mode refused");
            }
        }
    }

    match shared.cfg.mode {
        DetectMode::Ramp => ramp_flow(&inv, &shared),
        DetectMode::Couple => couple_flow(&inv, &shared),
    }

    // Restore runs unconditionally, canceled or not.
    restore_originals(&originals);
    hold.store(false, Ordering::Release);
    shared.phase.store(0, Ordering::Release);
    shared.running.store(false, Ordering::Release);
    info!(canceled = shared.stop.load(Ordering::Acquire), "detection finished");
}

fn ramp_flow(inv: &Inventory, shared: &Shared) {
    let cfg = &shared.cfg;
    let start = cfg.ramp_start_percent.clamp(0, 100);
    let end = cfg.ramp_end_percent.clamp(0, 100).max(start);
    let step = (((end - start) / det::RAMP_STEPS).max(1)) as usize;

    for (i, pwm) in inv.pwms.iter().enumerate() {
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
        shared.current.store(i, Ordering::Release);
        shared.phase.store(1, Ordering::Release);

        let candidates = tach_candidates(inv, pwm);
        let mut peak = 0i32;

        let mut pct = start;
        loop {
            if let Err(e) = sysfs::write_percent(&pwm.pwm_path, pct, pwm.max_raw) {
                debug!(path = %pwm.pwm_path.display(), error = %e, "ramp write failed");
            }
            if !sleep_cancelable(cfg.spinup_poll_ms, &shared.stop) {
                return;
            }
            for fan in &candidates {
                if let Ok(rpm) = sysfs::read_rpm(&fan.input_path) {
                    peak = peak.max(rpm);
                }
            }
            if pct >= end {
                break;
            }
            pct = (pct + step as i32).min(end);
        }

        shared.peaks.lock()[i] = peak;
        debug!(pwm = %pwm.pwm_path.display(), peak_rpm = peak, "pwm ramp measured");

        shared.phase.store(2, Ordering::Release);
        if !sleep_cancelable(cfg.settle_ms, &shared.stop) {
            return;
        }
    }
}

fn couple_flow(inv: &Inventory, shared: &Shared) {
    let cfg = &shared.cfg;

    for (i, pwm) in inv.pwms.iter().enumerate() {
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
        shared.current.store(i, Ordering::Release);
        shared.phase.store(1, Ordering::Release);

        let before = snapshot_temps(inv);
        if let Err(e) = sysfs::write_percent(&pwm.pwm_path, 100, pwm.max_raw) {
            debug!(path = %pwm.pwm_path.display(), error = %e, "couple write failed");
        }
        if !sleep_cancelable(cfg.couple_hold_ms, &shared.stop) {
            return;
        }
        let after = snapshot_temps(inv);

        if let Some((temp_path, delta)) = best_delta(&before, &after, cfg.couple_min_delta_c) {
            info!(
                pwm = %pwm.pwm_path.display(),
                temp = %temp_path,
                delta_c = delta,
                "pwm coupled to sensor"
            );
            shared.couplings.lock().push(Coupling {
                pwm_path: pwm.pwm_path.to_string_lossy().to_string(),
                temp_path,
                delta_c: delta,
            });
        }

        shared.phase.store(2, Ordering::Release);
        if !sleep_cancelable(cfg.settle_ms, &shared.stop) {
            return;
        }
    }
}

fn snapshot_temps(inv: &Inventory) -> HashMap<String, f64> {
    inv.temps
        .iter()
        .filter_map(|t| {
            sysfs::read_temp_c(Path::new(&t.input_path))
                .ok()
                .map(|v| (t.input_path.to_string_lossy().to_string(), v))
        })
        .collect()
}

/// The sensor with the largest |deltaT| at or above `min_delta`, if any.
fn best_delta(
    before: &HashMap<String, f64>,
    after: &HashMap<String, f64>,
    min_delta: f64,
) -> Option<(String, f64)> {
    let mut best: Option<(String, f64)> = None;
    for (path, b) in before {
        let Some(a) = after.get(path) else { continue };
        let delta = (a - b).abs();
        if delta < min_delta {
            continue;
        }
        match best {
            Some((_, cur)) if cur >= delta => {}
            _ => best = Some((path.clone(), delta)),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hwmon::test_fixture::*;
    use crate::hwmon::scan;
    use crate::vendormap::VendorMap;
    use std::fs;
    use tempfile::TempDir;

    fn fast_cfg() -> DetectionConfig {
        DetectionConfig {
            settle_ms: 1,
            spinup_poll_ms: 1,
            min_valid_rpm: 100,
            ..DetectionConfig::default()
        }
    }

    #[test]
    fn test_ramp_records_peaks_and_restores() {
        let dir = TempDir::new().unwrap();
        let chip = make_chip(dir.path(), 0, "nct6798");
        add_fan(&chip, 1, 1350, None);
        add_pwm(&chip, 1, 128, Some(2));

        let inv = scan(dir.path(), &VendorMap::builtin());
        let hold = Arc::new(AtomicBool::new(false));
        let mut det = Detection::start(inv, fast_cfg(), hold.clone());

        while det.running() {
            thread::sleep(Duration::from_millis(5));
        }
        det.join();

        let status = det.status();
        assert!(!status.running);
        assert!(status.ok);
        assert_eq!(status.total, 1);
        assert_eq!(status.mapped_pwms, 1);
        assert_eq!(det.peaks(), vec![1350]);

        // Original duty and enable mode restored
        assert_eq!(fs::read_to_string(chip.join("pwm1")).unwrap().trim(), "128");
        assert_eq!(
            fs::read_to_string(chip.join("pwm1_enable")).unwrap().trim(),
            "2"
        );
        assert!(!hold.load(Ordering::Acquire));
    }

    #[test]
    fn test_abort_restores_originals() {
        let dir = TempDir::new().unwrap();
        let chip = make_chip(dir.path(), 0, "nct6798");
        add_fan(&chip, 1, 900, None);
        // several PWMs with slow settling so the abort lands mid-run
        for n in 1..=4 {
            add_pwm(&chip, n, 128, Some(2));
        }

        let inv = scan(dir.path(), &VendorMap::builtin());
        let cfg = DetectionConfig {
            settle_ms: 5000,
            spinup_poll_ms: 200,
            ..DetectionConfig::default()
        };
        let hold = Arc::new(AtomicBool::new(false));
        let mut det = Detection::start(inv, cfg, hold.clone());

        thread::sleep(Duration::from_millis(30));
        det.abort();

        assert!(!det.running());
        for n in 1..=4 {
            assert_eq!(
                fs::read_to_string(chip.join(format!("pwm{}", n))).unwrap().trim(),
                "128",
                "pwm{} duty not restored",
                n
            );
            assert_eq!(
                fs::read_to_string(chip.join(format!("pwm{}_enable", n)))
                    .unwrap()
                    .trim(),
                "2",
                "pwm{} enable not restored",
                n
            );
        }
        assert!(!hold.load(Ordering::Acquire));
    }

    #[test]
    fn test_couple_flow_with_static_temps_finds_nothing() {
        let dir = TempDir::new().unwrap();
        let chip = make_chip(dir.path(), 0, "nct6798");
        add_temp(&chip, 1, 45_000, None);
        add_pwm(&chip, 1, 64, Some(2));

        let inv = scan(dir.path(), &VendorMap::builtin());
        let cfg = DetectionConfig {
            mode: DetectMode::Couple,
            couple_hold_ms: 1,
            settle_ms: 1,
            ..DetectionConfig::default()
        };
        let hold = Arc::new(AtomicBool::new(false));
        let mut det = Detection::start(inv, cfg, hold);

        while det.running() {
            thread::sleep(Duration::from_millis(5));
        }
        det.join();

        assert!(det.couplings().is_empty());
        assert_eq!(det.status().mapped_temps, 0);
        assert_eq!(fs::read_to_string(chip.join("pwm1")).unwrap().trim(), "64");
    }

    #[test]
    fn test_best_delta_picks_largest_response() {
        let before: HashMap<String, f64> =
            [("a".to_string(), 40.0), ("b".to_string(), 50.0)].into();
        let after: HashMap<String, f64> =
            [("a".to_string(), 36.5), ("b".to_string(), 49.0)].into();

        let (path, delta) = best_delta(&before, &after, 2.0).unwrap();
        assert_eq!(path, "a");
        assert!((delta - 3.5).abs() < 1e-9);

        assert!(best_delta(&before, &after, 4.0).is_none());
    }
}
