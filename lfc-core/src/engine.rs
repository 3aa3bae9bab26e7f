//! Control engine: periodic evaluation of the active profile
//!
//! One tick reads every referenced temperature once, evaluates each control's
//! curve tree, and writes PWM duty where needed. Writes are suppressed by the
//! deltaC hysteresis gate, re-issued unconditionally once per force-tick
//! interval, and coalesced when the target duty is unchanged. Fans starting
//! from rest get a spin-up kick.
//!
//! Per-control runtime state lives in [`RuleState`]; applying a profile
//! replaces it atomically, and an invalid profile leaves the previous one
//! active. A write failure is local to its control: the loop continues and
//! the failure is counted for the status surface.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use lfc_error::Result;
use lfc_protocol::{Control, CurveKind, FanCurve, Profile};

use crate::constants::{pwm, timing};
use crate::curve;
use crate::hwmon::Inventory;
use crate::profile::validate_profile;
use crate::sysfs;

/// Tunable engine parameters, sourced from the daemon config.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub tick_ms: u64,
    pub force_tick_ms: u64,
    pub delta_c: f64,
    pub spinup_percent: i32,
    pub spinup_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_ms: timing::TICK_MS_DEFAULT,
            force_tick_ms: timing::FORCE_TICK_MS_DEFAULT,
            delta_c: timing::DELTA_C_DEFAULT,
            spinup_percent: timing::SPINUP_PERCENT,
            spinup_ms: timing::SPINUP_MS,
        }
    }
}

/// Per-control runtime state. Created when a profile is applied, destroyed
/// on re-apply.
#[derive(Debug, Clone, Default)]
struct RuleState {
    has_last_temp: bool,
    last_temp_c: f64,
    prev_temp_c: f64,
    /// -1 until the first successful write
    last_percent: i32,
    last_write: Option<Instant>,
    spin_until: Option<Instant>,
    write_errors: u64,
    /// Trigger latch per referenced trigger curve
    triggers: HashMap<String, bool>,
}

impl RuleState {
    fn new() -> Self {
        Self {
            last_percent: -1,
            ..Self::default()
        }
    }
}

struct Rule {
    control: Control,
    pwm_path: PathBuf,
    enable_path: Option<PathBuf>,
    max_raw: i64,
    /// Flattened sensor paths of the control's curve tree, used to decide
    /// whether state survives an inventory swap
    sensors: Vec<String>,
    state: RuleState,
}

/// The control engine. Owned by the daemon; ticked from the control thread.
pub struct Engine {
    inv: Arc<Inventory>,
    profile: Profile,
    rules: Vec<Rule>,
    enabled: bool,
    settings: EngineSettings,
    /// pwmN_enable values captured at first enable, restored on disable
    saved_modes: Vec<(PathBuf, i64)>,
    /// Exclusive control handoff: while held (by detection), the tick loop
    /// issues no writes
    hold: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            inv: Arc::new(Inventory::default()),
            profile: Profile::default(),
            rules: Vec::new(),
            enabled: false,
            settings,
            saved_modes: Vec::new(),
            hold: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: EngineSettings) {
        self.settings = settings;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Shared flag another writer (the detection worker) raises to pause
    /// tick-based writes until its restore pass completes.
    pub fn control_hold(&self) -> Arc<AtomicBool> {
        self.hold.clone()
    }

    /// Total failed writes across all controls since the profile was applied.
    pub fn write_errors(&self) -> u64 {
        self.rules.iter().map(|r| r.state.write_errors).sum()
    }

    /// Replace the hardware view. Rule state survives for controls whose PWM
    /// path and sensor set are unchanged; everything else resets.
    pub fn set_inventory(&mut self, inv: Arc<Inventory>) {
        self.inv = inv;
        let mut old: HashMap<String, (Vec<String>, RuleState)> = self
            .rules
            .drain(..)
            .map(|r| {
                (
                    r.control.pwm_path.clone(),
                    (r.sensors, r.state),
                )
            })
            .collect();

        let profile = std::mem::take(&mut self.profile);
        self.rules = build_rules(&profile, &self.inv);
        self.profile = profile;

        for rule in &mut self.rules {
            if let Some((sensors, state)) = old.remove(&rule.control.pwm_path) {
                if sensors == rule.sensors {
                    rule.state = state;
                }
            }
        }
    }

    /// Validate and apply a profile. On failure the previous profile and its
    /// state remain untouched.
    pub fn apply_profile(&mut self, profile: Profile) -> Result<()> {
        validate_profile(&profile, &self.inv)?;
        info!(
            profile = %profile.name,
            curves = profile.fan_curves.len(),
            controls = profile.controls.len(),
            "applying profile"
        );
        self.rules = build_rules(&profile, &self.inv);
        self.profile = profile;
        Ok(())
    }

    /// Turn automatic control on or off. The first enable captures every
    /// controlled PWM's enable mode and switches it to manual; disable
    /// restores the captured modes and clears spin-up timers.
    pub fn enable(&mut self, on: bool) {
        if on == self.enabled {
            return;
        }
        if on {
            self.capture_and_set_manual();
            self.enabled = true;
            info!("engine enabled");
        } else {
            self.enabled = false;
            for rule in &mut self.rules {
                rule.state.spin_until = None;
            }
            self.restore_modes();
            info!("engine disabled");
        }
    }

    /// Disable control and drop the profile entirely.
    pub fn reset(&mut self) {
        self.enable(false);
        self.profile = Profile::default();
        self.rules.clear();
        debug!("engine reset");
    }

    fn capture_and_set_manual(&mut self) {
        if !self.saved_modes.is_empty() {
            return;
        }
        for rule in &self.rules {
            let Some(ref enable_path) = rule.enable_path else {
                continue;
            };
            match sysfs::read_enable(enable_path) {
                Ok(mode) => self.saved_modes.push((enable_path.clone(), mode)),
                Err(e) => debug!(path = %enable_path.display(), error = %e, "enable mode unreadable"),
            }
            if let Err(e) = sysfs::write_enable(enable_path, pwm::ENABLE_MANUAL) {
                warn!(path = %enable_path.display(), error = %e, "failed to set manual mode");
            }
        }
    }

    /// Restore captured pwmN_enable values. Safe to call repeatedly; used on
    /// disable and daemon shutdown.
    pub fn restore_modes(&mut self) {
        for (path, mode) in self.saved_modes.drain(..) {
            if let Err(e) = sysfs::write_enable(&path, mode) {
                warn!(path = %path.display(), error = %e, "failed to restore enable mode");
            }
        }
    }

    /// One evaluation pass. Returns the number of PWM writes issued.
    pub fn tick(&mut self, now: Instant) -> usize {
        if !self.enabled || self.hold.load(Ordering::Acquire) {
            return 0;
        }

        let settings = self.settings;
        let force = Duration::from_millis(settings.force_tick_ms);
        let spinup = Duration::from_millis(settings.spinup_ms);
        let profile = &self.profile;
        let mut cache: HashMap<String, Option<f64>> = HashMap::new();
        let mut writes = 0usize;

        for rule in &mut self.rules {
            if !rule.control.enabled {
                continue;
            }
            let st = &mut rule.state;

            let mut touched: Vec<f64> = Vec::new();
            let mut flipped = false;
            let target = eval_curve_named(
                profile,
                &rule.control.curve_ref,
                &mut cache,
                &mut st.triggers,
                &mut touched,
                &mut flipped,
            );

            let (Some(target), Some(temp)) = (
                target,
                touched.iter().cloned().fold(None::<f64>, |acc, t| {
                    Some(acc.map_or(t, |a| a.max(t)))
                }),
            ) else {
                // No sensor data this tick; hold the last output.
                trace!(control = %rule.control.name, "no samples, holding");
                continue;
            };

            let force_due = st
                .last_write
                .map_or(true, |w| now.duration_since(w) >= force);

            // Hysteresis gate. A trigger state flip bypasses it so two-level
            // curves switch promptly.
            if st.has_last_temp
                && (temp - st.last_temp_c).abs() < settings.delta_c
                && !force_due
                && !flipped
            {
                continue;
            }

            let mut target = target.clamp(rule.control.min_percent, 100);

            // Spin-up: a fan starting from rest gets an elevated kick held
            // for the spin-up window.
            if st.last_percent <= 0 && target > 0 {
                target = target.max(settings.spinup_percent);
                st.spin_until = Some(now + spinup);
            } else if let Some(until) = st.spin_until {
                if now < until {
                    target = target.max(settings.spinup_percent);
                } else {
                    st.spin_until = None;
                }
            }

            // Change-coalescing: identical duty is not rewritten unless the
            // force-tick interval elapsed.
            if target == st.last_percent && !force_due {
                continue;
            }

            match sysfs::write_percent(&rule.pwm_path, target, rule.max_raw) {
                Ok(()) => {
                    trace!(
                        control = %rule.control.name,
                        temp = temp,
                        percent = target,
                        "pwm write"
                    );
                    st.prev_temp_c = st.last_temp_c;
                    st.last_temp_c = temp;
                    st.has_last_temp = true;
                    st.last_percent = target;
                    st.last_write = Some(now);
                    writes += 1;
                }
                Err(e) => {
                    st.write_errors += 1;
                    debug!(
                        control = %rule.control.name,
                        path = %rule.pwm_path.display(),
                        error = %e,
                        "pwm write failed"
                    );
                }
            }
        }

        writes
    }
}

/// Build rule runtimes for every control that resolves against the inventory.
fn build_rules(profile: &Profile, inv: &Inventory) -> Vec<Rule> {
    let mut rules = Vec::new();
    for control in &profile.controls {
        let Some(pwm) = inv.find_pwm(&control.pwm_path) else {
            warn!(
                control = %control.name,
                pwm = %control.pwm_path,
                "control pwm not in inventory, skipping"
            );
            continue;
        };
        rules.push(Rule {
            pwm_path: pwm.pwm_path.clone(),
            enable_path: pwm.enable_path.clone(),
            max_raw: pwm.max_raw,
            sensors: collect_sensors(profile, &control.curve_ref),
            state: RuleState::new(),
            control: control.clone(),
        });
    }
    rules
}

/// Flatten the sensor paths a curve tree reads, following mix references.
fn collect_sensors(profile: &Profile, curve_name: &str) -> Vec<String> {
    fn walk(profile: &Profile, name: &str, out: &mut Vec<String>) {
        let Some(curve) = profile.fan_curves.iter().find(|c| c.name == name) else {
            return;
        };
        if curve.kind == CurveKind::Mix {
            for referenced in &curve.temp_sensors {
                walk(profile, referenced, out);
            }
        } else {
            out.extend(curve.temp_sensors.iter().cloned());
        }
    }
    let mut out = Vec::new();
    walk(profile, curve_name, &mut out);
    out.sort();
    out.dedup();
    out
}

/// Aggregate a curve's sensor readings with `max`, recording every sample in
/// `touched` for the caller's hysteresis gate.
fn aggregate_temp(
    curve: &FanCurve,
    cache: &mut HashMap<String, Option<f64>>,
    touched: &mut Vec<f64>,
) -> Option<f64> {
    let mut agg: Option<f64> = None;
    for sensor in &curve.temp_sensors {
        let sample = *cache
            .entry(sensor.clone())
            .or_insert_with(|| sysfs::read_temp_c(Path::new(sensor)).ok());
        if let Some(t) = sample {
            touched.push(t);
            agg = Some(agg.map_or(t, |a: f64| a.max(t)));
        }
    }
    agg
}

/// Evaluate a curve by name. Mix curves recurse into their references;
/// cycles were excluded at profile apply time.
fn eval_curve_named(
    profile: &Profile,
    name: &str,
    cache: &mut HashMap<String, Option<f64>>,
    triggers: &mut HashMap<String, bool>,
    touched: &mut Vec<f64>,
    flipped: &mut bool,
) -> Option<i32> {
    let curve = profile.fan_curves.iter().find(|c| c.name == name)?;
    match curve.kind {
        CurveKind::Graph => {
            let temp = aggregate_temp(curve, cache, touched)?;
            Some(curve::eval_graph(&curve.points, temp))
        }
        CurveKind::Trigger => {
            let temp = aggregate_temp(curve, cache, touched)?;
            let latch = triggers
                .entry(curve.name.clone())
                .or_insert_with(|| curve::trigger_initial_state(curve, temp));
            let before = *latch;
            let out = curve::eval_trigger(curve, temp, latch);
            if *latch != before {
                *flipped = true;
            }
            Some(out)
        }
        CurveKind::Mix => {
            let values: Vec<i32> = curve
                .temp_sensors
                .iter()
                .filter_map(|r| eval_curve_named(profile, r, cache, triggers, touched, flipped))
                .collect();
            if values.is_empty() {
                None
            } else {
                Some(curve::apply_mix(curve.mix, &values))
            }
        }
    }
}
