//! RPC method handlers
//!
//! Every method from the RPC surface is registered here against the shared
//! daemon state. Handlers are synchronous; anything that outlives an RPC
//! deadline (imports, detection) hands off to a job or worker and returns a
//! handle immediately.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use serde_json::{json, Value};
use tracing::{info, warn};

use lfc_core::detection::{DetectMode, Detection, DetectionConfig};
use lfc_core::profile as profile_store;
use lfc_core::sysfs;
use lfc_error::{LfcError, Result};

use crate::import::{self, ImportRequest};
use crate::registry::CommandRegistry;
use crate::state::{engine_settings, DaemonState};

const DAEMON_NAME: &str = "lfcd";

/// Telemetry publication mode advertised in `version`. This build publishes
/// the JSON blob layout.
const TELEMETRY_MODE: &str = "shm-json/1";

// ============================================================================
// Param helpers
// ============================================================================

fn param_str(params: &Value, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .ok_or_else(|| LfcError::invalid(format!("missing string param '{}'", key)))
}

fn param_opt_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

fn param_opt_u64(params: &Value, key: &str) -> Option<u64> {
    params.get(key).and_then(Value::as_u64)
}

fn param_opt_i64(params: &Value, key: &str) -> Option<i64> {
    params.get(key).and_then(Value::as_i64)
}

// ============================================================================
// Registration
// ============================================================================

/// Register the complete command set.
pub fn register_all(reg: &CommandRegistry, state: Arc<DaemonState>) {
    register_core(reg, state.clone());
    register_config(reg, state.clone());
    register_hwmon(reg, state.clone());
    register_engine(reg, state.clone());
    register_profiles(reg, state.clone());
    register_detect(reg, state.clone());
    register_import(reg, state.clone());
    register_daemon(reg, state);
}

fn register_core(reg: &CommandRegistry, state: Arc<DaemonState>) {
    reg.register("ping", "Health check", |_| Ok(json!({ "pong": true })));

    reg.register("version", "Daemon and RPC version", |_| {
        Ok(json!({
            "name": DAEMON_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "rpc": lfc_protocol::JSONRPC_VERSION,
            "telemetry": TELEMETRY_MODE,
        }))
    });

    reg.register("telemetry.json", "Current telemetry snapshot", move |_| {
        match state.telemetry.last() {
            Some(text) => Ok(serde_json::from_str(&text)?),
            None => Ok(state.snapshot_json()),
        }
    });
}

/// The registry's own introspection commands need a handle to the registry;
/// called after everything else is registered.
pub fn register_introspection(reg: &Arc<CommandRegistry>) {
    let r = reg.clone();
    reg.register("commands", "List available RPC methods", move |_| {
        Ok(r.list_json())
    });

    let r = reg.clone();
    reg.register("help", "Help for one method; params:{name}", move |params| {
        let name = param_str(params, "name")?;
        let help = r
            .help(&name)
            .ok_or_else(|| LfcError::not_found(format!("command '{}'", name)))?;
        Ok(json!({ "name": name, "help": help }))
    });
}

fn register_config(reg: &CommandRegistry, state: Arc<DaemonState>) {
    let st = state.clone();
    reg.register("config.get", "Current daemon config", move |_| {
        Ok(serde_json::to_value(&*st.config.lock())?)
    });

    let st = state.clone();
    reg.register(
        "config.set",
        "Set single key; params:{key, value}",
        move |params| {
            let key = param_str(params, "key")?;
            let value = params
                .get("value")
                .ok_or_else(|| LfcError::invalid("missing param 'value'"))?;
            let cfg = {
                let mut cfg = st.config.lock();
                cfg.set_key(&key, value)?;
                cfg.clone()
            };
            st.engine.lock().set_settings(engine_settings(&cfg));
            info!(key = %key, "config key updated");
            Ok(serde_json::to_value(&cfg)?)
        },
    );

    let st = state;
    reg.register("config.save", "Persist config to disk", move |_| {
        let cfg = st.config.lock().clone();
        cfg.save(&st.config_path)?;
        Ok(json!({ "saved": true, "path": st.config_path.to_string_lossy() }))
    });
}

fn register_hwmon(reg: &CommandRegistry, state: Arc<DaemonState>) {
    let st = state.clone();
    reg.register(
        "list.sensor",
        "List temperature sensors with current values",
        move |_| {
            let inv = st.inventory_snapshot();
            let list: Vec<Value> = inv
                .temps
                .iter()
                .map(|t| {
                    json!({
                        "chip": inv.chip_name(&t.chip_path),
                        "input": t.input_path.to_string_lossy(),
                        "label": t.label,
                        "valueC": sysfs::read_temp_c(&t.input_path).ok(),
                    })
                })
                .collect();
            Ok(json!(list))
        },
    );

    let st = state.clone();
    reg.register("list.fan", "List fan tach inputs", move |_| {
        let inv = st.inventory_snapshot();
        let list: Vec<Value> = inv
            .fans
            .iter()
            .map(|f| {
                json!({
                    "chip": inv.chip_name(&f.chip_path),
                    "input": f.input_path.to_string_lossy(),
                    "label": f.label,
                    "rpm": sysfs::read_rpm(&f.input_path).unwrap_or(0),
                })
            })
            .collect();
        Ok(json!(list))
    });

    let st = state.clone();
    reg.register("hwmon.snapshot", "Counts of discovered devices", move |_| {
        let inv = st.inventory_snapshot();
        Ok(json!({
            "chips": inv.chips.len(),
            "temps": inv.temps.len(),
            "fans": inv.fans.len(),
            "pwms": inv.pwms.len(),
        }))
    });

    let st = state.clone();
    reg.register("hwmon.rescan", "Rediscover hwmon devices", move |_| {
        if st.detection_running() {
            return Err(LfcError::busy("detection holds the hardware"));
        }
        st.rescan();
        let inv = st.inventory_snapshot();
        Ok(json!({
            "chips": inv.chips.len(),
            "temps": inv.temps.len(),
            "fans": inv.fans.len(),
            "pwms": inv.pwms.len(),
        }))
    });

    let st = state;
    reg.register("list.pwm", "List PWM outputs", move |_| {
        let inv = st.inventory_snapshot();
        let list: Vec<Value> = inv
            .pwms
            .iter()
            .map(|p| {
                json!({
                    "chip": inv.chip_name(&p.chip_path),
                    "pwm": p.pwm_path.to_string_lossy(),
                    "enable": p
                        .enable_path
                        .as_ref()
                        .map(|e| e.to_string_lossy().to_string())
                        .unwrap_or_default(),
                    "label": p.label,
                    "hasEnable": p.enable_path.is_some(),
                    "percent": sysfs::read_percent(&p.pwm_path, p.max_raw).unwrap_or(-1),
                })
            })
            .collect();
        Ok(json!(list))
    });
}

fn register_engine(reg: &CommandRegistry, state: Arc<DaemonState>) {
    let st = state.clone();
    reg.register("engine.enable", "Enable automatic control", move |_| {
        st.engine.lock().enable(true);
        Ok(json!({ "enabled": true }))
    });

    let st = state.clone();
    reg.register("engine.disable", "Disable automatic control", move |_| {
        st.engine.lock().enable(false);
        Ok(json!({ "enabled": false }))
    });

    let st = state.clone();
    reg.register("engine.status", "Engine status", move |_| {
        let cfg = st.config.lock().clone();
        let engine = st.engine.lock();
        Ok(json!({
            "enabled": engine.enabled(),
            "tickMs": cfg.tick_ms,
            "forceTickMs": cfg.force_tick_ms,
            "deltaC": cfg.delta_c,
            "profile": engine.profile().name,
            "writeErrors": engine.write_errors(),
        }))
    });

    let st = state;
    reg.register("engine.reset", "Disable control and clear profile", move |_| {
        let mut engine = st.engine.lock();
        engine.reset();
        st.active_profile.lock().clear();
        Ok(json!({ "reset": true, "enabled": engine.enabled() }))
    });
}

fn register_profiles(reg: &CommandRegistry, state: Arc<DaemonState>) {
    fn profiles_dir(st: &DaemonState) -> PathBuf {
        PathBuf::from(st.config.lock().profiles_path.clone())
    }

    /// Load a named profile from disk and make it the engine's active one.
    fn apply_named(st: &DaemonState, name: &str) -> Result<()> {
        let dir = profiles_dir(st);
        let path = profile_store::profile_path(&dir, name)?;
        let profile = profile_store::load_profile(&path)?;
        st.engine.lock().apply_profile(profile)?;
        *st.active_profile.lock() = name.to_string();
        st.config.lock().profile_name = name.to_string();
        Ok(())
    }

    let st = state.clone();
    reg.register("profile.list", "List profiles in profiles dir", move |_| {
        let listing: Vec<Value> = profile_store::list_profiles(&profiles_dir(&st))
            .into_iter()
            .map(|(file, name)| json!({ "file": file, "name": name }))
            .collect();
        Ok(json!({
            "profiles": listing,
            "active": st.active_profile.lock().clone(),
        }))
    });

    let st = state.clone();
    reg.register(
        "profile.load",
        "Load and apply profile by name; params:{name}",
        move |params| {
            let name = param_str(params, "name")?;
            apply_named(&st, &name)?;
            Ok(json!({ "loaded": name }))
        },
    );

    let st = state.clone();
    reg.register(
        "profile.save",
        "Write profile JSON; params:{name, profile}",
        move |params| {
            let name = param_str(params, "name")?;
            let body = params
                .get("profile")
                .ok_or_else(|| LfcError::invalid("missing param 'profile'"))?;
            let mut profile: lfc_protocol::Profile = serde_json::from_value(body.clone())?;
            profile.name = name.clone();

            // A profile that does not validate against live hardware is
            // still stored, just logged.
            if let Err(e) = profile_store::validate_profile(&profile, &st.inventory_snapshot()) {
                warn!(profile = %name, error = %e, "saving profile that does not validate");
            }

            let path = profile_store::profile_path(&profiles_dir(&st), &name)?;
            profile_store::save_profile(&profile, &path)?;
            Ok(json!({ "saved": name }))
        },
    );

    let st = state.clone();
    reg.register(
        "profile.delete",
        "Delete profile file; params:{name}",
        move |params| {
            let name = param_str(params, "name")?;
            profile_store::delete_profile(&profiles_dir(&st), &name)?;
            let mut active = st.active_profile.lock();
            if *active == name {
                active.clear();
            }
            Ok(json!({ "deleted": name }))
        },
    );

    let st = state.clone();
    reg.register(
        "profile.rename",
        "Rename profile; params:{from, to}",
        move |params| {
            let from = param_str(params, "from")?;
            let to = param_str(params, "to")?;
            profile_store::rename_profile(&profiles_dir(&st), &from, &to)?;
            let mut active = st.active_profile.lock();
            if *active == from {
                *active = to.clone();
            }
            Ok(json!({ "renamed": to }))
        },
    );

    let st = state.clone();
    reg.register("profile.getActive", "Active profile name", move |_| {
        Ok(json!({ "name": st.active_profile.lock().clone() }))
    });

    let st = state;
    reg.register(
        "profile.setActive",
        "Apply named profile; params:{name}",
        move |params| {
            let name = param_str(params, "name")?;
            apply_named(&st, &name)?;
            Ok(json!({ "active": name }))
        },
    );
}

fn register_detect(reg: &CommandRegistry, state: Arc<DaemonState>) {
    let st = state.clone();
    reg.register(
        "detect.start",
        "Start non-blocking detection; params:{mode?, settleMs?, spinupPollMs?, rampStartPercent?, rampEndPercent?, minValidRpm?, coupleHoldMs?, coupleMinDeltaC?}",
        move |params| {
            let mut slot = st.detection.lock();
            if slot.as_ref().map(|d| d.running()).unwrap_or(false) {
                return Err(LfcError::busy("detection already running"));
            }

            let mut cfg = DetectionConfig::default();
            if let Some(mode) = param_opt_str(params, "mode") {
                cfg.mode = match mode.as_str() {
                    "ramp" => DetectMode::Ramp,
                    "couple" => DetectMode::Couple,
                    other => {
                        return Err(LfcError::invalid(format!("unknown mode '{}'", other)))
                    }
                };
            }
            if let Some(v) = param_opt_u64(params, "settleMs") {
                cfg.settle_ms = v;
            }
            if let Some(v) = param_opt_u64(params, "spinupPollMs") {
                cfg.spinup_poll_ms = v;
            }
            if let Some(v) = param_opt_i64(params, "rampStartPercent") {
                cfg.ramp_start_percent = v.clamp(0, 100) as i32;
            }
            if let Some(v) = param_opt_i64(params, "rampEndPercent") {
                cfg.ramp_end_percent = v.clamp(0, 100) as i32;
            }
            if let Some(v) = param_opt_i64(params, "minValidRpm") {
                cfg.min_valid_rpm = v.max(0) as i32;
            }
            if let Some(v) = param_opt_u64(params, "coupleHoldMs") {
                cfg.couple_hold_ms = v;
            }
            if let Some(v) = params.get("coupleMinDeltaC").and_then(Value::as_f64) {
                cfg.couple_min_delta_c = v.max(0.0);
            }

            let inv = st.inventory_snapshot();
            if inv.pwms.is_empty() {
                return Err(LfcError::HardwareNotFound(
                    "no PWM outputs to probe".to_string(),
                ));
            }

            let hold = st.engine.lock().control_hold();
            *slot = Some(Detection::start((*inv).clone(), cfg, hold));
            Ok(json!({ "started": true }))
        },
    );

    let st = state.clone();
    reg.register("detect.status", "Detection status/progress", move |_| {
        match st.detection.lock().as_ref() {
            Some(det) => Ok(serde_json::to_value(det.status())?),
            None => Ok(serde_json::to_value(lfc_protocol::DetectionStatus {
                ok: true,
                ..Default::default()
            })?),
        }
    });

    let st = state.clone();
    reg.register("detect.abort", "Abort detection", move |_| {
        if let Some(det) = st.detection.lock().as_mut() {
            det.abort();
        }
        Ok(json!({}))
    });

    let st = state.clone();
    reg.register("detect.results", "Peak RPM per PWM", move |_| {
        let results: Vec<Value> = st
            .detection
            .lock()
            .as_ref()
            .map(|d| d.results())
            .unwrap_or_default()
            .into_iter()
            .map(|(pwm, peak)| json!({ "pwm": pwm, "peakRpm": peak }))
            .collect();
        Ok(json!(results))
    });

    let st = state;
    reg.register("detect.couplings", "PWM-to-sensor couplings", move |_| {
        let couplings: Vec<Value> = st
            .detection
            .lock()
            .as_ref()
            .map(|d| d.couplings())
            .unwrap_or_default()
            .into_iter()
            .map(|c| json!({ "pwm": c.pwm_path, "temp": c.temp_path, "deltaC": c.delta_c }))
            .collect();
        Ok(json!(couplings))
    });
}

fn register_import(reg: &CommandRegistry, state: Arc<DaemonState>) {
    let st = state.clone();
    reg.register(
        "profile.importAs",
        "Import foreign profile as name; params:{path, name, validateDetect?, rpmMin?, timeoutMs?}",
        move |params| {
            let req: ImportRequest = serde_json::from_value(params.clone())?;

            let slot = st.jobs.create();
            let job_id = slot.id().to_string();
            let inv = st.inventory_snapshot();
            let worker_slot = slot.clone();
            thread::Builder::new()
                .name("lfc-import".to_string())
                .spawn(move || import::run_import(&worker_slot, &req, &inv))
                .map_err(|e| LfcError::internal(format!("spawn failed: {}", e)))?;

            Ok(json!({ "jobId": job_id }))
        },
    );

    let st = state.clone();
    reg.register(
        "profile.importStatus",
        "Import job status; params:{jobId}",
        move |params| {
            let id = param_str(params, "jobId")?;
            Ok(serde_json::to_value(st.jobs.status(&id)?)?)
        },
    );

    let st = state.clone();
    reg.register(
        "profile.importCancel",
        "Cancel import job; params:{jobId}",
        move |params| {
            let id = param_str(params, "jobId")?;
            st.jobs.cancel(&id)?;
            Ok(json!({ "canceled": true }))
        },
    );

    let st = state.clone();
    reg.register(
        "profile.importCommit",
        "Apply finished import; params:{jobId}",
        move |params| {
            let id = param_str(params, "jobId")?;
            let apply_state = st.clone();
            st.jobs.commit(&id, move |profile| {
                let name = profile.name.clone();
                let dir = PathBuf::from(apply_state.config.lock().profiles_path.clone());
                let path = profile_store::profile_path(&dir, &name)?;
                profile_store::save_profile(&profile, &path)?;
                apply_state.engine.lock().apply_profile(profile)?;
                *apply_state.active_profile.lock() = name.clone();
                apply_state.config.lock().profile_name = name.clone();
                Ok(json!({ "committed": name }))
            })
        },
    );

    let st = state;
    reg.register("profile.importJobs", "List import jobs", move |_| {
        Ok(serde_json::to_value(st.jobs.list())?)
    });
}

fn register_daemon(reg: &CommandRegistry, state: Arc<DaemonState>) {
    let st = state.clone();
    reg.register("daemon.shutdown", "Shutdown daemon gracefully", move |_| {
        info!("shutdown requested over rpc");
        st.request_shutdown();
        Ok(json!({ "status": "shutting-down" }))
    });

    let st = state;
    reg.register("daemon.restart", "Request daemon restart", move |_| {
        info!("restart requested over rpc");
        st.restart_requested
            .store(true, std::sync::atomic::Ordering::Release);
        st.request_shutdown();
        Ok(json!({ "status": "restarting" }))
    });
}

/// Translate an error into its JSON-RPC code.
pub fn error_code(e: &LfcError) -> i64 {
    use lfc_protocol::codes;
    match e {
        LfcError::CommandNotFound(_) => codes::METHOD_NOT_FOUND,
        LfcError::InvalidArgument(_)
        | LfcError::InvalidCurve(_)
        | LfcError::InvalidConfig { .. }
        | LfcError::JsonParse(_) => codes::INVALID_PARAMS,
        LfcError::NotFound(_) | LfcError::FileNotFound(_) | LfcError::HardwareNotFound(_) => {
            codes::NOT_FOUND
        }
        LfcError::PermissionDenied(_) => codes::PERMISSION_DENIED,
        LfcError::Busy(_) => codes::BUSY,
        LfcError::Canceled => codes::CANCELED,
        LfcError::Io(_)
        | LfcError::FileRead { .. }
        | LfcError::FileWrite { .. }
        | LfcError::TempRead { .. }
        | LfcError::FanRead { .. }
        | LfcError::PwmWrite { .. } => codes::IO_ERROR,
        _ => codes::INTERNAL_ERROR,
    }
}
