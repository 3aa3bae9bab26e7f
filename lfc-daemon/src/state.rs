//! Shared daemon state
//!
//! One `Arc<DaemonState>` is threaded through the RPC handlers, the control
//! thread and the server. Inventory is copy-on-replace: readers clone the
//! `Arc` snapshot and never observe a half-updated view. The engine sits
//! behind a short mutex; handlers hold it only for the duration of one
//! operation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, warn};

use lfc_core::constants::timing;
use lfc_core::{
    build_snapshot, refresh_values, scan, DaemonConfig, Detection, Engine, EngineSettings,
    Inventory, ShmTelemetry, VendorMap, WatchMode,
};
use lfc_error::Result;

use crate::jobs::JobManager;

pub struct DaemonState {
    pub config: Mutex<DaemonConfig>,
    pub config_path: PathBuf,
    pub hwmon_root: PathBuf,
    pub inventory: RwLock<Arc<Inventory>>,
    pub engine: Mutex<Engine>,
    pub detection: Mutex<Option<Detection>>,
    pub jobs: JobManager,
    pub telemetry: ShmTelemetry,
    pub vendors: Mutex<VendorMap>,
    pub active_profile: Mutex<String>,
    pub stop: Arc<AtomicBool>,
    pub restart_requested: AtomicBool,
}

/// Engine tuning derived from the config record.
pub fn engine_settings(cfg: &DaemonConfig) -> EngineSettings {
    EngineSettings {
        tick_ms: cfg.tick_ms,
        force_tick_ms: cfg.force_tick_ms,
        delta_c: cfg.delta_c,
        spinup_percent: timing::SPINUP_PERCENT,
        spinup_ms: timing::SPINUP_MS,
    }
}

fn vendor_map_for(cfg: &DaemonConfig) -> VendorMap {
    if cfg.vendor_map_path.is_empty() {
        VendorMap::builtin()
    } else {
        VendorMap::with_file(
            PathBuf::from(&cfg.vendor_map_path),
            WatchMode::parse(&cfg.vendor_map_watch_mode),
            cfg.vendor_map_throttle_ms,
        )
    }
}

impl DaemonState {
    pub fn new(config: DaemonConfig, config_path: PathBuf, hwmon_root: PathBuf) -> Arc<Self> {
        let vendors = vendor_map_for(&config);
        let inventory = Arc::new(scan(&hwmon_root, &vendors));

        let mut engine = Engine::new(engine_settings(&config));
        engine.set_inventory(inventory.clone());

        let telemetry = ShmTelemetry::new(&config.shm_path);
        let active = config.profile_name.clone();

        Arc::new(Self {
            config: Mutex::new(config),
            config_path,
            hwmon_root,
            inventory: RwLock::new(inventory),
            engine: Mutex::new(engine),
            detection: Mutex::new(None),
            jobs: JobManager::new(),
            telemetry,
            vendors: Mutex::new(vendors),
            active_profile: Mutex::new(active),
            stop: Arc::new(AtomicBool::new(false)),
            restart_requested: AtomicBool::new(false),
        })
    }

    /// Stable snapshot of the inventory for the duration of an operation.
    pub fn inventory_snapshot(&self) -> Arc<Inventory> {
        self.inventory.read().clone()
    }

    /// Full rediscovery of hardware. Replaces the shared snapshot and hands
    /// the new view to the engine.
    pub fn rescan(&self) {
        let inv = {
            let mut vendors = self.vendors.lock();
            vendors.maybe_reload();
            Arc::new(scan(&self.hwmon_root, &vendors))
        };
        *self.inventory.write() = inv.clone();
        self.engine.lock().set_inventory(inv);
        debug!("inventory rescanned");
    }

    /// Lightweight refresh: drop vanished nodes, re-read labels. Publishes a
    /// fresh copy-on-replace snapshot when anything changed.
    pub fn refresh_inventory(&self) {
        let current = self.inventory_snapshot();
        let mut updated = (*current).clone();
        refresh_values(&mut updated);
        let changed = updated.temps.len() != current.temps.len()
            || updated.fans.len() != current.fans.len()
            || updated.pwms.len() != current.pwms.len()
            || updated.chips.len() != current.chips.len();
        let updated = Arc::new(updated);
        *self.inventory.write() = updated.clone();
        if changed {
            self.engine.lock().set_inventory(updated);
        }
    }

    /// Build the telemetry document from current state.
    pub fn snapshot_json(&self) -> Value {
        let inv = self.inventory_snapshot();
        let gpus = lfc_gpu::sample_gpus(&self.hwmon_root).unwrap_or_default();
        let engine = self.engine.lock();
        build_snapshot(&inv, &gpus, engine.profile(), engine.enabled())
    }

    /// Publish one telemetry snapshot to SHM (or the file fallback).
    pub fn publish_telemetry(&self) -> Result<()> {
        let doc = self.snapshot_json();
        self.telemetry.publish(&serde_json::to_string(&doc)?)
    }

    /// One engine tick, skipped entirely while detection holds the hardware.
    pub fn tick_engine(&self, now: Instant) {
        self.engine.lock().tick(now);
    }

    /// Whether a detection run is currently active.
    pub fn detection_running(&self) -> bool {
        self.detection
            .lock()
            .as_ref()
            .map(|d| d.running())
            .unwrap_or(false)
    }

    pub fn request_shutdown(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Shutdown path: stop detection (restores PWMs), restore engine modes,
    /// close telemetry.
    pub fn teardown(&self) {
        if let Some(mut det) = self.detection.lock().take() {
            if det.running() {
                warn!("aborting detection for shutdown");
            }
            det.abort();
        }
        self.engine.lock().enable(false);
        self.telemetry.close();
    }
}
