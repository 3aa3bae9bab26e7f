//! LinuxFanControl core library
//!
//! Everything the daemon needs below the RPC surface:
//!
//! - `sysfs` - hwmon text-file reads/writes with milli-unit translation
//! - `hwmon` - chip/sensor/PWM inventory: discovery and refresh
//! - `vendormap` - chip-name to vendor resolution with an optional map file
//! - `curve` - piecewise-linear, mix and trigger evaluation
//! - `profile` - profile validation and on-disk storage
//! - `engine` - the periodic control loop with hysteresis and spin-up
//! - `detection` - PWM-to-fan discovery worker (ramp and couple flows)
//! - `telemetry` - shared-memory JSON snapshot publisher
//! - `config` - the daemon's typed configuration record

pub mod config;
pub mod constants;
pub mod curve;
pub mod detection;
pub mod engine;
pub mod hwmon;
pub mod profile;
pub mod sysfs;
pub mod telemetry;
pub mod vendormap;

pub use config::{default_config_path, DaemonConfig};
pub use detection::{Coupling, DetectMode, Detection, DetectionConfig};
pub use engine::{Engine, EngineSettings};
pub use hwmon::{refresh_values, scan, Chip, Fan, Inventory, Pwm, TempSensor};
pub use profile::{
    delete_profile, list_profiles, load_profile, profile_path, rename_profile, save_profile,
    validate_profile,
};
pub use telemetry::{build_snapshot, ShmTelemetry};
pub use vendormap::{VendorMap, WatchMode};

// Re-export error and shared wire types
pub use lfc_error::{LfcError, Result};
pub use lfc_protocol::{Control, CurveKind, CurvePoint, FanCurve, MixFunction, Profile};
