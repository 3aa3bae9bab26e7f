//! Constants and configuration defaults for LinuxFanControl
//!
//! Centralizes magic numbers, paths and tuning defaults. Never use magic
//! numbers in other files - add them here first.

/// System paths
pub mod paths {
    /// Base path for hwmon devices
    pub const HWMON_BASE: &str = "/sys/class/hwmon";

    /// Config directory name under XDG config home
    pub const CONFIG_DIR_NAME: &str = "LinuxFanControl";

    /// Daemon config file name
    pub const CONFIG_FILE_NAME: &str = "daemon.json";

    /// Profiles subdirectory name
    pub const PROFILES_DIR_NAME: &str = "profiles";

    /// Preferred and fallback pidfile locations
    pub const PIDFILE_PREFERRED: &str = "/run/lfcd.pid";
    pub const PIDFILE_FALLBACK: &str = "/tmp/lfcd.pid";

    /// Preferred and fallback logfile locations
    pub const LOGFILE_PREFERRED: &str = "/var/log/lfc/daemon_lfc.log";
    pub const LOGFILE_FALLBACK: &str = "/tmp/daemon_lfc.log";
}

/// Engine timing defaults and ranges
pub mod timing {
    /// Default tick interval in milliseconds
    pub const TICK_MS_DEFAULT: u64 = 25;
    pub const TICK_MS_MIN: u64 = 5;
    pub const TICK_MS_MAX: u64 = 1000;

    /// Default force-tick interval: an unconditional write is issued per
    /// control after this long without one, regardless of the deltaC gate
    pub const FORCE_TICK_MS_DEFAULT: u64 = 2000;
    pub const FORCE_TICK_MS_MIN: u64 = 100;
    pub const FORCE_TICK_MS_MAX: u64 = 10_000;

    /// Default temperature delta gate in degrees Celsius
    pub const DELTA_C_DEFAULT: f64 = 0.7;
    pub const DELTA_C_MIN: f64 = 0.0;
    pub const DELTA_C_MAX: f64 = 10.0;

    /// Inventory refresh / telemetry publish cadence
    pub const HWMON_REFRESH_MS_DEFAULT: u64 = 500;

    /// Spin-up: duty floor and hold time applied when a fan starts from rest
    pub const SPINUP_PERCENT: i32 = 30;
    pub const SPINUP_MS: u64 = 300;
}

/// PWM raw value handling
pub mod pwm {
    /// Standard hwmon PWM raw range top
    pub const MAX_RAW: i64 = 255;

    /// pwmN_enable modes
    pub const ENABLE_DISABLED: i64 = 0;
    pub const ENABLE_MANUAL: i64 = 1;
    pub const ENABLE_AUTO: i64 = 2;
}

/// Detection worker tuning defaults
pub mod detection {
    pub const SETTLE_MS: u64 = 250;
    pub const SPINUP_POLL_MS: u64 = 100;
    pub const RAMP_START_PERCENT: i32 = 30;
    pub const RAMP_END_PERCENT: i32 = 100;
    pub const RAMP_STEPS: i32 = 10;

    /// Peak RPM below this is treated as "no fan on this PWM"
    pub const MIN_VALID_RPM: i32 = 200;

    /// Coupling flow: hold duration at 100% and minimum temperature response
    pub const COUPLE_HOLD_MS: u64 = 5000;
    pub const COUPLE_MIN_DELTA_C: f64 = 2.0;

    /// Granularity of cancelable sleeps
    pub const SLEEP_SLICE_MS: u64 = 10;
}

/// Telemetry defaults
pub mod shm {
    /// Default POSIX SHM name for the telemetry snapshot
    pub const DEFAULT_NAME: &str = "lfc.telemetry";
}

/// RPC server defaults
pub mod rpc {
    pub const DEFAULT_HOST: &str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 8777;
}

/// Vendor map defaults
pub mod vendor {
    pub const WATCH_MODE_NONE: &str = "none";
    pub const WATCH_MODE_MTIME: &str = "mtime";
    pub const THROTTLE_MS_DEFAULT: u64 = 3000;
}
