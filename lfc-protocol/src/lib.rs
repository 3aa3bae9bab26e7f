//! Shared wire types for LinuxFanControl
//!
//! Everything that crosses a process boundary lives here: the JSON-RPC 2.0
//! envelope helpers and error codes, the on-disk profile format (which is also
//! the RPC payload for profile operations), and the status shapes reported for
//! detection runs and import jobs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// JSON-RPC protocol version string
pub const JSONRPC_VERSION: &str = "2.0";

/// Profile schema identifier written into every profile document
pub const PROFILE_SCHEMA: &str = "LinuxFanControl.Profile/v1";

/// Maximum accepted request line length; longer lines close the connection
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// JSON-RPC error codes. Standard codes plus application codes from -32000.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const NOT_FOUND: i64 = -32001;
    pub const PERMISSION_DENIED: i64 = -32002;
    pub const BUSY: i64 = -32003;
    pub const CANCELED: i64 = -32004;
    pub const IO_ERROR: i64 = -32005;
}

// ============================================================================
// JSON-RPC envelope helpers
// ============================================================================

/// Build a JSON-RPC success response for the given request id.
pub fn rpc_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })
}

/// Build a JSON-RPC error response for the given request id.
pub fn rpc_error(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message.into() }
    })
}

/// Build a JSON-RPC error response carrying additional data.
pub fn rpc_error_data(id: Value, code: i64, message: impl Into<String>, data: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message.into(), "data": data }
    })
}

// ============================================================================
// Profile file format
// ============================================================================

/// Curve kind: piecewise-linear table, aggregator over other curves, or
/// two-level trigger with on/off thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CurveKind {
    #[default]
    Graph,
    Mix,
    Trigger,
}

/// Aggregation function for mix curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MixFunction {
    Min,
    #[default]
    Avg,
    Max,
}

/// One point of a piecewise-linear curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    #[serde(rename = "tempC")]
    pub temp_c: f64,
    pub percent: i32,
}

/// A named fan curve. For `mix` curves `temp_sensors` holds the *names* of the
/// referenced curves and `points` is empty; for `trigger` curves the first and
/// last points carry the idle/load duty levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanCurve {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: CurveKind,
    #[serde(default)]
    pub mix: MixFunction,
    #[serde(default)]
    pub temp_sensors: Vec<String>,
    #[serde(default)]
    pub points: Vec<CurvePoint>,
    #[serde(default)]
    pub on_c: f64,
    #[serde(default)]
    pub off_c: f64,
}

fn default_enabled() -> bool {
    true
}

/// Binding of one PWM output to a curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Control {
    pub name: String,
    pub pwm_path: String,
    pub curve_ref: String,
    #[serde(default)]
    pub min_percent: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// A complete profile document as stored on disk and exchanged over RPC.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub fan_curves: Vec<FanCurve>,
    #[serde(default)]
    pub controls: Vec<Control>,
}

impl Profile {
    /// Empty profile with the current schema tag and a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            schema: PROFILE_SCHEMA.to_string(),
            name: name.into(),
            ..Self::default()
        }
    }
}

// ============================================================================
// Status shapes
// ============================================================================

/// Import/detection job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Error,
}

/// Snapshot of a long-running job, as returned by the import RPC surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub progress: u8,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub profile_name: String,
}

/// Detection worker progress, as returned by `detect.status`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStatus {
    pub running: bool,
    pub current_index: usize,
    pub total: usize,
    /// 0 = idle, 1 = ramp, 2 = settle
    pub phase: u8,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub mapped_pwms: usize,
    pub mapped_temps: usize,
}

// ============================================================================
// Path validation
// ============================================================================

const ALLOWED_PATH_PREFIXES: &[&str] = &["/sys/class/hwmon/", "/sys/devices/"];

/// Validate that an RPC-supplied path points into the hwmon tree and is free
/// of traversal or injection attempts. Returns a human-readable reason on
/// rejection.
pub fn validate_hwmon_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("path is empty".to_string());
    }
    if path.len() > 4096 {
        return Err("path too long".to_string());
    }
    if path.contains('\0') || path.contains('\n') {
        return Err("path contains forbidden characters".to_string());
    }
    if path.contains("..") {
        return Err("path traversal detected".to_string());
    }
    if !ALLOWED_PATH_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return Err("path must be under /sys/class/hwmon or /sys/devices".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_roundtrip() {
        let doc = r#"{
            "schema": "LinuxFanControl.Profile/v1",
            "name": "Quiet",
            "fanCurves": [
                {"name": "cpu", "type": "graph",
                 "tempSensors": ["/sys/class/hwmon/hwmon0/temp1_input"],
                 "points": [{"tempC": 30.0, "percent": 20}, {"tempC": 70.0, "percent": 100}],
                 "mix": "avg", "onC": 0.0, "offC": 0.0}
            ],
            "controls": [
                {"name": "case", "pwmPath": "/sys/class/hwmon/hwmon0/pwm1", "curveRef": "cpu"}
            ]
        }"#;
        let p: Profile = serde_json::from_str(doc).unwrap();
        assert_eq!(p.schema, PROFILE_SCHEMA);
        assert_eq!(p.fan_curves.len(), 1);
        assert_eq!(p.fan_curves[0].kind, CurveKind::Graph);
        assert_eq!(p.controls[0].min_percent, 0);
        assert!(p.controls[0].enabled);

        let back = serde_json::to_value(&p).unwrap();
        assert_eq!(back["fanCurves"][0]["type"], "graph");
        assert_eq!(back["controls"][0]["pwmPath"], "/sys/class/hwmon/hwmon0/pwm1");
    }

    #[test]
    fn test_rpc_envelopes() {
        let ok = rpc_result(json!(1), json!({"pong": true}));
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"id":1,"jsonrpc":"2.0","result":{"pong":true}}"#
        );
        let err = rpc_error(Value::Null, codes::PARSE_ERROR, "Parse error");
        assert_eq!(err["error"]["code"], -32700);
        assert!(err["id"].is_null());
    }

    #[test]
    fn test_validate_hwmon_path() {
        assert!(validate_hwmon_path("/sys/class/hwmon/hwmon0/pwm1").is_ok());
        assert!(validate_hwmon_path("/sys/devices/platform/nct6775.656/hwmon/hwmon3/pwm2").is_ok());
        assert!(validate_hwmon_path("/etc/passwd").is_err());
        assert!(validate_hwmon_path("/sys/class/hwmon/../../../etc").is_err());
        assert!(validate_hwmon_path("").is_err());
    }
}
