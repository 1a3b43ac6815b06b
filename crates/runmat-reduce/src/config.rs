use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const DEFAULT_WORKGROUP_SIZE: u32 = 256;
pub const DEFAULT_TUNE_REPEATS: u32 = 10;
pub const DEFAULT_TUNE_START: u32 = 8;

/// Engine configuration. `from_env` layers `RUNMAT_REDUCE_*` overrides on the defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReduceOptions {
    /// Requested lanes per work-group; clamped to the device and rounded down to a power of two.
    pub workgroup_size: u32,
    pub table_dir: Option<PathBuf>,
    pub device_tag: Option<String>,
    pub dump_dir: Option<PathBuf>,
    /// Forces the division-defect flag instead of probing.
    pub division_defect: Option<bool>,
    /// Pinned modes keyed by operation name (`reduce_sum`, `scatter_add`, ...).
    pub forced_modes: BTreeMap<String, u8>,
    pub calibration: CalibrationConfig,
}

impl Default for ReduceOptions {
    fn default() -> Self {
        Self {
            workgroup_size: DEFAULT_WORKGROUP_SIZE,
            table_dir: None,
            device_tag: None,
            dump_dir: None,
            division_defect: None,
            forced_modes: BTreeMap::new(),
            calibration: CalibrationConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub repeats: u32,
    pub start: u32,
    pub max_rows: u32,
    pub max_cols: u32,
    pub max_classes: u32,
    /// Extrapolated cost (seconds) above which a dimension stops being scanned.
    pub budget_secs: f64,
    /// A single measurement above this (seconds) stops the dimension.
    pub hard_limit_secs: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            repeats: DEFAULT_TUNE_REPEATS,
            start: DEFAULT_TUNE_START,
            max_rows: 1 << 16,
            max_cols: 1 << 16,
            max_classes: 1 << 12,
            budget_secs: 0.05,
            hard_limit_secs: 0.5,
        }
    }
}

impl ReduceOptions {
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Some(wg) = env_u32("RUNMAT_REDUCE_WG") {
            if wg > 0 {
                opts.workgroup_size = wg;
            }
        }
        if let Some(dir) = env_string("RUNMAT_REDUCE_TABLE_DIR") {
            opts.table_dir = Some(PathBuf::from(dir));
        }
        if let Some(tag) = env_string("RUNMAT_REDUCE_DEVICE_TAG") {
            opts.device_tag = Some(tag);
        }
        if let Some(dir) = env_string("RUNMAT_REDUCE_DUMP_DIR") {
            opts.dump_dir = Some(PathBuf::from(dir));
        }
        opts.division_defect = env_bool("RUNMAT_REDUCE_DIV_DEFECT");
        for op in ["scatter_add", "reduce_sum", "reduce_max", "reduce_arg_max"] {
            let var = format!("RUNMAT_REDUCE_FORCE_{}_MODE", op.to_ascii_uppercase());
            match std::env::var(&var) {
                Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse::<u8>() {
                    Ok(mode) => {
                        opts.forced_modes.insert(op.to_string(), mode);
                    }
                    Err(_) => log::warn!("{var}='{raw}' is not a mode number; ignoring"),
                },
                _ => {}
            }
        }
        if let Some(n) = env_u32("RUNMAT_REDUCE_TUNE_REPEATS") {
            opts.calibration.repeats = n.max(1);
        }
        if let Some(ms) = env_f64("RUNMAT_REDUCE_TUNE_BUDGET_MS") {
            opts.calibration.budget_secs = ms / 1000.0;
        }
        if let Some(ms) = env_f64("RUNMAT_REDUCE_TUNE_HARD_LIMIT_MS") {
            opts.calibration.hard_limit_secs = ms / 1000.0;
        }
        opts
    }
}

fn env_string(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u32(var: &str) -> Option<u32> {
    env_string(var).and_then(|v| v.parse::<u32>().ok())
}

fn env_f64(var: &str) -> Option<f64> {
    env_string(var)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_bool(var: &str) -> Option<bool> {
    env_string(var).and_then(|v| parse_bool(&v))
}
