//! Tunable constants for IK latching, auto-release and the bone cache.
//!
//! Defaults reproduce the empirically tuned values the pose pipeline was
//! balanced against. Every field can be overridden from a JSON document; any
//! field left out keeps its default.

use crate::error::RigError;
use serde::{Deserialize, Serialize};

/// IK solver and latch/release tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IkTuning {
    /// Fraction of full reach (l1 + l2) the solver may extend to
    pub knee_max_epsilon: f32,
    /// Multiple of |l1 - l2| the target must stay away from the hip
    pub knee_min_factor: f32,
    /// Seconds an error keeps a target in the auto-release state
    pub error_hold: f32,
    /// Seconds after the last error during which the release ramp rises
    pub error_ramp_window: f32,
    /// Release ramp change per second
    pub error_ramp_rate: f32,
    /// Cosine of the largest latched twist before the target is flagged
    pub max_twist_cos: f32,
    /// Latch level above which reach/twist errors are checked
    pub latch_error_threshold: f32,
    /// Scale applied to the latched reach before comparing to l1 + l2
    pub reach_slack: f32,
    /// Latch delta kept after a failed solve
    pub failure_decay: f32,
    /// GROUND rules with a window wider than this keep a virtual loop section
    pub ground_loop_window: f32,
    /// Combined rule weight at which a rule overrides the chain's earlier rules
    pub override_weight: f32,
}

impl Default for IkTuning {
    fn default() -> Self {
        Self {
            knee_max_epsilon: 0.9998,
            knee_min_factor: 1.05,
            error_hold: 0.5,
            error_ramp_window: 0.25,
            error_ramp_rate: 4.0,
            max_twist_cos: 0.707,
            latch_error_threshold: 0.2,
            reach_slack: 0.95,
            failure_decay: 0.8,
            ground_loop_window: 0.75,
            override_weight: 0.999,
        }
    }
}

/// Bone cache manager tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTuning {
    /// Byte budget shared by all live cache entries
    pub budget_bytes: usize,
    /// Default freshness window in seconds used by `RigInstance`
    pub max_drift: f32,
}

impl Default for CacheTuning {
    fn default() -> Self {
        Self {
            budget_bytes: 16 * 1024,
            max_drift: 0.0,
        }
    }
}

/// Top-level tuning document
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub ik: IkTuning,
    pub cache: CacheTuning,
}

impl RigConfig {
    /// Parse from JSON string
    pub fn from_json(json: &str) -> Result<Self, RigError> {
        let config: RigConfig = serde_json::from_str(json)?;
        log::info!(
            "Loaded rig config (cache budget {} bytes)",
            config.cache.budget_bytes
        );
        Ok(config)
    }

    /// Convert to JSON string
    pub fn to_json_string(&self) -> Result<String, RigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
