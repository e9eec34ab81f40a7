//! Load-time errors for rig assets and tuning files.
//!
//! Runtime evaluation never returns these: frame-level problems degrade to a
//! fallback pose and a log diagnostic instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RigError {
    #[error("failed to parse rig JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("skeleton has no bones")]
    EmptySkeleton,

    #[error("skeleton has {count} bones (max {max})")]
    TooManyBones { count: usize, max: usize },

    #[error("bone '{bone}' lists parent {parent} which does not precede it")]
    ParentOrder { bone: String, parent: usize },

    #[error("skeleton has {count} IK chains (max {max})")]
    TooManyChains { count: usize, max: usize },

    #[error("IK chain '{chain}' references bone {bone} outside the skeleton")]
    ChainBone { chain: String, bone: usize },

    #[error("IK lock references chain {chain} outside the skeleton")]
    LockChain { chain: usize },

    #[error("clip '{clip}' has zero frames")]
    EmptyClip { clip: String },

    #[error("clip '{clip}' animates bone {bone} outside the skeleton")]
    TrackBone { clip: String, bone: usize },

    #[error("clip '{clip}' IK rule references chain {chain} outside the skeleton")]
    RuleChain { clip: String, chain: usize },

    #[error("clip '{clip}' IK rule uses target slot {slot} (max {max})")]
    RuleSlot { clip: String, slot: usize, max: usize },

    #[error("sequence '{sequence}' references unknown clip {clip}")]
    UnknownClip { sequence: String, clip: usize },

    #[error("sequence '{sequence}' references unknown sequence {layer}")]
    UnknownLayerSequence { sequence: String, layer: usize },

    #[error("sequence '{sequence}' references unknown pose parameter {param}")]
    UnknownPoseParameter { sequence: String, param: usize },

    #[error("sequence '{sequence}' grid expects {expected} clips, found {found}")]
    GridShape {
        sequence: String,
        expected: usize,
        found: usize,
    },

    #[error("sequence '{sequence}' has {found} bone weights, skeleton has {bones}")]
    WeightTable {
        sequence: String,
        found: usize,
        bones: usize,
    },

    #[error("sequence '{sequence}' axis {axis} has {found} pose keys, expected {expected}")]
    PoseKeys {
        sequence: String,
        axis: usize,
        found: usize,
        expected: usize,
    },

    #[error("sequence '{sequence}' layers back onto itself")]
    LayerCycle { sequence: String },
}
