//! Ventti Pose - Wasm Core
//!
//! Character pose evaluation: blends animation sequences into a local
//! pose, corrects leg chains with two-bone IK against latched targets,
//! and caches the resulting world bone matrices.

pub mod animation;
pub mod asset_limits;
#[cfg(target_arch = "wasm32")]
pub mod bindings;
pub mod blend;
pub mod bone;
pub mod config;
pub mod error;
pub mod ik;
pub mod math;
pub mod rig;
pub mod sequence;
pub mod skeleton;
pub mod state;

pub use animation::AnimationLibrary;
pub use blend::{accumulate_pose, calc_autoplay_sequences, calc_pose, EvalContext};
pub use bone::{BoneCache, BoneCacheManager, BoneChain, CacheHandle, Pose};
pub use config::{CacheTuning, IkTuning, RigConfig};
pub use error::RigError;
pub use ik::IkContext;
pub use rig::{flat_ground, FrameRequest, GroundHit, RigInstance};
pub use skeleton::{BoneMask, Skeleton};

#[cfg(target_arch = "wasm32")]
pub use bindings::{
    clear_rig_targets, create_rig, destroy_rig, evaluate_rig, init_logging, rig_bone_matrices,
    rig_ik_targets, rig_local_pose, rig_sequence_index, set_pose_parameter,
};
