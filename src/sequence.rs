//! Sequences: a blend grid of clips driven by pose parameters, with
//! per-bone weights, overlay layers and IK locks.

use crate::asset_limits::MAX_BLEND_AXES;
use crate::bone::{BoneIndex, ClipId, PoseParamId, SequenceId};
use crate::error::RigError;
use crate::skeleton::{IkLock, PoseParamDesc, Skeleton};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct SequenceFlags: u32 {
        /// Phase wraps instead of clamping
        const LOOPING = 1 << 0;
        /// Clips are offsets applied on top of the accumulated pose
        const DELTA = 1 << 1;
        /// Delta applied after the base rotation rather than before
        const POST = 1 << 2;
        /// Blend in world space
        const WORLD = 1 << 3;
        /// Phase derived from the context clock
        const REALTIME = 1 << 4;
        /// Accumulate from the rest pose instead of the current pose
        const LOCAL = 1 << 5;
        /// Played every frame by `calc_autoplay_sequences`
        const AUTOPLAY = 1 << 6;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct LayerFlags: u32 {
        /// Ease the ramp with a cubic spline
        const SPLINE = 1 << 0;
        /// Cross-fade instead of scaling on the way out
        const XFADE = 1 << 1;
        /// Ignore the parent weight
        const NOBLEND = 1 << 2;
        /// Applied to the scratch pose of a LOCAL sequence
        const LOCAL = 1 << 3;
        /// Driven by a pose parameter instead of the phase
        const POSE = 1 << 4;
    }
}

fn one() -> usize {
    1
}

/// One dimension of a blend grid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlendAxis {
    pub param: PoseParamId,
    #[serde(default = "one")]
    pub size: usize,
    /// Parameter value at the first column; defaults to the parameter start
    #[serde(default)]
    pub start: Option<f32>,
    /// Parameter value at the last column; defaults to the parameter end
    #[serde(default)]
    pub end: Option<f32>,
    /// Explicit parameter value for each column
    #[serde(default)]
    pub keys: Vec<f32>,
}

impl BlendAxis {
    pub fn range(&self, desc: &PoseParamDesc) -> (f32, f32) {
        (
            self.start.unwrap_or(desc.start),
            self.end.unwrap_or(desc.end),
        )
    }
}

/// Clips laid out over up to two pose parameters, row-major
/// (`clips[i1 * size0 + i0]`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlendGrid {
    #[serde(default)]
    pub axes: Vec<BlendAxis>,
    pub clips: Vec<ClipId>,
}

impl BlendGrid {
    /// Column count along an axis (1 for a missing axis)
    #[inline]
    pub fn size(&self, axis: usize) -> usize {
        self.axes.get(axis).map_or(1, |a| a.size.max(1))
    }

    /// Clip at a grid cell, indices clamped to the grid
    pub fn clip(&self, i0: usize, i1: usize) -> Option<ClipId> {
        let size0 = self.size(0);
        let i0 = i0.min(size0 - 1);
        let i1 = i1.min(self.size(1) - 1);
        self.clips.get(i1 * size0 + i0).copied()
    }
}

/// Overlay sequence blended on top of its parent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub sequence: SequenceId,
    #[serde(default)]
    pub flags: LayerFlags,
    /// Parameter driving POSE layers
    #[serde(default)]
    pub pose: Option<PoseParamId>,
    #[serde(default)]
    pub start: f32,
    #[serde(default)]
    pub peak: f32,
    #[serde(default)]
    pub tail: f32,
    #[serde(default)]
    pub end: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub name: String,
    #[serde(default)]
    pub flags: SequenceFlags,
    pub grid: BlendGrid,
    /// Per-bone weight; empty means 1.0 for every bone
    #[serde(default)]
    pub bone_weights: Vec<f32>,
    #[serde(default)]
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub ik_locks: Vec<IkLock>,
    #[serde(default)]
    pub activity: Option<String>,
}

impl Sequence {
    #[inline]
    pub fn has(&self, flags: SequenceFlags) -> bool {
        self.flags.contains(flags)
    }

    #[inline]
    pub fn bone_weight(&self, bone: BoneIndex) -> f32 {
        if self.bone_weights.is_empty() {
            1.0
        } else {
            self.bone_weights.get(bone).copied().unwrap_or(0.0)
        }
    }

    pub fn validate(
        &self,
        skeleton: &Skeleton,
        clip_count: usize,
        sequence_count: usize,
    ) -> Result<(), RigError> {
        let grid = &self.grid;
        if grid.axes.len() > MAX_BLEND_AXES {
            return Err(RigError::GridShape {
                sequence: self.name.clone(),
                expected: MAX_BLEND_AXES,
                found: grid.axes.len(),
            });
        }

        let expected = grid.size(0) * grid.size(1);
        if grid.clips.len() != expected {
            return Err(RigError::GridShape {
                sequence: self.name.clone(),
                expected,
                found: grid.clips.len(),
            });
        }
        if let Some(clip) = grid.clips.iter().find(|c| c.index() >= clip_count) {
            return Err(RigError::UnknownClip {
                sequence: self.name.clone(),
                clip: clip.index(),
            });
        }

        for (i, axis) in grid.axes.iter().enumerate() {
            if axis.param.index() >= skeleton.pose_parameters.len() {
                return Err(RigError::UnknownPoseParameter {
                    sequence: self.name.clone(),
                    param: axis.param.index(),
                });
            }
            if !axis.keys.is_empty() && axis.keys.len() != axis.size.max(1) {
                return Err(RigError::PoseKeys {
                    sequence: self.name.clone(),
                    axis: i,
                    found: axis.keys.len(),
                    expected: axis.size.max(1),
                });
            }
        }

        if !self.bone_weights.is_empty() && self.bone_weights.len() != skeleton.bone_count() {
            return Err(RigError::WeightTable {
                sequence: self.name.clone(),
                found: self.bone_weights.len(),
                bones: skeleton.bone_count(),
            });
        }

        for layer in &self.layers {
            if layer.sequence.index() >= sequence_count {
                return Err(RigError::UnknownLayerSequence {
                    sequence: self.name.clone(),
                    layer: layer.sequence.index(),
                });
            }
            if let Some(param) = layer.pose.filter(|p| p.index() >= skeleton.pose_parameters.len()) {
                return Err(RigError::UnknownPoseParameter {
                    sequence: self.name.clone(),
                    param: param.index(),
                });
            }
        }

        if let Some(lock) = self
            .ik_locks
            .iter()
            .find(|l| l.chain.index() >= skeleton.ik_chains.len())
        {
            return Err(RigError::LockChain {
                chain: lock.chain.index(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_bindgen_test::*;

    fn skeleton() -> Skeleton {
        serde_json::from_str(
            r#"{ "bones": [ { "name": "root" }, { "name": "spine", "parent": 0 } ],
                 "pose_parameters": [ { "name": "move_x", "start": -1.0, "end": 1.0 } ] }"#,
        )
        .unwrap()
    }

    fn run() -> Sequence {
        serde_json::from_str(
            r#"{
                "name": "run",
                "flags": "LOOPING | REALTIME",
                "grid": { "axes": [ { "param": 0, "size": 3 } ], "clips": [0, 1, 2] },
                "layers": [ { "sequence": 1, "flags": "SPLINE | POSE", "pose": 0, "start": 0.0, "peak": 0.5, "tail": 0.5, "end": 1.0 } ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_flags_parse_from_names() {
        let seq = run();
        assert!(seq.has(SequenceFlags::LOOPING));
        assert!(seq.has(SequenceFlags::REALTIME));
        assert!(!seq.has(SequenceFlags::DELTA));
        assert!(seq.layers[0].flags.contains(LayerFlags::POSE | LayerFlags::SPLINE));
        assert_eq!(seq.bone_weight(1), 1.0);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_grid_clip_lookup_clamps() {
        let seq = run();
        assert_eq!(seq.grid.size(0), 3);
        assert_eq!(seq.grid.size(1), 1);
        assert_eq!(seq.grid.clip(1, 0), Some(ClipId(1)));
        assert_eq!(seq.grid.clip(5, 3), Some(ClipId(2)));
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_validate_catches_shape_and_references() {
        let skeleton = skeleton();
        let seq = run();
        assert!(seq.validate(&skeleton, 3, 2).is_ok());

        assert!(matches!(
            seq.validate(&skeleton, 2, 2),
            Err(RigError::UnknownClip { clip: 2, .. })
        ));
        assert!(matches!(
            seq.validate(&skeleton, 3, 1),
            Err(RigError::UnknownLayerSequence { layer: 1, .. })
        ));

        let mut bad = run();
        bad.grid.clips.pop();
        assert!(matches!(
            bad.validate(&skeleton, 3, 2),
            Err(RigError::GridShape { expected: 3, found: 2, .. })
        ));

        let mut bad = run();
        bad.bone_weights = vec![1.0];
        assert!(matches!(
            bad.validate(&skeleton, 3, 2),
            Err(RigError::WeightTable { found: 1, bones: 2, .. })
        ));

        let mut bad = run();
        bad.grid.axes[0].keys = vec![0.0, 1.0];
        assert!(matches!(
            bad.validate(&skeleton, 3, 2),
            Err(RigError::PoseKeys { found: 2, expected: 3, .. })
        ));
    }

    #[test]
    fn test_weight_table_missing_bone_is_zero() {
        let mut seq = run();
        seq.bone_weights = vec![0.25, 0.5];
        assert_eq!(seq.bone_weight(1), 0.5);
        assert_eq!(seq.bone_weight(4), 0.0);
    }
}
