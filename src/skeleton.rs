//! Skeleton definition: bone hierarchy, rest pose, IK chains and pose parameters
//!
//! The skeleton is read-only input data. It is built once from a rig document
//! and shared by every evaluation of that character.

use crate::asset_limits::{MAX_BONES, MAX_IK_CHAINS};
use crate::bone::{BoneIndex, ChainId, PoseParamId};
use crate::error::RigError;
use bitflags::bitflags;
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

bitflags! {
    /// Subsets a bone belongs to. Evaluation only touches bones whose mask
    /// intersects the caller's mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct BoneMask: u32 {
        const HITBOX = 1 << 0;
        const ATTACHMENT = 1 << 1;
        const VERTEX_LOD0 = 1 << 2;
        const VERTEX_LOD1 = 1 << 3;
        const VERTEX_LOD2 = 1 << 4;
        const VERTEX_LOD3 = 1 << 5;
        const BONE_MERGE = 1 << 6;

        const VERTEX_ANY = Self::VERTEX_LOD0.bits()
            | Self::VERTEX_LOD1.bits()
            | Self::VERTEX_LOD2.bits()
            | Self::VERTEX_LOD3.bits();
        const ANYTHING = Self::HITBOX.bits()
            | Self::ATTACHMENT.bits()
            | Self::VERTEX_ANY.bits()
            | Self::BONE_MERGE.bits();
    }
}

impl Default for BoneMask {
    fn default() -> Self {
        BoneMask::ANYTHING
    }
}

bitflags! {
    /// Per-bone evaluation flags
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct BoneFlags: u32 {
        /// Rotation is re-aligned to `Bone::alignment` after sampling and
        /// blended without hemisphere correction
        const FIXED_ALIGNMENT = 1 << 0;
    }
}

fn identity_quat() -> Quat {
    Quat::IDENTITY
}

/// A single bone of the hierarchy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bone {
    pub name: String,
    /// Parent bone (None for root)
    #[serde(default)]
    pub parent: Option<BoneIndex>,
    /// Rest-pose position relative to the parent
    #[serde(default)]
    pub position: Vec3,
    /// Rest-pose rotation relative to the parent
    #[serde(default = "identity_quat")]
    pub rotation: Quat,
    #[serde(default)]
    pub mask: BoneMask,
    #[serde(default)]
    pub flags: BoneFlags,
    /// Canonical orientation for fixed-alignment bones
    #[serde(default = "identity_quat")]
    pub alignment: Quat,
}

impl Bone {
    #[inline]
    pub fn is_used_by(&self, mask: BoneMask) -> bool {
        self.mask.intersects(mask)
    }

    #[inline]
    pub fn has_fixed_alignment(&self) -> bool {
        self.flags.contains(BoneFlags::FIXED_ALIGNMENT)
    }
}

/// Three-joint limb solved analytically (hip, knee, foot)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IkChain {
    pub name: String,
    pub links: [BoneIndex; 3],
    /// Preferred bend direction in the hip bone's space
    #[serde(default)]
    pub knee_dir: Option<Vec3>,
}

impl IkChain {
    #[inline]
    pub fn hip(&self) -> BoneIndex {
        self.links[0]
    }

    #[inline]
    pub fn knee(&self) -> BoneIndex {
        self.links[1]
    }

    #[inline]
    pub fn foot(&self) -> BoneIndex {
        self.links[2]
    }

    /// Bend direction, if one is authored and non-degenerate
    pub fn bend_direction(&self) -> Option<Vec3> {
        self.knee_dir.filter(|dir| dir.length_squared() > 0.0)
    }
}

/// Caller-controlled scalar driving blend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseParamDesc {
    pub name: String,
    pub start: f32,
    pub end: f32,
    /// Wrap length for cyclic parameters (0 = clamp instead)
    #[serde(default)]
    pub loop_range: f32,
}

impl PoseParamDesc {
    /// Wrap a raw value around the centre of the range for looping parameters
    pub fn wrap(&self, value: f32) -> f32 {
        if self.loop_range == 0.0 {
            return value;
        }
        let wrap = (self.start + self.end) / 2.0 + self.loop_range / 2.0;
        let shift = self.loop_range - wrap;
        value - self.loop_range * ((value + shift) / self.loop_range).floor()
    }

    /// Map a raw value to [0, 1] over the declared range
    pub fn normalize(&self, value: f32) -> f32 {
        let span = self.end - self.start;
        if span == 0.0 {
            return 0.0;
        }
        ((self.wrap(value) - self.start) / span).clamp(0.0, 1.0)
    }

    /// Inverse of `normalize`
    pub fn denormalize(&self, ctl: f32) -> f32 {
        ctl * (self.end - self.start) + self.start
    }

    /// Raw value brought inside the declared range
    pub fn clamp_raw(&self, value: f32) -> f32 {
        self.denormalize(self.normalize(value))
    }
}

/// Lock that pins a chain's foot while other animation plays over it
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IkLock {
    pub chain: ChainId,
    /// How strongly the foot position is held
    #[serde(default = "one")]
    pub pos_weight: f32,
    /// How much of the animated foot rotation survives the lock
    #[serde(default)]
    pub local_q_weight: f32,
}

fn one() -> f32 {
    1.0
}

/// Bone hierarchy plus the IK and pose parameter tables that refer to it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Skeleton {
    pub bones: Vec<Bone>,
    #[serde(default)]
    pub ik_chains: Vec<IkChain>,
    #[serde(default)]
    pub pose_parameters: Vec<PoseParamDesc>,
    /// Locks applied around autoplay sequences
    #[serde(default)]
    pub autoplay_locks: Vec<IkLock>,
}

impl Skeleton {
    #[inline]
    pub fn bone_count(&self) -> usize {
        self.bones.len()
    }

    #[inline]
    pub fn parent(&self, bone: BoneIndex) -> Option<BoneIndex> {
        self.bones.get(bone).and_then(|b| b.parent)
    }

    /// Whether a bone exists and is selected by `mask`
    #[inline]
    pub fn is_bone_used(&self, bone: BoneIndex, mask: BoneMask) -> bool {
        self.bones.get(bone).is_some_and(|b| b.is_used_by(mask))
    }

    pub fn bone_index(&self, name: &str) -> Option<BoneIndex> {
        self.bones.iter().position(|b| b.name == name)
    }

    pub fn chain(&self, id: ChainId) -> Option<&IkChain> {
        self.ik_chains.get(id.index())
    }

    pub fn chain_index(&self, name: &str) -> Option<ChainId> {
        self.ik_chains
            .iter()
            .position(|c| c.name == name)
            .map(ChainId::from)
    }

    pub fn pose_parameter(&self, id: PoseParamId) -> Option<&PoseParamDesc> {
        self.pose_parameters.get(id.index())
    }

    /// Check hierarchy order and index ranges
    pub fn validate(&self) -> Result<(), RigError> {
        if self.bones.is_empty() {
            return Err(RigError::EmptySkeleton);
        }
        if self.bones.len() > MAX_BONES {
            return Err(RigError::TooManyBones {
                count: self.bones.len(),
                max: MAX_BONES,
            });
        }
        for (i, bone) in self.bones.iter().enumerate() {
            if let Some(parent) = bone.parent {
                if parent >= i {
                    return Err(RigError::ParentOrder {
                        bone: bone.name.clone(),
                        parent,
                    });
                }
            }
        }

        if self.ik_chains.len() > MAX_IK_CHAINS {
            return Err(RigError::TooManyChains {
                count: self.ik_chains.len(),
                max: MAX_IK_CHAINS,
            });
        }
        for chain in &self.ik_chains {
            if let Some(&bone) = chain.links.iter().find(|&&b| b >= self.bones.len()) {
                return Err(RigError::ChainBone {
                    chain: chain.name.clone(),
                    bone,
                });
            }
        }
        for lock in &self.autoplay_locks {
            if lock.chain.index() >= self.ik_chains.len() {
                return Err(RigError::LockChain {
                    chain: lock.chain.index(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_bindgen_test::*;

    fn leg() -> Skeleton {
        serde_json::from_str(
            r#"{
                "bones": [
                    { "name": "hip" },
                    { "name": "knee", "parent": 0, "position": [0.0, 0.0, -0.5] },
                    { "name": "foot", "parent": 1, "position": [0.0, 0.0, -0.5], "mask": "VERTEX_LOD0" }
                ],
                "ik_chains": [ { "name": "leg", "links": [0, 1, 2] } ],
                "pose_parameters": [ { "name": "yaw", "start": -180.0, "end": 180.0, "loop_range": 360.0 } ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_defaults_and_masks() {
        let skeleton = leg();
        assert!(skeleton.validate().is_ok());
        assert_eq!(skeleton.bones[0].mask, BoneMask::ANYTHING);
        assert_eq!(skeleton.bones[0].rotation, Quat::IDENTITY);
        assert!(skeleton.is_bone_used(2, BoneMask::VERTEX_LOD0));
        assert!(!skeleton.is_bone_used(2, BoneMask::HITBOX));
        assert!(!skeleton.is_bone_used(9, BoneMask::ANYTHING));
        assert_eq!(skeleton.chain_index("leg"), Some(ChainId(0)));
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_parent_must_precede_child() {
        let mut skeleton = leg();
        skeleton.bones[1].parent = Some(2);
        assert!(matches!(
            skeleton.validate(),
            Err(RigError::ParentOrder { parent: 2, .. })
        ));
    }

    #[test]
    fn test_chain_out_of_range_is_rejected() {
        let mut skeleton = leg();
        skeleton.ik_chains[0].links[2] = 5;
        assert!(matches!(
            skeleton.validate(),
            Err(RigError::ChainBone { bone: 5, .. })
        ));
    }

    #[test]
    fn test_looping_parameter_wraps_around_centre() {
        let yaw = &leg().pose_parameters[0];
        assert!((yaw.wrap(190.0) - (-170.0)).abs() < 1e-4);
        assert!((yaw.wrap(-190.0) - 170.0).abs() < 1e-4);
        assert!((yaw.wrap(45.0) - 45.0).abs() < 1e-4);
        assert!((yaw.normalize(0.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_non_looping_parameter_clamps() {
        let speed = PoseParamDesc {
            name: "speed".into(),
            start: 0.0,
            end: 10.0,
            loop_range: 0.0,
        };
        assert_eq!(speed.normalize(-3.0), 0.0);
        assert_eq!(speed.normalize(25.0), 1.0);
        assert_eq!(speed.clamp_raw(25.0), 10.0);
    }
}
