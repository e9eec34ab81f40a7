use super::cache::BoneSet;
use super::id::BoneIndex;
use crate::math::{decompose, rigid};
use crate::skeleton::{BoneMask, Skeleton};
use glam::{Affine3A, Quat, Vec3};

/// Local-space pose: one position and rotation per skeleton bone,
/// relative to the bone's parent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pose {
    pub positions: Vec<Vec3>,
    pub rotations: Vec<Quat>,
}

impl Pose {
    /// All bones at the origin with no rotation
    pub fn identity(bone_count: usize) -> Self {
        Self {
            positions: vec![Vec3::ZERO; bone_count],
            rotations: vec![Quat::IDENTITY; bone_count],
        }
    }

    /// The skeleton's rest pose
    pub fn rest(skeleton: &Skeleton) -> Self {
        Self {
            positions: skeleton.bones.iter().map(|b| b.position).collect(),
            rotations: skeleton.bones.iter().map(|b| b.rotation).collect(),
        }
    }

    pub fn reset_to_rest(&mut self, skeleton: &Skeleton) {
        self.positions.clear();
        self.rotations.clear();
        self.positions.extend(skeleton.bones.iter().map(|b| b.position));
        self.rotations.extend(skeleton.bones.iter().map(|b| b.rotation));
    }

    /// Overwrite with another pose without reallocating
    pub fn copy_from(&mut self, other: &Pose) {
        self.positions.clone_from(&other.positions);
        self.rotations.clone_from(&other.rotations);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rotations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rotations.is_empty()
    }

    /// Local transform of a bone
    #[inline]
    pub fn local(&self, bone: BoneIndex) -> Affine3A {
        rigid(self.rotations[bone], self.positions[bone])
    }

    #[inline]
    pub fn set_local(&mut self, bone: BoneIndex, rotation: Quat, position: Vec3) {
        self.rotations[bone] = rotation;
        self.positions[bone] = position;
    }
}

/// World transforms for a pose, built lazily.
///
/// A bone is composed at most once per chain. Requests for a bone compose
/// only the uncomputed part of its ancestry, so building a foot after its
/// hip costs two multiplications, not a walk from the root.
#[derive(Debug, Clone)]
pub struct BoneChain {
    root: Affine3A,
    world: Vec<Affine3A>,
    computed: BoneSet,
}

impl BoneChain {
    pub fn new(bone_count: usize, root: Affine3A) -> Self {
        Self {
            root,
            world: vec![Affine3A::IDENTITY; bone_count],
            computed: BoneSet::default(),
        }
    }

    /// Forget every computed transform and start over from a new root
    pub fn reset(&mut self, root: Affine3A) {
        self.root = root;
        self.computed.clear();
    }

    #[inline]
    pub fn root(&self) -> Affine3A {
        self.root
    }

    #[inline]
    pub fn is_built(&self, bone: BoneIndex) -> bool {
        self.computed.is_marked(bone)
    }

    /// World transform of `bone`, composing any missing ancestors first
    pub fn build(&mut self, skeleton: &Skeleton, pose: &Pose, bone: BoneIndex) -> Affine3A {
        if self.computed.is_marked(bone) {
            return self.world[bone];
        }

        // Walk up to the nearest computed ancestor, then compose back down
        let mut pending = Vec::new();
        let mut current = Some(bone);
        while let Some(b) = current {
            if self.computed.is_marked(b) {
                break;
            }
            pending.push(b);
            current = skeleton.parent(b);
        }

        while let Some(b) = pending.pop() {
            let parent = match skeleton.parent(b) {
                Some(p) => self.world[p],
                None => self.root,
            };
            self.world[b] = parent * pose.local(b);
            self.computed.mark(b);
        }
        self.world[bone]
    }

    /// Compute every bone selected by `mask`
    pub fn build_masked(&mut self, skeleton: &Skeleton, pose: &Pose, mask: BoneMask) {
        for (i, bone) in skeleton.bones.iter().enumerate() {
            if bone.is_used_by(mask) {
                self.build(skeleton, pose, i);
            }
        }
    }

    /// Compute every bone
    pub fn build_all(&mut self, skeleton: &Skeleton, pose: &Pose) {
        for i in 0..skeleton.bone_count() {
            self.build(skeleton, pose, i);
        }
    }

    /// Last computed world transform of `bone`
    #[inline]
    pub fn world(&self, bone: BoneIndex) -> Affine3A {
        self.world[bone]
    }

    /// World transform of the bone's parent, or the root
    #[inline]
    pub fn parent_world(&self, skeleton: &Skeleton, bone: BoneIndex) -> Affine3A {
        skeleton.parent(bone).map_or(self.root, |p| self.world[p])
    }

    /// Overwrite a bone's world transform (solver output)
    #[inline]
    pub fn set_world(&mut self, bone: BoneIndex, m: Affine3A) {
        self.world[bone] = m;
        self.computed.mark(bone);
    }

    pub fn transforms(&self) -> &[Affine3A] {
        &self.world
    }
}

/// Back-solve a bone's local position and rotation from its world transform
/// and its parent's (or the root's) world transform.
pub fn solve_bone(skeleton: &Skeleton, bone: BoneIndex, chain: &BoneChain, pose: &mut Pose) {
    let parent = chain.parent_world(skeleton, bone);
    let local = parent.inverse() * chain.world(bone);
    let (rotation, position) = decompose(&local);
    pose.set_local(bone, rotation, position);
}
