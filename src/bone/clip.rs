use super::id::{BoneIndex, ChainId};
use crate::asset_limits::MAX_IK_TARGETS;
use crate::error::RigError;
use crate::ik::PhaseWindow;
use crate::math::QuatBlend;
use crate::skeleton::Skeleton;
use glam::{Quat, Vec3};
use half::f16;
use serde::{Deserialize, Serialize};

// ============================================================================
// Bone tracks
// ============================================================================

/// Per-frame samples for one bone. An empty channel is unkeyed, a single
/// sample holds for the whole clip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoneTrack {
    pub bone: BoneIndex,
    #[serde(default)]
    pub rotations: Vec<Quat>,
    #[serde(default)]
    pub positions: Vec<Vec3>,
}

#[inline]
fn frame_pair(len: usize, frame: usize) -> (usize, usize) {
    let k = frame.min(len - 1);
    (k, (k + 1).min(len - 1))
}

impl BoneTrack {
    pub fn sample_rotation(&self, frame: usize, s: f32) -> Option<Quat> {
        match self.rotations.len() {
            0 => None,
            1 => Some(self.rotations[0]),
            len => {
                let (k0, k1) = frame_pair(len, frame);
                if k0 == k1 || s <= 0.0 {
                    Some(self.rotations[k0])
                } else {
                    Some(self.rotations[k0].slerp_to(self.rotations[k1], s))
                }
            }
        }
    }

    pub fn sample_position(&self, frame: usize, s: f32) -> Option<Vec3> {
        match self.positions.len() {
            0 => None,
            1 => Some(self.positions[0]),
            len => {
                let (k0, k1) = frame_pair(len, frame);
                Some(self.positions[k0].lerp(self.positions[k1], s))
            }
        }
    }

    fn is_identity(&self) -> bool {
        self.rotations
            .iter()
            .all(|q| q.abs_diff_eq(Quat::IDENTITY, 1e-6) || q.abs_diff_eq(-Quat::IDENTITY, 1e-6))
            && self.positions.iter().all(|p| p.abs_diff_eq(Vec3::ZERO, 1e-6))
    }
}

// ============================================================================
// Zero frame
// ============================================================================

/// Half precision snapshot of a track every `span` frames
#[derive(Debug, Clone, Default)]
pub struct ZeroTrack {
    pub bone: BoneIndex,
    pub rotations: Vec<[f16; 4]>,
    pub positions: Vec<[f16; 3]>,
}

/// Reduced-precision fallback used while the full curves are not resident
#[derive(Debug, Clone, Default)]
pub struct ZeroFrame {
    pub span: usize,
    pub tracks: Vec<ZeroTrack>,
}

fn pack_quat(q: Quat) -> [f16; 4] {
    q.to_array().map(f16::from_f32)
}

fn unpack_quat(q: &[f16; 4]) -> Quat {
    Quat::from_array(q.map(f16::to_f32)).normalize()
}

fn pack_vec3(v: Vec3) -> [f16; 3] {
    v.to_array().map(f16::from_f32)
}

fn unpack_vec3(v: &[f16; 3]) -> Vec3 {
    Vec3::from_array(v.map(f16::to_f32))
}

impl ZeroFrame {
    fn build(tracks: &[BoneTrack], frame_count: usize, span: usize) -> Self {
        let span = span.max(1);
        let samples = frame_count.saturating_sub(1) / span + 1;
        let tracks = tracks
            .iter()
            .map(|track| ZeroTrack {
                bone: track.bone,
                rotations: if track.rotations.is_empty() {
                    Vec::new()
                } else {
                    (0..samples)
                        .filter_map(|i| track.sample_rotation(i * span, 0.0))
                        .map(pack_quat)
                        .collect()
                },
                positions: if track.positions.is_empty() {
                    Vec::new()
                } else {
                    (0..samples)
                        .filter_map(|i| track.sample_position(i * span, 0.0))
                        .map(pack_vec3)
                        .collect()
                },
            })
            .collect();
        Self { span, tracks }
    }

    fn sample(&self, track: &ZeroTrack, frame: usize, s: f32) -> (Option<Quat>, Option<Vec3>) {
        let index = frame / self.span;
        let t = ((frame % self.span) as f32 + s) / self.span as f32;

        let rotation = match track.rotations.len() {
            0 => None,
            len => {
                let (k0, k1) = frame_pair(len, index);
                Some(unpack_quat(&track.rotations[k0]).slerp_to(unpack_quat(&track.rotations[k1]), t))
            }
        };
        let position = match track.positions.len() {
            0 => None,
            len => {
                let (k0, k1) = frame_pair(len, index);
                Some(unpack_vec3(&track.positions[k0]).lerp(unpack_vec3(&track.positions[k1]), t))
            }
        };
        (rotation, position)
    }
}

// ============================================================================
// Embedded IK rules
// ============================================================================

/// What an authored rule asks of its chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IkRuleKind {
    /// Foot follows a pose relative to another bone (or the root)
    #[serde(rename = "self")]
    SelfRelative {
        #[serde(default)]
        bone: Option<BoneIndex>,
    },
    /// Foot follows an absolute pose
    World,
    /// Foot latches to the ground through a target slot
    Ground {
        slot: usize,
        #[serde(default)]
        height: f32,
        #[serde(default)]
        floor: f32,
        #[serde(default)]
        radius: f32,
    },
    /// Foot latches to a named attachment through a target slot
    Attachment {
        slot: usize,
        #[serde(default)]
        attachment: Option<String>,
        #[serde(default)]
        radius: f32,
    },
    /// Blend the slot's target back to the animated foot
    Release { slot: usize },
    /// Drop the slot's latch without releasing the target
    Unlatch { slot: usize },
}

impl IkRuleKind {
    /// Target slot, for kinds that drive one
    pub fn slot(&self) -> Option<usize> {
        match *self {
            IkRuleKind::Ground { slot, .. }
            | IkRuleKind::Attachment { slot, .. }
            | IkRuleKind::Release { slot }
            | IkRuleKind::Unlatch { slot } => Some(slot),
            IkRuleKind::SelfRelative { .. } | IkRuleKind::World => None,
        }
    }

    #[inline]
    pub fn is_ground(&self) -> bool {
        matches!(self, IkRuleKind::Ground { .. })
    }

    /// Kinds whose error curve shapes the target
    #[inline]
    pub fn uses_error_curve(&self) -> bool {
        matches!(
            self,
            IkRuleKind::SelfRelative { .. }
                | IkRuleKind::World
                | IkRuleKind::Ground { .. }
                | IkRuleKind::Attachment { .. }
        )
    }
}

/// Foot pose for one frame of a rule's active range
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IkErrorKey {
    pub pos: Vec3,
    #[serde(default = "identity")]
    pub rotation: Quat,
}

fn identity() -> Quat {
    Quat::IDENTITY
}

/// Per-frame foot poses starting at the rule's start frame
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IkErrorCurve {
    pub keys: Vec<IkErrorKey>,
}

fn default_tail() -> f32 {
    1.0
}

/// Rule authored into a clip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipIkRule {
    pub chain: ChainId,
    #[serde(flatten)]
    pub kind: IkRuleKind,
    #[serde(default)]
    pub start: f32,
    #[serde(default)]
    pub peak: f32,
    #[serde(default = "default_tail")]
    pub tail: f32,
    #[serde(default = "default_tail")]
    pub end: f32,
    #[serde(default)]
    pub error: Option<IkErrorCurve>,
}

impl ClipIkRule {
    #[inline]
    pub fn window(&self) -> PhaseWindow {
        PhaseWindow {
            start: self.start,
            peak: self.peak,
            tail: self.tail,
            end: self.end,
        }
    }

    /// Sample the error curve at `cycle` for a clip of `frame_count` frames.
    /// Outside the rule window the curve holds its first or last key.
    pub fn sample_error(&self, frame_count: u32, cycle: f32) -> Option<(Vec3, Quat)> {
        let keys = &self.error.as_ref()?.keys;
        if keys.is_empty() {
            return None;
        }

        let cycle = self.window().wrap_cycle(cycle);
        let frames = frame_count.saturating_sub(1) as f32;
        let (k, fraq) = if cycle < self.start {
            (0, 0.0)
        } else {
            let local = frames * (cycle.min(self.end) - self.start);
            let k = local.floor();
            (k as usize, local - k)
        };

        let (k0, k1) = frame_pair(keys.len(), k);
        let a = &keys[k0];
        if fraq < 0.001 || k0 == k1 {
            return Some((a.pos, a.rotation));
        }
        let b = &keys[k1];
        Some((a.pos.lerp(b.pos, fraq), a.rotation.blend_to(b.rotation, fraq)))
    }
}

// ============================================================================
// Clip
// ============================================================================

fn default_fps() -> f32 {
    30.0
}

fn resident_by_default() -> bool {
    true
}

/// A baked animation clip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clip {
    pub name: String,
    #[serde(default = "default_fps")]
    pub fps: f32,
    pub frame_count: u32,
    /// Samples are offsets applied on top of another pose
    #[serde(default)]
    pub delta: bool,
    #[serde(default)]
    pub tracks: Vec<BoneTrack>,
    /// False while the full curves are still streaming in
    #[serde(default = "resident_by_default")]
    pub resident: bool,
    /// Frame spacing of the half precision fallback snapshot
    #[serde(default)]
    pub zero_frame_span: Option<u32>,
    #[serde(default)]
    pub ik_rules: Vec<ClipIkRule>,

    #[serde(skip)]
    track_index: Vec<Option<u16>>,
    #[serde(skip)]
    zero_frame: Option<ZeroFrame>,
    #[serde(skip)]
    all_zeros: bool,
}

impl Clip {
    /// Build lookup tables and derived data after loading
    pub fn prepare(&mut self, bone_count: usize) {
        self.track_index = vec![None; bone_count];
        for (i, track) in self.tracks.iter().enumerate() {
            if let Some(slot) = self.track_index.get_mut(track.bone) {
                *slot = Some(i as u16);
            }
        }

        self.all_zeros = self.delta && self.tracks.iter().all(BoneTrack::is_identity);

        self.zero_frame = self
            .zero_frame_span
            .map(|span| ZeroFrame::build(&self.tracks, self.frame_count as usize, span as usize));
    }

    pub fn validate(&self, skeleton: &Skeleton) -> Result<(), RigError> {
        if self.frame_count == 0 {
            return Err(RigError::EmptyClip {
                clip: self.name.clone(),
            });
        }
        if let Some(track) = self.tracks.iter().find(|t| t.bone >= skeleton.bone_count()) {
            return Err(RigError::TrackBone {
                clip: self.name.clone(),
                bone: track.bone,
            });
        }
        for rule in &self.ik_rules {
            if rule.chain.index() >= skeleton.ik_chains.len() {
                return Err(RigError::RuleChain {
                    clip: self.name.clone(),
                    chain: rule.chain.index(),
                });
            }
            if let Some(slot) = rule.kind.slot().filter(|&slot| slot >= MAX_IK_TARGETS) {
                return Err(RigError::RuleSlot {
                    clip: self.name.clone(),
                    slot,
                    max: MAX_IK_TARGETS - 1,
                });
            }
        }
        Ok(())
    }

    /// Delta clip whose every keyed value is identity or zero
    #[inline]
    pub fn is_all_zeros(&self) -> bool {
        self.all_zeros
    }

    pub fn has_zero_frame(&self) -> bool {
        self.zero_frame.is_some()
    }

    /// Seconds per full cycle, or 0 for single-frame clips
    pub fn cycles_per_second(&self) -> f32 {
        if self.frame_count > 1 {
            self.fps / (self.frame_count - 1) as f32
        } else {
            0.0
        }
    }

    pub fn track(&self, bone: BoneIndex) -> Option<&BoneTrack> {
        let index = (*self.track_index.get(bone)?)?;
        self.tracks.get(index as usize)
    }

    /// Mark the full curves as evicted; sampling falls back to the zero frame
    pub fn evict_curves(&mut self) {
        self.resident = false;
    }

    pub fn restore_curves(&mut self) {
        self.resident = true;
    }

    /// Rotation and position of `bone` between `frame` and `frame + 1`.
    /// `None` channels are unkeyed (or unavailable while evicted).
    pub fn sample_bone(&self, bone: BoneIndex, frame: usize, s: f32) -> (Option<Quat>, Option<Vec3>) {
        if self.resident {
            return match self.track(bone) {
                Some(track) => (track.sample_rotation(frame, s), track.sample_position(frame, s)),
                None => (None, None),
            };
        }

        let Some(zero) = &self.zero_frame else {
            return (None, None);
        };
        match zero.tracks.iter().find(|t| t.bone == bone) {
            Some(track) => zero.sample(track, frame, s),
            None => (None, None),
        }
    }
}
