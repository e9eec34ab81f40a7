//! Persistent per-slot IK targets: where a foot wants to be, where it was
//! latched last frame, and whether it is being auto-released after an error.

use crate::bone::{ChainId, IkRuleKind};
use crate::math::{decompose, rigid};
use glam::{Mat3, Quat, Vec3};
use serde::Serialize;

/// Frame counter value that no real frame matches
pub const NO_FRAME: i64 = -9999;

/// Rigid pose as a rotation plus translation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RigidPose {
    pub q: Quat,
    pub pos: Vec3,
}

impl Default for RigidPose {
    fn default() -> Self {
        Self {
            q: Quat::IDENTITY,
            pos: Vec3::ZERO,
        }
    }
}

/// Current best guess for the contact point
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TargetEstimate {
    pub q: Quat,
    pub pos: Vec3,
    pub weight: f32,
    pub latched: f32,
    pub release: f32,
    pub height: f32,
    pub floor: f32,
    pub radius: f32,
}

impl Default for TargetEstimate {
    fn default() -> Self {
        Self {
            q: Quat::IDENTITY,
            pos: Vec3::ZERO,
            weight: 0.0,
            latched: 1.0,
            release: 1.0,
            height: 0.0,
            floor: 0.0,
            radius: 0.0,
        }
    }
}

/// Frame of reference a latched target moves with
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OwnerFrame {
    pub id: u32,
    pub origin: Vec3,
    pub rotation: Quat,
}

/// Where the foot was planted and how far that is from the ideal contact
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatchState {
    pub frame_counter: i64,
    pub has_latch: bool,
    pub needs_latch: bool,
    pub influence: f32,
    pub q: Quat,
    pub pos: Vec3,
    pub delta_pos: Vec3,
    pub delta_q: Quat,
    pub owner: Option<OwnerFrame>,
}

impl Default for LatchState {
    fn default() -> Self {
        Self {
            frame_counter: NO_FRAME,
            has_latch: false,
            needs_latch: false,
            influence: 0.0,
            q: Quat::IDENTITY,
            pos: Vec3::ZERO,
            delta_pos: Vec3::ZERO,
            delta_q: Quat::IDENTITY,
            owner: None,
        }
    }
}

/// Auto-release bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ErrorState {
    /// Last time the latch was found to be unreachable
    pub time: Option<f32>,
    /// Time the ramp was last advanced
    pub error_time: f32,
    pub ramp: f32,
    pub in_error: bool,
}

/// Segment upstream code can cast against the ground: hip-side start,
/// the reachable end along the target direction, and straight down
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TraceProbe {
    pub p1: Vec3,
    pub p2: Vec3,
    pub p3: Vec3,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct IkTarget {
    pub chain: Option<ChainId>,
    /// Kind of the last rule that drove this slot
    pub kind: Option<IkRuleKind>,
    pub est: TargetEstimate,
    /// Foot-to-contact offset
    pub offset: RigidPose,
    /// Contact pose implied by the animation alone
    pub ideal: RigidPose,
    pub latched: LatchState,
    pub error: ErrorState,
    pub trace: TraceProbe,
}

impl IkTarget {
    /// Attachment the slot is tracking, for ATTACHMENT rules
    pub fn attachment(&self) -> Option<&str> {
        match &self.kind {
            Some(IkRuleKind::Attachment { attachment, .. }) => attachment.as_deref(),
            _ => None,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.est.weight > 0.0
    }

    pub fn set_pos(&mut self, pos: Vec3) {
        self.est.pos = pos;
    }

    pub fn set_quaternion(&mut self, q: Quat) {
        self.est.q = q;
    }

    /// Tilt the estimated orientation onto a surface with `normal`, keeping
    /// the foot's side axis as close as possible
    pub fn set_normal(&mut self, normal: Vec3) {
        let normal = normal.normalize_or_zero();
        let m = Mat3::from_quat(self.est.q);
        let forward = m.y_axis.cross(normal).normalize_or_zero();
        if forward == Vec3::ZERO {
            return;
        }
        let right = normal.cross(forward).normalize_or_zero();
        let tilted = Mat3::from_cols(forward, right, normal);
        self.est.q = Quat::from_mat3(&tilted).normalize();
    }

    /// Place the target treating the foot as a disc of `est.radius` whose
    /// edge touched the surface at `pos`
    pub fn set_pos_with_normal_offset(&mut self, pos: Vec3, normal: Vec3) {
        self.est.pos = pos;
        if normal.z > 0.9999 {
            return;
        }
        if normal.z > 0.707 {
            let tan = (1.0 - normal.z * normal.z).sqrt() / normal.z;
            self.est.pos.z -= self.est.radius * tan;
        } else {
            self.est.pos.z -= self.est.radius;
        }
    }

    /// Drop the latch and fall back to the ideal contact
    pub fn ik_failed(&mut self) {
        self.latched.delta_pos = Vec3::ZERO;
        self.latched.delta_q = Quat::IDENTITY;
        self.latched.pos = self.ideal.pos;
        self.latched.q = self.ideal.q;
        self.est.latched = 0.0;
        self.est.weight = 0.0;
    }

    pub fn set_owner(&mut self, id: u32, origin: Vec3, rotation: Quat) {
        self.latched.owner = Some(OwnerFrame {
            id,
            origin,
            rotation,
        });
    }

    pub fn clear_owner(&mut self) {
        self.latched.owner = None;
    }

    pub fn owner(&self) -> Option<u32> {
        self.latched.owner.map(|o| o.id)
    }

    /// Carry the latched pose along when the owning frame moves
    pub fn update_owner(&mut self, id: u32, origin: Vec3, rotation: Quat) {
        let Some(old) = self.latched.owner else {
            self.set_owner(id, origin, rotation);
            return;
        };
        if old.origin == origin && old.rotation == rotation {
            return;
        }

        let from = rigid(old.rotation, old.origin).inverse();
        let to = rigid(rotation, origin);
        let moved = to * from * rigid(self.latched.q, self.latched.pos);
        (self.latched.q, self.latched.pos) = decompose(&moved);

        self.set_owner(id, origin, rotation);
    }
}
