use crate::animation::AnimationLibrary;
use crate::bone::{BoneIndex, ChainId, ClipId, IkRuleKind};
use crate::config::IkTuning;
use crate::math::{simple_spline, QuatBlend};
use glam::{Quat, Vec3};
use serde::Serialize;

/// Phase range a rule is active over. `start..peak` ramps in, `peak..tail`
/// holds, `tail..end` ramps out. Windows ending past 1.0 wrap around the
/// loop point.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PhaseWindow {
    pub start: f32,
    pub peak: f32,
    pub tail: f32,
    pub end: f32,
}

impl PhaseWindow {
    /// Shift a cycle before `start` into the next loop when the window wraps
    #[inline]
    pub fn wrap_cycle(&self, cycle: f32) -> f32 {
        if self.end > 1.0 && cycle < self.start {
            cycle + 1.0
        } else {
            cycle
        }
    }

    /// Eased influence at `cycle`
    pub fn weight(&self, cycle: f32) -> f32 {
        let c = self.wrap_cycle(cycle);
        let value = if c < self.start {
            return 0.0;
        } else if c < self.peak {
            (c - self.start) / (self.peak - self.start)
        } else if c < self.tail {
            return 1.0;
        } else if c < self.end {
            1.0 - (c - self.tail) / (self.end - self.tail)
        } else {
            0.0
        };
        simple_spline(value)
    }

    /// Between the peak and the end the foot should stay planted
    pub fn should_latch(&self, cycle: f32) -> bool {
        let c = self.wrap_cycle(cycle);
        c >= self.peak && c < self.end
    }

    /// Progress through the ramp-out, 0 before the tail
    pub fn tail_weight(&self, cycle: f32) -> f32 {
        let c = self.wrap_cycle(cycle);
        if c <= self.tail {
            0.0
        } else if c < self.end {
            (c - self.tail) / (self.end - self.tail)
        } else {
            0.0
        }
    }

    fn shifted(self, dt: f32) -> Self {
        Self {
            start: self.start + dt,
            peak: self.peak + dt,
            tail: self.tail + dt,
            end: self.end + dt,
        }
    }

    fn add_scaled(&mut self, other: PhaseWindow, w: f32) {
        self.start += other.start * w;
        self.peak += other.peak * w;
        self.tail += other.tail * w;
        self.end += other.end * w;
    }
}

/// A rule resolved for the current frame, queued on its chain
#[derive(Debug, Clone, PartialEq)]
pub struct ContextRule {
    pub chain: ChainId,
    pub kind: IkRuleKind,
    pub window: PhaseWindow,
    /// Window influence at the evaluated cycle
    pub weight: f32,
    /// Weight of the sequence that contributed the rule
    pub rule_weight: f32,
    pub latched: f32,
    pub release: f32,
    pub commit: bool,
    pub pos: Vec3,
    pub q: Quat,
    pub height: f32,
    pub floor: f32,
    pub radius: f32,
}

impl ContextRule {
    /// Release rule injected when a target goes into error
    pub fn release(chain: ChainId, slot: usize, weight: f32, latched: f32) -> Self {
        Self {
            chain,
            kind: IkRuleKind::Release { slot },
            window: PhaseWindow::default(),
            weight,
            rule_weight: 1.0,
            latched,
            release: 0.0,
            commit: false,
            pos: Vec3::ZERO,
            q: Quat::IDENTITY,
            height: 0.0,
            floor: 0.0,
            radius: 0.0,
        }
    }

    /// Bone the rule's pose is relative to, if any
    pub fn relative_bone(&self) -> Option<BoneIndex> {
        match self.kind {
            IkRuleKind::SelfRelative { bone } => bone,
            _ => None,
        }
    }
}

fn ground_params(kind: &IkRuleKind) -> (f32, f32, f32) {
    match *kind {
        IkRuleKind::Ground {
            height,
            floor,
            radius,
            ..
        } => (height, floor, radius),
        IkRuleKind::Attachment { radius, .. } => (0.0, 0.0, radius),
        _ => (0.0, 0.0, 0.0),
    }
}

/// Combine rule `index` across the weighted grid corners of a sequence.
///
/// Returns `None` when the rule has no influence at `cycle`, when the
/// corners disagree on their rule tables, or when no corner could supply an
/// error sample.
pub fn sequence_error(
    library: &AnimationLibrary,
    corners: &[(ClipId, f32); 4],
    cycle: f32,
    index: usize,
    tuning: &IkTuning,
) -> Option<ContextRule> {
    let rule_count = library.clip(corners[0].0)?.ik_rules.len();

    let mut window = PhaseWindow::default();
    let mut first_start: Option<f32> = None;
    for &(clip_id, w) in corners {
        if w == 0.0 {
            continue;
        }
        let clip = library.clip(clip_id)?;
        if clip.ik_rules.len() != rule_count {
            log::warn!(
                "Clip '{}' has {} IK rules, expected {}",
                clip.name,
                clip.ik_rules.len(),
                rule_count
            );
            return None;
        }
        let rule = clip.ik_rules.get(index)?;

        // Bring windows that straddle the loop point onto the same cycle
        let dt = match first_start {
            None => {
                first_start = Some(rule.start);
                0.0
            }
            Some(s0) if rule.start - s0 > 0.5 => -1.0,
            Some(s0) if rule.start - s0 < -0.5 => 1.0,
            Some(_) => 0.0,
        };
        window.add_scaled(rule.window().shifted(dt), w);
    }

    if window.start > 1.0 {
        window = window.shifted(-1.0);
    } else if window.start < 0.0 {
        window = window.shifted(1.0);
    }

    let mut cycle = cycle;
    let mut weight = window.weight(cycle);
    if weight <= 0.001 {
        // Ground rules spanning most of the loop keep a virtual looping section
        let first_kind = &library.clip(corners[0].0)?.ik_rules.get(index)?.kind;
        if first_kind.is_ground() && window.end - window.start > tuning.ground_loop_window {
            weight = 0.001;
            cycle = window.end - 0.001;
        } else {
            return None;
        }
    }

    let mut out = ContextRule {
        chain: ChainId(0),
        kind: IkRuleKind::World,
        window,
        weight,
        rule_weight: 1.0,
        latched: 0.0,
        release: 0.0,
        commit: window.should_latch(cycle),
        pos: Vec3::ZERO,
        q: Quat::from_xyzw(0.0, 0.0, 0.0, 0.0),
        height: 0.0,
        floor: 0.0,
        radius: 0.0,
    };

    let mut total = 0.0;
    for &(clip_id, w) in corners {
        if w == 0.0 {
            continue;
        }
        let clip = library.clip(clip_id)?;
        let rule = clip.ik_rules.get(index)?;

        out.chain = rule.chain;
        out.kind = rule.kind.clone();

        let (height, floor, radius) = ground_params(&rule.kind);
        out.height += height * w;
        out.floor += floor * w;
        out.radius += radius * w;
        out.release += window.tail_weight(cycle) * w;

        if rule.kind.uses_error_curve() {
            let clip_weight = rule.window().weight(cycle).clamp(0.0, 1.0);
            let usable = rule.kind.is_ground() || clip_weight >= 0.0001;
            if let Some((pos, q)) = rule
                .sample_error(clip.frame_count, cycle)
                .filter(|_| usable)
            {
                out.pos += pos * w;
                out.q = out.q.accumulate(w, q);
                total += w;
            }
        } else {
            total += w;
        }

        out.latched = if window.should_latch(cycle) { weight } else { 0.0 };
    }

    if total <= 0.0001 {
        return None;
    }
    if total < 0.999 {
        out.pos /= total;
        out.q = out.q.scale_angle(1.0 / total);
    }
    out.q = if out.q.length_squared() > 0.0 {
        out.q.normalize()
    } else {
        Quat::IDENTITY
    };

    Some(out)
}
