//! Per-character IK state carried across frames.
//!
//! A frame runs `init`, then `add_dependencies` for every blended sequence,
//! then `update_targets` once the pose is final, optional ground queries
//! against the targets' trace probes, and finally `solve_dependencies`.

use super::rule::{sequence_error, ContextRule};
use super::solver::{solve_chain, solve_ik_links};
use super::target::{IkTarget, RigidPose, NO_FRAME};
use crate::animation::AnimationLibrary;
use crate::asset_limits::MAX_IK_TARGETS;
use crate::blend::{cycles_per_second, normalize_cycle, seq_anims};
use crate::bone::{solve_bone, BoneChain, ChainId, IkRuleKind, Pose, SequenceId};
use crate::config::IkTuning;
use crate::math::{decompose, position, rigid, simple_spline, QuatBlend};
use crate::skeleton::{BoneMask, IkLock, Skeleton};
use glam::{Affine3A, Quat, Vec3};

/// Foot pose captured before animation is layered over a locked chain
#[derive(Debug, Clone, Copy)]
struct LockedFoot {
    chain: ChainId,
    pos_weight: f32,
    local_q_weight: f32,
    q: Quat,
    pos: Vec3,
    /// Knee position and world bend direction, for chains with one
    knee: Option<(Vec3, Vec3)>,
}

/// Where a chain's foot should go this frame
#[derive(Debug, Clone, Copy)]
struct ChainResult {
    target: Option<usize>,
    weight: f32,
    pos: Vec3,
    q: Quat,
}

impl Default for ChainResult {
    fn default() -> Self {
        Self {
            target: None,
            weight: 0.0,
            pos: Vec3::ZERO,
            q: Quat::IDENTITY,
        }
    }
}

impl ChainResult {
    fn blend_toward(&mut self, world: &Affine3A, w: f32) {
        let (q, pos) = decompose(world);
        self.pos = self.pos * (1.0 - w) + pos * w;
        self.q = self.q.slerp_to(q, w);
    }
}

#[derive(Debug, Clone)]
pub struct IkContext {
    tuning: IkTuning,
    root: Affine3A,
    time: f32,
    frame_counter: i64,
    bone_mask: BoneMask,
    chain_rules: Vec<Vec<ContextRule>>,
    targets: Vec<IkTarget>,
    locks: Vec<LockedFoot>,
}

impl Default for IkContext {
    fn default() -> Self {
        Self::new(IkTuning::default())
    }
}

impl IkContext {
    pub fn new(tuning: IkTuning) -> Self {
        Self {
            tuning,
            root: Affine3A::IDENTITY,
            time: -1.0,
            frame_counter: -1,
            bone_mask: BoneMask::ANYTHING,
            chain_rules: Vec::new(),
            targets: Vec::new(),
            locks: Vec::new(),
        }
    }

    /// Start a new frame. Rules and locks from the previous frame are
    /// dropped; targets persist.
    pub fn init(
        &mut self,
        skeleton: &Skeleton,
        root: Affine3A,
        time: f32,
        frame_counter: i64,
        mask: BoneMask,
    ) {
        self.chain_rules.clear();
        self.chain_rules.resize_with(skeleton.ik_chains.len(), Vec::new);
        self.locks.clear();

        if skeleton.ik_chains.is_empty() {
            self.targets.clear();
        } else {
            self.ensure_targets();
        }

        self.root = root;
        self.time = time;
        self.frame_counter = frame_counter;
        self.bone_mask = mask;
    }

    fn ensure_targets(&mut self) {
        if self.targets.is_empty() {
            self.targets = vec![IkTarget::default(); MAX_IK_TARGETS];
            self.clear_targets();
        }
    }

    /// Invalidate every latch so the next frame starts from the ideal contact
    pub fn clear_targets(&mut self) {
        for target in &mut self.targets {
            target.latched.frame_counter = NO_FRAME;
        }
    }

    pub fn tuning(&self) -> &IkTuning {
        &self.tuning
    }

    pub fn root(&self) -> Affine3A {
        self.root
    }

    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn bone_mask(&self) -> BoneMask {
        self.bone_mask
    }

    pub fn targets(&self) -> &[IkTarget] {
        &self.targets
    }

    pub fn targets_mut(&mut self) -> &mut [IkTarget] {
        &mut self.targets
    }

    pub fn target_mut(&mut self, slot: usize) -> Option<&mut IkTarget> {
        self.targets.get_mut(slot)
    }

    /// Rules queued on a chain this frame
    pub fn rules(&self, chain: ChainId) -> &[ContextRule] {
        self.chain_rules
            .get(chain.index())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Queue the IK rules of a sequence evaluated at `cycle` with `weight`
    pub fn add_dependencies(
        &mut self,
        library: &AnimationLibrary,
        sequence: SequenceId,
        cycle: f32,
        params: &[f32],
        weight: f32,
    ) {
        let Some(seq) = library.sequence(sequence) else {
            return;
        };
        let corners = seq_anims(library, seq, params);
        let rule_count = library
            .clip(corners[0].0)
            .map_or(0, |clip| clip.ik_rules.len());
        if rule_count == 0 {
            return;
        }

        let weight = weight.clamp(0.0, 1.0);
        let cps = cycles_per_second(library, seq, params);
        let cycle = normalize_cycle(seq, cycle, self.time, cps);
        let skeleton = &library.skeleton;

        for index in 0..rule_count {
            let Some(mut rule) = sequence_error(library, &corners, cycle, index, &self.tuning)
            else {
                continue;
            };

            let Some(chain) = skeleton.chain(rule.chain) else {
                log::warn!(
                    "Sequence '{}' rule {} targets missing chain {}",
                    seq.name,
                    index,
                    rule.chain.index()
                );
                continue;
            };

            // Nothing to do if the foot or the reference bone isn't evaluated
            if !skeleton.is_bone_used(chain.foot(), self.bone_mask) {
                continue;
            }
            if let Some(bone) = rule.relative_bone() {
                if !skeleton.is_bone_used(bone, self.bone_mask) {
                    continue;
                }
            }

            self.ensure_targets();
            rule.rule_weight = weight;

            let Some(list) = self.chain_rules.get_mut(rule.chain.index()) else {
                log::warn!("IK context was not initialised for chain {}", rule.chain.index());
                continue;
            };

            // A fully weighted rule overrides whatever the chain had so far
            if rule.rule_weight * rule.weight > self.tuning.override_weight
                && !matches!(rule.kind, IkRuleKind::Unlatch { .. })
            {
                list.clear();
                if matches!(rule.kind, IkRuleKind::Release { .. }) {
                    continue;
                }
            }
            list.push(rule);
        }
    }

    /// Inject release rules for targets whose latch recently became
    /// unreachable, ramping them in and back out over time.
    pub fn auto_ik_release(&mut self, skeleton: &Skeleton) {
        let now = self.time;
        let tuning = self.tuning;

        for (slot, target) in self.targets.iter_mut().enumerate() {
            let dt = target.error.time.map_or(f32::INFINITY, |t| now - t);
            if !(target.error.in_error || dt < tuning.error_hold) {
                continue;
            }

            if !target.error.in_error {
                log::debug!("IK target {} entered auto-release", slot);
                target.error.ramp = 0.0;
                target.error.error_time = target.error.time.unwrap_or(now);
                target.error.in_error = true;
            }

            let ft = now - target.error.error_time;
            if dt < tuning.error_ramp_window {
                target.error.ramp = (target.error.ramp + ft * tuning.error_ramp_rate).min(1.0);
            } else {
                target.error.ramp = (target.error.ramp - ft * tuning.error_ramp_rate).max(0.0);
            }

            if target.error.ramp > 0.0 {
                let weight = simple_spline(target.error.ramp);
                let latched = if dt < tuning.error_ramp_window {
                    0.0
                } else {
                    weight
                };

                let Some(chain_id) = target.chain else {
                    log::warn!("Auto-release for target {} with no chain", slot);
                    target.error.error_time = now;
                    continue;
                };
                let Some(chain) = skeleton.chain(chain_id) else {
                    log::warn!(
                        "Auto-release got an out of range chain {} ({})",
                        chain_id.index(),
                        skeleton.ik_chains.len()
                    );
                    target.error.error_time = now;
                    continue;
                };
                let foot = chain.foot();
                if foot >= skeleton.bone_count() {
                    log::warn!(
                        "Auto-release got an out of range bone {} ({})",
                        foot,
                        skeleton.bone_count()
                    );
                } else if !skeleton.is_bone_used(foot, self.bone_mask) {
                    target.error.in_error = false;
                    continue;
                } else if let Some(list) = self.chain_rules.get_mut(chain_id.index()) {
                    list.push(ContextRule::release(chain_id, slot, weight, latched));
                }
            } else {
                log::debug!("IK target {} left auto-release", slot);
                target.error.in_error = false;
            }
            target.error.error_time = now;
        }
    }

    /// Turn the queued rules into target estimates, run the latch state
    /// machine and flag targets whose latch can no longer be reached.
    ///
    /// `chain` must be rooted at the context root.
    pub fn update_targets(&mut self, skeleton: &Skeleton, pose: &Pose, chain: &mut BoneChain) {
        for target in &mut self.targets {
            target.est.weight = 0.0;
            target.est.latched = 1.0;
            target.est.release = 1.0;
            target.est.height = 0.0;
            target.est.floor = 0.0;
            target.est.radius = 0.0;
            target.offset = RigidPose::default();
        }

        self.auto_ik_release(skeleton);

        let root_z = self.root.translation.z;
        for rule in self.chain_rules.iter().flatten() {
            match rule.kind {
                IkRuleKind::Ground { slot, .. } | IkRuleKind::Attachment { slot, .. } => {
                    let Some(target) = self.targets.get_mut(slot) else {
                        continue;
                    };
                    target.chain = Some(rule.chain);
                    target.kind = Some(rule.kind.clone());

                    let s = rule.rule_weight;
                    if s == 1.0 || target.est.weight == 0.0 {
                        target.offset = RigidPose {
                            q: rule.q,
                            pos: rule.pos,
                        };
                        target.est.height = rule.height;
                        target.est.floor = rule.floor;
                        target.est.radius = rule.radius;
                        target.est.latched = rule.latched * s;
                        target.est.release = rule.release;
                        target.est.weight = rule.weight * s;
                    } else {
                        target.offset.q = target.offset.q.slerp_to(rule.q, s);
                        target.offset.pos = target.offset.pos.lerp(rule.pos, s);
                        target.est.height += (rule.height - target.est.height) * s;
                        target.est.floor += (rule.floor - target.est.floor) * s;
                        target.est.radius += (rule.radius - target.est.radius) * s;
                        target.est.latched = target.est.latched.min(rule.latched);
                        target.est.release += (rule.release - target.est.release) * s;
                        target.est.weight += (rule.weight - target.est.weight) * s;
                    }

                    if rule.kind.is_ground() {
                        target.latched.delta_pos.z = 0.0;
                        target.est.pos.z = target.est.floor + root_z;
                    }
                }
                IkRuleKind::Unlatch { slot } | IkRuleKind::Release { slot } => {
                    let Some(target) = self.targets.get_mut(slot) else {
                        continue;
                    };
                    target.est.latched = if rule.latched > 0.0 {
                        0.0
                    } else {
                        target.est.latched.min(1.0 - rule.weight)
                    };
                    if matches!(rule.kind, IkRuleKind::Release { .. }) {
                        target.est.weight *= 1.0 - rule.weight * rule.rule_weight;
                    }
                }
                IkRuleKind::SelfRelative { .. } | IkRuleKind::World => {}
            }
        }

        let fc = self.frame_counter;
        let now = self.time;
        let tuning = self.tuning;
        for (slot, target) in self.targets.iter_mut().enumerate() {
            if !target.is_active() {
                continue;
            }
            let Some(ik_chain) = target.chain.and_then(|c| skeleton.chain(c)) else {
                continue;
            };
            let [hip, knee, foot] = ik_chain.links;

            let foot_world = chain.build(skeleton, pose, foot);
            let footpad = foot_world * rigid(target.offset.q, target.offset.pos).inverse();

            target.latched.needs_latch = target.est.latched == 1.0;

            // A latch from a skipped frame is stale
            let last = target.latched.frame_counter;
            if fc < 0 || last < fc - 1 || last > fc {
                target.latched.has_latch = false;
                target.latched.influence = 0.0;
            }
            target.latched.frame_counter = fc;

            let (q, pos) = decompose(&footpad);
            target.ideal = RigidPose { q, pos };
            target.est.q = q;
            target.est.pos = pos;

            let latched = target.est.latched;
            if target.latched.has_latch {
                let state = &mut target.latched;
                if latched == 1.0 {
                    // Hold the planted pose and remember how far it is from ideal
                    state.delta_pos = state.pos - target.est.pos;
                    state.delta_q = target.est.q.scale_then_compose(-1.0, state.q);
                    target.est.q = state.q;
                    target.est.pos = state.pos;
                } else if latched > 0.0 {
                    // Ramp the latch error out as the rule decays
                    if latched < state.influence {
                        let dt = (state.influence - latched) / state.influence;
                        state.delta_pos *= 1.0 - dt;
                        state.delta_q = state.delta_q.scale_angle(1.0 - dt);
                    }
                    target.est.pos += state.delta_pos;
                    target.est.q = target.est.q.compose_scaled(1.0, state.delta_q);
                    state.q = target.est.q;
                    state.pos = target.est.pos;
                } else {
                    log::trace!("IK target {} released its latch", slot);
                    state.has_latch = false;
                    state.q = target.est.q;
                    state.pos = target.est.pos;
                    state.delta_pos = Vec3::ZERO;
                    state.delta_q = Quat::IDENTITY;
                }
                state.influence = latched;
            }

            let p1 = position(&chain.build(skeleton, pose, hip));
            let p2 = position(&chain.build(skeleton, pose, knee));
            let p3 = position(&foot_world);
            let d1 = (p2 - p1).length();
            let d2 = (p3 - p2).length();

            if target.latched.has_latch && target.est.latched > tuning.latch_error_threshold {
                // Unstick feet that would need a leg of the wrong length
                let d4 = (p3 + target.latched.delta_pos - p1).length();
                if d4 < (d1 - d2).abs() || d4 * tuning.reach_slack > d1 + d2 {
                    target.error.time = Some(now);
                }
                // or too much twist
                let twist = target.latched.delta_q.w.abs() * 2.0 - 1.0;
                if twist < tuning.max_twist_cos {
                    target.error.time = Some(now);
                }
            }

            let dir = (target.est.pos - p1).normalize_or_zero();
            target.trace.p1 = p1 + dir * ((d1 - d2).abs() * 1.01);
            target.trace.p2 = p1 + dir * (d1 + d2) * 0.99;
            target.trace.p3 = p1 + Vec3::NEG_Z * (d1 + d2);
        }
    }

    /// Blend every chain toward its rules and targets, solve, and write the
    /// result back into `pose`.
    ///
    /// `chain` must be rooted at the context root.
    pub fn solve_dependencies(
        &mut self,
        skeleton: &Skeleton,
        pose: &mut Pose,
        chain: &mut BoneChain,
    ) {
        let mut results: Vec<ChainResult> = skeleton
            .ik_chains
            .iter()
            .map(|ik_chain| {
                let mut result = ChainResult::default();
                if skeleton.is_bone_used(ik_chain.foot(), self.bone_mask) {
                    let (q, pos) = decompose(&chain.build(skeleton, pose, ik_chain.foot()));
                    result.q = q;
                    result.pos = pos;
                }
                result
            })
            .collect();

        for rule in self.chain_rules.iter().flatten() {
            let Some(result) = results.get_mut(rule.chain.index()) else {
                continue;
            };
            result.target = None;
            let w = rule.weight * rule.rule_weight;

            match rule.kind {
                IkRuleKind::SelfRelative { bone } => {
                    let base = match bone {
                        Some(b) if b < skeleton.bone_count() => chain.build(skeleton, pose, b),
                        _ => self.root,
                    };
                    let world = base * rigid(rule.q, rule.pos);
                    result.weight = result.weight * (1.0 - w) + w;
                    result.blend_toward(&world, w);
                }
                IkRuleKind::World => {
                    let world = rigid(rule.q, rule.pos);
                    result.weight = result.weight * (1.0 - w) + w;
                    result.blend_toward(&world, w);
                }
                IkRuleKind::Release { .. } => {
                    // Pull the target back toward the animated foot
                    if let Some(ik_chain) = skeleton.chain(rule.chain) {
                        let foot_world = chain.build(skeleton, pose, ik_chain.foot());
                        result.blend_toward(&foot_world, w);
                    }
                }
                IkRuleKind::Ground { .. }
                | IkRuleKind::Attachment { .. }
                | IkRuleKind::Unlatch { .. } => {}
            }
        }

        for (slot, target) in self.targets.iter_mut().enumerate() {
            if target.is_active() {
                if let Some(result) = target.chain.and_then(|c| results.get_mut(c.index())) {
                    let world = rigid(target.est.q, target.est.pos)
                        * rigid(target.offset.q, target.offset.pos);
                    result.weight = target.est.weight;
                    result.blend_toward(&world, result.weight);
                    result.target = Some(slot);
                }
            }

            if target.latched.needs_latch {
                target.latched.has_latch = true;
                target.latched.q = target.est.q;
                target.latched.pos = target.est.pos;
            }
        }

        for (ik_chain, result) in skeleton.ik_chains.iter().zip(&results) {
            if result.weight <= 0.0 {
                continue;
            }

            if solve_chain(ik_chain, result.pos, chain, &self.tuning) {
                let [hip, knee, foot] = ik_chain.links;
                let p3 = position(&chain.world(foot));
                chain.set_world(foot, rigid(result.q, p3));

                solve_bone(skeleton, foot, chain, pose);
                solve_bone(skeleton, knee, chain, pose);
                solve_bone(skeleton, hip, chain, pose);
            } else if let Some(target) = result.target.and_then(|s| self.targets.get_mut(s)) {
                log::trace!("IK chain '{}' failed, decaying its latch", ik_chain.name);
                let decay = self.tuning.failure_decay;
                target.latched.delta_pos *= decay;
                target.latched.delta_q = target.latched.delta_q.scale_angle(decay);
            }
        }
    }

    /// Record the feet of a sequence's locked chains before it is applied
    pub fn add_sequence_locks(&mut self, skeleton: &Skeleton, locks: &[IkLock], pose: &Pose) {
        self.add_locks(skeleton, locks, pose);
    }

    /// Record the feet of the skeleton's autoplay locks
    pub fn add_autoplay_locks(&mut self, skeleton: &Skeleton, pose: &Pose) {
        self.add_locks(skeleton, &skeleton.autoplay_locks, pose);
    }

    /// Pull locked feet back to where `add_sequence_locks` found them
    pub fn solve_sequence_locks(&mut self, skeleton: &Skeleton, pose: &mut Pose) {
        self.solve_locks(skeleton, pose);
    }

    pub fn solve_autoplay_locks(&mut self, skeleton: &Skeleton, pose: &mut Pose) {
        self.solve_locks(skeleton, pose);
    }

    fn add_locks(&mut self, skeleton: &Skeleton, locks: &[IkLock], pose: &Pose) {
        if locks.is_empty() {
            return;
        }
        let mut world = BoneChain::new(skeleton.bone_count(), self.root);

        for lock in locks {
            let Some(ik_chain) = skeleton.chain(lock.chain) else {
                log::warn!("IK lock references missing chain {}", lock.chain.index());
                continue;
            };
            let foot = ik_chain.foot();
            if !skeleton.is_bone_used(foot, self.bone_mask) {
                continue;
            }

            let (q, pos) = decompose(&world.build(skeleton, pose, foot));
            let knee = ik_chain.bend_direction().map(|dir| {
                let hip = world.build(skeleton, pose, ik_chain.hip());
                let knee_pos = position(&world.build(skeleton, pose, ik_chain.knee()));
                (knee_pos, hip.transform_vector3(dir))
            });

            self.locks.push(LockedFoot {
                chain: lock.chain,
                pos_weight: lock.pos_weight,
                local_q_weight: lock.local_q_weight,
                q,
                pos,
                knee,
            });
        }
    }

    fn solve_locks(&mut self, skeleton: &Skeleton, pose: &mut Pose) {
        let locks = std::mem::take(&mut self.locks);
        if locks.is_empty() {
            return;
        }
        let mut world = BoneChain::new(skeleton.bone_count(), self.root);

        for lock in &locks {
            let Some(ik_chain) = skeleton.chain(lock.chain) else {
                continue;
            };
            let [hip, knee, foot] = ik_chain.links;

            let p1 = position(&world.build(skeleton, pose, foot));
            let target = p1 * (1.0 - lock.pos_weight) + lock.pos * lock.pos_weight;

            let solved = match lock.knee {
                Some((knee_pos, knee_dir)) => solve_ik_links(
                    &mut world,
                    ik_chain.links,
                    target,
                    knee_pos,
                    knee_dir,
                    &self.tuning,
                ),
                None => solve_chain(ik_chain, target, &mut world, &self.tuning),
            };
            if !solved {
                log::trace!("IK lock on chain '{}' could not be solved", ik_chain.name);
            }

            // Slam the recorded orientation
            let p3 = position(&world.world(foot));
            world.set_world(foot, rigid(lock.q, p3));

            let animated = pose.rotations[foot];
            solve_bone(skeleton, foot, &world, pose);
            pose.rotations[foot] = pose.rotations[foot].slerp_to(animated, lock.local_q_weight);

            solve_bone(skeleton, knee, &world, pose);
            solve_bone(skeleton, hip, &world, pose);
        }
    }
}
