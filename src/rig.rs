//! One animated character: its read-only rig, the mutable pose and IK
//! state carried between frames, and the cache of its world matrices.

use crate::animation::AnimationLibrary;
use crate::blend::{calc_autoplay_sequences, calc_pose, EvalContext};
use crate::bone::{BoneCacheManager, BoneChain, BoneIndex, CacheHandle, PoseParamId, Pose, SequenceId};
use crate::config::RigConfig;
use crate::error::RigError;
use crate::ik::{IkContext, IkTarget, TraceProbe};
use crate::math::PackedBoneMatrix;
use crate::skeleton::BoneMask;
use glam::{Affine3A, Vec3};

/// What to evaluate this frame
#[derive(Debug, Clone, Copy)]
pub struct FrameRequest {
    pub sequence: SequenceId,
    pub cycle: f32,
    /// Character origin in world space
    pub root: Affine3A,
    pub time: f32,
    pub bone_mask: BoneMask,
}

impl FrameRequest {
    pub fn new(sequence: SequenceId, cycle: f32, time: f32) -> Self {
        Self {
            sequence,
            cycle,
            root: Affine3A::IDENTITY,
            time,
            bone_mask: BoneMask::ANYTHING,
        }
    }
}

/// Result of a ground query along a target's trace probe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundHit {
    pub point: Vec3,
    pub normal: Vec3,
}

/// Ground query against the horizontal plane `z = height`, cast from the
/// probe's hip-side start straight down
pub fn flat_ground(height: f32) -> impl FnMut(&TraceProbe) -> Option<GroundHit> {
    move |probe| {
        let (top, bottom) = (probe.p1.z, probe.p3.z);
        if top < height || bottom > height || top == bottom {
            return None;
        }
        let t = (top - height) / (top - bottom);
        Some(GroundHit {
            point: probe.p1.lerp(probe.p3, t),
            normal: Vec3::Z,
        })
    }
}

pub struct RigInstance {
    library: AnimationLibrary,
    config: RigConfig,
    ik: IkContext,
    pose: Pose,
    params: Vec<f32>,
    world: BoneChain,
    caches: BoneCacheManager,
    cache: Option<CacheHandle>,
    frame_counter: i64,
}

impl RigInstance {
    pub fn new(library: AnimationLibrary, config: RigConfig) -> Self {
        let skeleton = &library.skeleton;
        let params = skeleton.pose_parameters.iter().map(|desc| desc.start).collect();
        Self {
            ik: IkContext::new(config.ik),
            pose: Pose::rest(skeleton),
            world: BoneChain::new(skeleton.bone_count(), Affine3A::IDENTITY),
            caches: BoneCacheManager::new(config.cache.budget_bytes),
            cache: None,
            frame_counter: 0,
            params,
            config,
            library,
        }
    }

    /// Load a rig document and optional tuning overrides
    pub fn from_json(rig_json: &str, config_json: Option<&str>) -> Result<Self, RigError> {
        let library = AnimationLibrary::from_json(rig_json)?;
        let config = match config_json {
            Some(json) => RigConfig::from_json(json)?,
            None => RigConfig::default(),
        };
        Ok(Self::new(library, config))
    }

    pub fn library(&self) -> &AnimationLibrary {
        &self.library
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    /// Local pose left by the last evaluated frame
    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    pub fn ik(&self) -> &IkContext {
        &self.ik
    }

    pub fn ik_targets(&self) -> &[IkTarget] {
        self.ik.targets()
    }

    pub fn frame_counter(&self) -> i64 {
        self.frame_counter
    }

    pub fn pose_parameter(&self, id: PoseParamId) -> Option<f32> {
        self.params.get(id.index()).copied()
    }

    /// Set a pose parameter in its raw units. Returns false for an unknown
    /// parameter or a non-finite value.
    pub fn set_pose_parameter(&mut self, id: PoseParamId, value: f32) -> bool {
        if !value.is_finite() {
            log::warn!("Ignoring non-finite value for pose parameter {}", id.index());
            return false;
        }
        match self.params.get_mut(id.index()) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => {
                log::warn!("Unknown pose parameter {}", id.index());
                false
            }
        }
    }

    /// Forget every IK latch, e.g. after a teleport
    pub fn clear_targets(&mut self) {
        self.ik.clear_targets();
    }

    /// Evaluate one frame: blend the sequence and autoplay overlays, update
    /// the IK targets, let `ground` move grounded targets onto the world,
    /// solve the chains, and refresh the bone cache.
    pub fn evaluate_frame<F>(&mut self, request: &FrameRequest, mut ground: F)
    where
        F: FnMut(&TraceProbe) -> Option<GroundHit>,
    {
        self.frame_counter += 1;
        let library = &self.library;
        let skeleton = &library.skeleton;

        self.ik.init(
            skeleton,
            request.root,
            request.time,
            self.frame_counter,
            request.bone_mask,
        );

        let ctx = EvalContext::new(&self.params, request.bone_mask, request.time);
        calc_pose(
            library,
            Some(&mut self.ik),
            &mut self.pose,
            request.sequence,
            request.cycle,
            &ctx,
            1.0,
        );
        calc_autoplay_sequences(library, Some(&mut self.ik), &mut self.pose, &ctx, request.time);

        self.world.reset(request.root);
        self.ik.update_targets(skeleton, &self.pose, &mut self.world);

        for target in self.ik.targets_mut() {
            let grounded = target.kind.as_ref().is_some_and(|kind| kind.is_ground());
            if !target.is_active() || !grounded {
                continue;
            }
            if let Some(hit) = ground(&target.trace) {
                target.set_pos_with_normal_offset(hit.point, hit.normal);
                target.set_normal(hit.normal);
            }
        }

        self.ik.solve_dependencies(skeleton, &mut self.pose, &mut self.world);

        self.world.reset(request.root);
        if skeleton.bone_count() > 0 {
            self.world.build(skeleton, &self.pose, 0);
        }
        self.world.build_masked(skeleton, &self.pose, request.bone_mask);
        self.store_cache(request.bone_mask, request.time);
    }

    fn store_cache(&mut self, mask: BoneMask, time: f32) {
        let world = self.world.transforms();
        if let Some(cache) = self
            .cache
            .and_then(|handle| self.caches.get_resource_mut(handle))
            .filter(|cache| cache.bone_mask() == mask)
        {
            cache.update_bones(world, time);
            return;
        }

        if let Some(stale) = self.cache.take() {
            self.caches.destroy_resource(stale);
        }
        self.cache = Some(
            self.caches
                .create_resource(&self.library.skeleton, world, mask, time),
        );
    }

    /// World transform of a bone from the last frame
    pub fn world(&self, bone: BoneIndex) -> Option<Affine3A> {
        (bone < self.library.skeleton.bone_count()).then(|| self.world.world(bone))
    }

    /// Packed matrices of the cached bones, while still fresh at `time`
    pub fn bone_matrices(&mut self, time: f32) -> Option<&[PackedBoneMatrix]> {
        let handle = self.cache?;
        let max_drift = self.config.cache.max_drift;
        self.caches
            .get_valid(handle, time, max_drift)
            .map(|cache| cache.matrices())
    }

    pub fn invalidate_cache(&mut self) {
        if let Some(handle) = self.cache {
            self.caches.invalidate_resource(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ik::NO_FRAME;
    use crate::math::position;
    use wasm_bindgen_test::*;

    const LEG_RIG: &str = include_str!("../assets/rigs/leg_rig.json");
    const EPS: f32 = 1e-4;

    fn rig() -> RigInstance {
        RigInstance::from_json(LEG_RIG, None).unwrap()
    }

    fn request(rig: &RigInstance, name: &str, time: f32) -> FrameRequest {
        let sequence = rig.library().sequence_index(name).unwrap();
        FrameRequest::new(sequence, 0.5, time)
    }

    fn no_ground(_: &TraceProbe) -> Option<GroundHit> {
        None
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_standing_frame_keeps_foot_at_rest() {
        let mut rig = rig();
        let req = request(&rig, "stand", 0.0);
        rig.evaluate_frame(&req, no_ground);

        assert_eq!(rig.frame_counter(), 1);
        let foot = position(&rig.world(3).unwrap());
        assert!(foot.abs_diff_eq(Vec3::ZERO, EPS), "foot {:?}", foot);
        assert!(rig.ik_targets()[0].is_active());
        assert!(rig.world(4).is_none());
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_ground_hit_moves_planted_foot() {
        let mut rig = rig();
        let req = request(&rig, "stand", 0.0);
        let mut probes = Vec::new();
        rig.evaluate_frame(&req, |probe| {
            probes.push(*probe);
            Some(GroundHit {
                point: Vec3::new(0.0, 0.0, 0.1),
                normal: Vec3::Z,
            })
        });

        assert_eq!(probes.len(), 1);
        assert!(probes[0].p3.z < probes[0].p1.z);

        let foot = position(&rig.world(3).unwrap());
        assert!(foot.abs_diff_eq(Vec3::new(0.0, 0.0, 0.1), 1e-3), "foot {:?}", foot);
        let latched = rig.ik_targets()[0].latched;
        assert!(latched.has_latch);
        assert!(latched.pos.abs_diff_eq(Vec3::new(0.0, 0.0, 0.1), EPS));
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_grounded_foot_holds_across_phases() {
        let mut rig = rig();
        let sequence = rig.library().sequence_index("stand").unwrap();

        let mut last_knee: Option<Vec3> = None;
        for (i, cycle) in [0.0, 0.25, 0.5].into_iter().enumerate() {
            let req = FrameRequest::new(sequence, cycle, i as f32 * 0.033);
            rig.evaluate_frame(&req, flat_ground(0.1));
            assert_eq!(rig.frame_counter(), i as i64 + 1);

            let foot = position(&rig.world(3).unwrap());
            assert!((foot.z - 0.1).abs() < 1e-3, "cycle {}: foot {:?}", cycle, foot);

            let hip = position(&rig.world(1).unwrap());
            assert!(hip.abs_diff_eq(Vec3::new(0.0, 0.0, 1.0), EPS), "cycle {}: hip {:?}", cycle, hip);

            let knee = position(&rig.world(2).unwrap());
            if let Some(last) = last_knee {
                assert!(knee.abs_diff_eq(last, 1e-3), "knee jumped {:?} -> {:?}", last, knee);
            }
            last_knee = Some(knee);

            let target = &rig.ik_targets()[0];
            assert!(target.latched.has_latch);
            assert!((target.latched.pos.z - 0.1).abs() < 1e-3);
        }
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_pose_parameter_drives_blend() {
        let mut rig = rig();
        let unknown = PoseParamId(rig.library().skeleton.pose_parameters.len() as u16);
        assert_eq!(rig.pose_parameter(PoseParamId(0)), Some(-1.0));
        assert!(!rig.set_pose_parameter(unknown, 1.0));
        assert!(!rig.set_pose_parameter(PoseParamId(0), f32::NAN));
        assert!(rig.set_pose_parameter(PoseParamId(0), 1.0));

        let req = request(&rig, "sway", 0.0);
        rig.evaluate_frame(&req, no_ground);
        let hip = rig.pose().positions[1];
        assert!(hip.abs_diff_eq(Vec3::new(0.1, 0.0, 1.0), EPS), "hip {:?}", hip);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_bone_matrices_follow_cache_window() {
        let mut rig = rig();
        assert!(rig.bone_matrices(0.0).is_none());

        let req = request(&rig, "stand", 1.0);
        rig.evaluate_frame(&req, no_ground);
        let matrices = rig.bone_matrices(1.0).unwrap();
        assert_eq!(matrices.len(), 4);
        let hip = matrices[1].to_affine();
        assert!(position(&hip).abs_diff_eq(Vec3::new(0.0, 0.0, 1.0), EPS));

        // Default drift window is zero
        assert!(rig.bone_matrices(1.1).is_none());

        let req = request(&rig, "stand", 1.1);
        rig.evaluate_frame(&req, no_ground);
        assert!(rig.bone_matrices(1.1).is_some());
        rig.invalidate_cache();
        assert!(rig.bone_matrices(1.1).is_none());
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_masked_frame_caches_only_selected_bones() {
        let mut rig = rig();
        let mut req = request(&rig, "stand", 0.0);
        req.bone_mask = BoneMask::ATTACHMENT;
        rig.evaluate_frame(&req, no_ground);

        // Root, hip and knee default to every mask; the foot does not
        assert_eq!(rig.bone_matrices(0.0).unwrap().len(), 3);

        req.bone_mask = BoneMask::ANYTHING;
        rig.evaluate_frame(&req, no_ground);
        assert_eq!(rig.bone_matrices(0.0).unwrap().len(), 4);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_clear_targets_drops_latch_frame() {
        let mut rig = rig();
        let req = request(&rig, "stand", 0.0);
        rig.evaluate_frame(&req, no_ground);
        assert_eq!(rig.ik_targets()[0].latched.frame_counter, 1);

        rig.clear_targets();
        assert_eq!(rig.ik_targets()[0].latched.frame_counter, NO_FRAME);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_flat_ground_hits_between_probe_ends() {
        let probe = TraceProbe {
            p1: Vec3::new(0.0, 0.0, 1.0),
            p2: Vec3::new(0.0, 0.0, 0.0),
            p3: Vec3::new(0.0, 0.0, -1.0),
        };
        let hit = flat_ground(0.25)(&probe).unwrap();
        assert!(hit.point.abs_diff_eq(Vec3::new(0.0, 0.0, 0.25), EPS));
        assert_eq!(hit.normal, Vec3::Z);

        assert!(flat_ground(2.0)(&probe).is_none());
        assert!(flat_ground(-2.0)(&probe).is_none());
    }

    #[test]
    fn test_config_overrides_cache_window() {
        let config = r#"{ "cache": { "max_drift": 0.5 } }"#;
        let mut rig = RigInstance::from_json(LEG_RIG, Some(config)).unwrap();
        let req = request(&rig, "stand", 0.0);
        rig.evaluate_frame(&req, no_ground);
        assert!(rig.bone_matrices(0.4).is_some());
        assert!(rig.bone_matrices(0.6).is_none());
    }

    #[test]
    fn test_bad_documents_are_rejected() {
        assert!(RigInstance::from_json("{", None).is_err());
        assert!(RigInstance::from_json(LEG_RIG, Some("[1, 2]")).is_err());
    }
}
