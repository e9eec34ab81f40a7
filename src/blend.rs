//! Pose blend engine: sample the clips of a sequence's blend grid, combine
//! them into a local pose, layer overlays on top and queue the sequence's IK
//! rules on the caller's context.
//!
//! All poses handed to these functions must be sized to the skeleton.

use crate::animation::AnimationLibrary;
use crate::bone::{BoneChain, ClipId, Pose, SequenceId};
use crate::ik::IkContext;
use crate::math::{decompose, simple_spline, QuatBlend};
use crate::sequence::{Layer, LayerFlags, Sequence, SequenceFlags};
use crate::skeleton::{BoneMask, Skeleton};
use glam::{Affine3A, Quat, Vec3};

/// Corner weights below this (or above one minus it) snap to the edge
const CORNER_EPSILON: f32 = 0.001;

/// Caller inputs shared by every blend call of a frame
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    /// Raw pose parameter values, one per skeleton pose parameter
    pub params: &'a [f32],
    pub bone_mask: BoneMask,
    /// Clock used by REALTIME sequences
    pub time: f32,
}

impl<'a> EvalContext<'a> {
    pub fn new(params: &'a [f32], bone_mask: BoneMask, time: f32) -> Self {
        Self {
            params,
            bone_mask,
            time,
        }
    }
}

// ============================================================================
// Blend coordinates and timing
// ============================================================================

/// Position along one blend axis: the fractional coordinate between two grid
/// columns and the lower column index.
pub fn resolve_blend_coordinate(
    library: &AnimationLibrary,
    seq: &Sequence,
    axis: usize,
    params: &[f32],
) -> (f32, usize) {
    let Some(blend_axis) = seq.grid.axes.get(axis) else {
        return (0.0, 0);
    };
    let Some(desc) = library.skeleton.pose_parameter(blend_axis.param) else {
        return (0.0, 0);
    };

    let raw = params
        .get(blend_axis.param.index())
        .copied()
        .unwrap_or(desc.start);
    let value = desc.wrap(raw);
    let size = blend_axis.size.max(1);

    if blend_axis.keys.is_empty() {
        let (start, end) = blend_axis.range(desc);
        let span = end - start;
        let mut s = if span == 0.0 {
            0.0
        } else {
            ((value - start) / span).clamp(0.0, 1.0)
        };
        if !s.is_finite() {
            s = 0.0;
        }

        let mut index = 0;
        if size > 2 {
            let scaled = s * (size - 1) as f32;
            index = (scaled as usize).min(size - 2);
            s = scaled - index as f32;
        }
        return (s, index);
    }

    let keys = &blend_axis.keys;
    if keys.len() < 2 {
        return (0.0, 0);
    }
    let setting = |index: usize| {
        let span = keys[index + 1] - keys[index];
        if span == 0.0 {
            0.0
        } else {
            (value - keys[index]) / span
        }
    };

    let mut index = 0;
    let mut s = setting(index);
    while index + 2 < keys.len() && s > 1.0 {
        index += 1;
        s = setting(index);
    }
    (s.clamp(0.0, 1.0), index)
}

/// The four grid corners around the current parameters and their bilinear
/// weights, in the order (i0, i1), (i0+1, i1), (i0, i1+1), (i0+1, i1+1)
pub fn seq_anims(library: &AnimationLibrary, seq: &Sequence, params: &[f32]) -> [(ClipId, f32); 4] {
    let (s0, i0) = resolve_blend_coordinate(library, seq, 0, params);
    let (s1, i1) = resolve_blend_coordinate(library, seq, 1, params);
    let corner = |a: usize, b: usize| seq.grid.clip(a, b).unwrap_or(ClipId(0));

    [
        (corner(i0, i1), (1.0 - s0) * (1.0 - s1)),
        (corner(i0 + 1, i1), s0 * (1.0 - s1)),
        (corner(i0, i1 + 1), (1.0 - s0) * s1),
        (corner(i0 + 1, i1 + 1), s0 * s1),
    ]
}

/// Weighted playback rate of the sequence in cycles per second
pub fn cycles_per_second(library: &AnimationLibrary, seq: &Sequence, params: &[f32]) -> f32 {
    seq_anims(library, seq, params)
        .iter()
        .filter(|(_, w)| *w > 0.0)
        .filter_map(|&(clip, w)| library.clip(clip).map(|c| c.cycles_per_second() * w))
        .sum()
}

/// Seconds per cycle, or 0 for sequences that don't advance
pub fn sequence_duration(library: &AnimationLibrary, seq: &Sequence, params: &[f32]) -> f32 {
    let cps = cycles_per_second(library, seq, params);
    if cps == 0.0 {
        0.0
    } else {
        1.0 / cps
    }
}

/// Bring a cycle into [0, 1): REALTIME sequences derive it from the clock,
/// looping ones wrap and the rest clamp just short of the end.
pub fn normalize_cycle(seq: &Sequence, cycle: f32, time: f32, cps: f32) -> f32 {
    if seq.has(SequenceFlags::REALTIME) {
        return (time * cps).fract();
    }
    if !cycle.is_finite() {
        return 0.0;
    }
    if (0.0..1.0).contains(&cycle) {
        return cycle;
    }
    if seq.has(SequenceFlags::LOOPING) {
        let c = cycle.fract();
        if c < 0.0 {
            c + 1.0
        } else {
            c
        }
    } else {
        cycle.clamp(0.0, 0.9999)
    }
}

// ============================================================================
// Clip sampling
// ============================================================================

/// Write one clip's pose at `cycle` into every weighted, unmasked bone.
/// Unkeyed channels fall back to identity for delta clips and to the rest
/// pose otherwise.
pub fn calc_animation(
    library: &AnimationLibrary,
    clip: ClipId,
    cycle: f32,
    mask: BoneMask,
    seq: &Sequence,
    pose: &mut Pose,
) {
    let Some(clip) = library.clip(clip) else {
        log::warn!("Sequence '{}' samples missing clip {}", seq.name, clip.index());
        return;
    };

    let frames = clip.frame_count.saturating_sub(1) as f32;
    let position = (cycle * frames).max(0.0);
    let frame = position as usize;
    let s = position - frame as f32;

    for (i, bone) in library.skeleton.bones.iter().enumerate() {
        if seq.bone_weight(i) <= 0.0 || !bone.is_used_by(mask) {
            continue;
        }

        let (rotation, translation) = clip.sample_bone(i, frame, s);
        let (rest_q, rest_pos) = if clip.delta {
            (Quat::IDENTITY, Vec3::ZERO)
        } else {
            (bone.rotation, bone.position)
        };

        let mut q = rotation.unwrap_or(rest_q);
        if !clip.delta && bone.has_fixed_alignment() {
            q = q.aligned_to(bone.alignment);
        }
        pose.rotations[i] = q;
        pose.positions[i] = translation.unwrap_or(rest_pos);
    }
}

fn is_all_zeros(library: &AnimationLibrary, seq: &Sequence, i0: usize, i1: usize) -> bool {
    seq.grid
        .clip(i0, i1)
        .and_then(|c| library.clip(c))
        .is_some_and(|c| c.is_all_zeros())
}

/// Which grid edge a coordinate sits on, if it is close enough to one
fn edge(s: f32) -> Option<usize> {
    if s < CORNER_EPSILON {
        Some(0)
    } else if s > 1.0 - CORNER_EPSILON {
        Some(1)
    } else {
        None
    }
}

/// Local pose of a single sequence (no layers, no IK).
///
/// Returns false, leaving `pose` untouched, when the sequence resolves to a
/// single all-zero delta clip.
pub fn calc_pose_single(
    library: &AnimationLibrary,
    seq: &Sequence,
    pose: &mut Pose,
    cycle: f32,
    ctx: &EvalContext,
) -> bool {
    let skeleton = &library.skeleton;
    let mask = ctx.bone_mask;
    let (s0, i0) = resolve_blend_coordinate(library, seq, 0, ctx.params);
    let (s1, i1) = resolve_blend_coordinate(library, seq, 1, ctx.params);

    let cps = cycles_per_second(library, seq, ctx.params);
    let cycle = normalize_cycle(seq, cycle, ctx.time, cps);

    let sample = |pose: &mut Pose, a: usize, b: usize| {
        if let Some(clip) = seq.grid.clip(a, b) {
            calc_animation(library, clip, cycle, mask, seq, pose);
        }
    };
    let scratch = |pose: &Pose| pose.clone();

    match (edge(s0), edge(s1)) {
        (Some(e0), Some(0)) => {
            if is_all_zeros(library, seq, i0 + e0, i1) {
                return false;
            }
            sample(pose, i0 + e0, i1);
        }
        (Some(e0), Some(_)) => sample(pose, i0 + e0, i1 + 1),
        (Some(e0), None) => {
            let mut upper = scratch(pose);
            sample(pose, i0 + e0, i1);
            sample(&mut upper, i0 + e0, i1 + 1);
            blend_bones(skeleton, seq, pose, &upper, s1, mask);
        }
        (None, Some(0)) => {
            if is_all_zeros(library, seq, i0 + 1, i1) {
                sample(pose, i0, i1);
                scale_bones(skeleton, seq, pose, 1.0 - s0, mask);
            } else if is_all_zeros(library, seq, i0, i1) {
                sample(pose, i0 + 1, i1);
                scale_bones(skeleton, seq, pose, s0, mask);
            } else {
                let mut right = scratch(pose);
                sample(pose, i0, i1);
                sample(&mut right, i0 + 1, i1);
                blend_bones(skeleton, seq, pose, &right, s0, mask);
            }
        }
        (None, Some(_)) => {
            let mut right = scratch(pose);
            sample(pose, i0, i1 + 1);
            sample(&mut right, i0 + 1, i1 + 1);
            blend_bones(skeleton, seq, pose, &right, s0, mask);
        }
        (None, None) => {
            let mut right = scratch(pose);
            sample(pose, i0, i1);
            sample(&mut right, i0 + 1, i1);
            blend_bones(skeleton, seq, pose, &right, s0, mask);

            let mut top = scratch(pose);
            sample(&mut top, i0, i1 + 1);
            sample(&mut right, i0 + 1, i1 + 1);
            blend_bones(skeleton, seq, &mut top, &right, s0, mask);

            blend_bones(skeleton, seq, pose, &top, s1, mask);
        }
    }
    true
}

// ============================================================================
// Pose-to-pose blending
// ============================================================================

/// Blend grid corners: `dst` moves toward `src` by `s` on every weighted bone
pub fn blend_bones(
    skeleton: &Skeleton,
    seq: &Sequence,
    dst: &mut Pose,
    src: &Pose,
    s: f32,
    mask: BoneMask,
) {
    if s <= 0.0 {
        return;
    }
    let s1 = 1.0 - s;

    for (i, bone) in skeleton.bones.iter().enumerate() {
        if !bone.is_used_by(mask) || seq.bone_weight(i) <= 0.0 {
            continue;
        }
        if s >= 1.0 {
            dst.rotations[i] = src.rotations[i];
            dst.positions[i] = src.positions[i];
            continue;
        }

        dst.rotations[i] = if bone.has_fixed_alignment() {
            src.rotations[i].blend_no_align(dst.rotations[i], s1)
        } else {
            src.rotations[i].blend_to(dst.rotations[i], s1)
        };
        dst.positions[i] = dst.positions[i] * s1 + src.positions[i] * s;
    }
}

/// Scale a delta pose toward identity: `s = 0` gives identity, `s = 1`
/// leaves it unchanged
pub fn scale_bones(skeleton: &Skeleton, seq: &Sequence, pose: &mut Pose, s: f32, mask: BoneMask) {
    for (i, bone) in skeleton.bones.iter().enumerate() {
        if !bone.is_used_by(mask) || seq.bone_weight(i) <= 0.0 {
            continue;
        }
        pose.rotations[i] = pose.rotations[i].identity_blend(1.0 - s);
        pose.positions[i] *= s;
    }
}

/// Blend a sequence's pose `src` onto the accumulated pose `dst` by `s`,
/// scaled per bone by the sequence's bone weights. Delta sequences add on
/// top instead of interpolating.
pub fn slerp_bones(
    skeleton: &Skeleton,
    seq: &Sequence,
    dst: &mut Pose,
    src: &Pose,
    s: f32,
    mask: BoneMask,
) {
    if s <= 0.0 {
        return;
    }
    let s = s.min(1.0);

    if seq.has(SequenceFlags::WORLD) {
        world_space_slerp(skeleton, seq, dst, src, s, mask);
        return;
    }

    let delta = seq.has(SequenceFlags::DELTA);
    let post = seq.has(SequenceFlags::POST);

    for (i, bone) in skeleton.bones.iter().enumerate() {
        if !bone.is_used_by(mask) {
            continue;
        }
        let s2 = s * seq.bone_weight(i);
        if s2 <= 0.0 {
            continue;
        }

        if delta {
            dst.rotations[i] = if post {
                dst.rotations[i].compose_scaled(s2, src.rotations[i])
            } else {
                src.rotations[i].scale_then_compose(s2, dst.rotations[i])
            };
            dst.positions[i] += src.positions[i] * s2;
        } else {
            let s1 = 1.0 - s2;
            dst.rotations[i] = if bone.has_fixed_alignment() {
                src.rotations[i].slerp_no_align(dst.rotations[i], s1)
            } else {
                src.rotations[i].slerp_to(dst.rotations[i], s1)
            };
            dst.positions[i] = dst.positions[i] * s1 + src.positions[i] * s2;
        }
    }
}

/// Blend rotations in world space so a partially weighted bone keeps its
/// world orientation when its parent is overridden.
pub fn world_space_slerp(
    skeleton: &Skeleton,
    seq: &Sequence,
    dst: &mut Pose,
    src: &Pose,
    s: f32,
    mask: BoneMask,
) {
    let bone_count = skeleton.bone_count();
    let base = dst.clone();
    let mut dst_world = BoneChain::new(bone_count, Affine3A::IDENTITY);
    let mut src_world = BoneChain::new(bone_count, Affine3A::IDENTITY);
    // Blended world rotation of every visited bone
    let mut blended = vec![Quat::IDENTITY; bone_count];

    for (i, bone) in skeleton.bones.iter().enumerate() {
        if !bone.is_used_by(mask) {
            continue;
        }
        let parent = skeleton.parent(i);
        let s2 = s * seq.bone_weight(i);
        let s1 = parent.map_or(0.0, |p| s * seq.bone_weight(p));

        if s1 == 1.0 && s2 == 1.0 {
            dst.rotations[i] = src.rotations[i];
            dst.positions[i] = src.positions[i];
            blended[i] = decompose(&src_world.build(skeleton, src, i)).0;
        } else if s2 > 0.0 {
            let (dst_q, _) = decompose(&dst_world.build(skeleton, &base, i));
            let (src_q, _) = decompose(&src_world.build(skeleton, src, i));
            let target = dst_q.slerp_to(src_q, s2);
            blended[i] = target;

            match parent {
                None => dst.rotations[i] = target,
                Some(p) => {
                    dst.rotations[i] = (blended[p].inverse() * target).normalize();
                    dst.positions[i] = dst.positions[i].lerp(src.positions[i], s2);
                }
            }
        } else {
            blended[i] = decompose(&dst_world.build(skeleton, &base, i)).0;
        }
    }
}

// ============================================================================
// Layers and accumulation
// ============================================================================

/// Weight of a layer at `index`, or `None` while the layer is off
fn layer_weight(layer: &Layer, index: f32, weight: f32) -> Option<f32> {
    if index < layer.start || index >= layer.end {
        return None;
    }

    let mut s = 1.0;
    if index < layer.peak && layer.start != layer.peak {
        s = (index - layer.start) / (layer.peak - layer.start);
    } else if index > layer.tail && layer.end != layer.tail {
        s = (layer.end - index) / (layer.end - layer.tail);
    }
    if layer.flags.contains(LayerFlags::SPLINE) {
        s = simple_spline(s);
    }

    Some(if layer.flags.contains(LayerFlags::XFADE) && index > layer.tail {
        (s * weight) / (1.0 - weight + s * weight)
    } else if layer.flags.contains(LayerFlags::NOBLEND) {
        s
    } else {
        weight * s
    })
}

/// Value driving a layer: the cycle, or the clamped pose parameter for
/// POSE layers
fn layer_index(library: &AnimationLibrary, layer: &Layer, cycle: f32, ctx: &EvalContext) -> f32 {
    if !layer.flags.contains(LayerFlags::POSE) {
        return cycle;
    }
    layer
        .pose
        .and_then(|id| {
            let desc = library.skeleton.pose_parameter(id)?;
            let raw = ctx.params.get(id.index()).copied().unwrap_or(desc.start);
            Some(desc.clamp_raw(raw))
        })
        .unwrap_or(0.0)
}

#[allow(clippy::too_many_arguments)]
fn add_layers(
    library: &AnimationLibrary,
    mut ik: Option<&mut IkContext>,
    pose: &mut Pose,
    seq: &Sequence,
    cycle: f32,
    ctx: &EvalContext,
    weight: f32,
    local: bool,
) {
    for layer in seq.layers.iter() {
        if layer.flags.contains(LayerFlags::LOCAL) != local {
            continue;
        }

        let mut layer_cycle = cycle;
        let mut weight_here = weight;
        if layer.start != layer.end {
            let index = if local {
                cycle
            } else {
                layer_index(library, layer, cycle, ctx)
            };
            let Some(w) = layer_weight(layer, index, weight) else {
                continue;
            };
            weight_here = w;
            if local || !layer.flags.contains(LayerFlags::POSE) {
                layer_cycle = (cycle - layer.start) / (layer.end - layer.start);
            }
        }

        accumulate_pose(
            library,
            ik.as_deref_mut(),
            pose,
            layer.sequence,
            layer_cycle,
            ctx,
            weight_here,
        );
    }
}

/// Accumulate a sequence's non-LOCAL layers onto `pose`
pub fn add_sequence_layers(
    library: &AnimationLibrary,
    ik: Option<&mut IkContext>,
    pose: &mut Pose,
    seq: &Sequence,
    cycle: f32,
    ctx: &EvalContext,
    weight: f32,
) {
    add_layers(library, ik, pose, seq, cycle, ctx, weight, false);
}

/// Accumulate the LOCAL layers of a LOCAL sequence onto its scratch pose
pub fn add_local_layers(
    library: &AnimationLibrary,
    ik: Option<&mut IkContext>,
    pose: &mut Pose,
    seq: &Sequence,
    cycle: f32,
    ctx: &EvalContext,
    weight: f32,
) {
    if !seq.has(SequenceFlags::LOCAL) {
        return;
    }
    add_layers(library, ik, pose, seq, cycle, ctx, weight, true);
}

/// Record a sequence's IK locks on a throwaway context rooted at the origin
fn begin_sequence_locks(
    library: &AnimationLibrary,
    ik: Option<&IkContext>,
    seq: &Sequence,
    pose: &Pose,
    ctx: &EvalContext,
) -> Option<IkContext> {
    if seq.ik_locks.is_empty() {
        return None;
    }
    let tuning = ik.map(|ik| *ik.tuning()).unwrap_or_default();
    let mut seq_ik = IkContext::new(tuning);
    seq_ik.init(&library.skeleton, Affine3A::IDENTITY, 0.0, 0, ctx.bone_mask);
    seq_ik.add_sequence_locks(&library.skeleton, &seq.ik_locks, pose);
    Some(seq_ik)
}

/// Evaluate a base sequence into `pose`, replacing its contents
pub fn calc_pose(
    library: &AnimationLibrary,
    mut ik: Option<&mut IkContext>,
    pose: &mut Pose,
    sequence: SequenceId,
    cycle: f32,
    ctx: &EvalContext,
    weight: f32,
) {
    let weight = weight.clamp(0.0, 1.0);
    let Some(seq) = library.sequence(sequence) else {
        log::warn!("calc_pose: unknown sequence {}", sequence.index());
        return;
    };

    let locks = begin_sequence_locks(library, ik.as_deref(), seq, pose, ctx);

    calc_pose_single(library, seq, pose, cycle, ctx);
    if let Some(ik) = ik.as_deref_mut() {
        ik.add_dependencies(library, sequence, cycle, ctx.params, weight);
    }
    add_sequence_layers(library, ik, pose, seq, cycle, ctx, weight);

    if let Some(mut seq_ik) = locks {
        seq_ik.solve_sequence_locks(&library.skeleton, pose);
    }
}

/// Blend a sequence onto the existing `pose` by `weight`
pub fn accumulate_pose(
    library: &AnimationLibrary,
    mut ik: Option<&mut IkContext>,
    pose: &mut Pose,
    sequence: SequenceId,
    cycle: f32,
    ctx: &EvalContext,
    weight: f32,
) {
    let weight = weight.clamp(0.0, 1.0);
    let Some(seq) = library.sequence(sequence) else {
        return;
    };

    let locks = begin_sequence_locks(library, ik.as_deref(), seq, pose, ctx);

    let mut scratch = if seq.has(SequenceFlags::LOCAL) {
        Pose::rest(&library.skeleton)
    } else {
        pose.clone()
    };
    if calc_pose_single(library, seq, &mut scratch, cycle, ctx) {
        add_local_layers(library, ik.as_deref_mut(), &mut scratch, seq, cycle, ctx, 1.0);
        slerp_bones(&library.skeleton, seq, pose, &scratch, weight, ctx.bone_mask);
    }

    if let Some(ik) = ik.as_deref_mut() {
        ik.add_dependencies(library, sequence, cycle, ctx.params, weight);
    }
    add_sequence_layers(library, ik, pose, seq, cycle, ctx, weight);

    if let Some(mut seq_ik) = locks {
        seq_ik.solve_sequence_locks(&library.skeleton, pose);
    }
}

/// Play every AUTOPLAY sequence on top of `pose`, phased by `real_time`,
/// with the skeleton's autoplay locks held around them
pub fn calc_autoplay_sequences(
    library: &AnimationLibrary,
    mut ik: Option<&mut IkContext>,
    pose: &mut Pose,
    ctx: &EvalContext,
    real_time: f32,
) {
    if let Some(ik) = ik.as_deref_mut() {
        ik.add_autoplay_locks(&library.skeleton, pose);
    }

    for sequence in library.autoplay_sequences() {
        let Some(seq) = library.sequence(sequence) else {
            continue;
        };
        let cps = cycles_per_second(library, seq, ctx.params);
        let cycle = (real_time * cps).fract();
        accumulate_pose(library, None, pose, sequence, cycle, ctx, 1.0);
    }

    if let Some(ik) = ik {
        ik.solve_autoplay_locks(&library.skeleton, pose);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bone::ChainId;
    use wasm_bindgen_test::*;

    const LEG_RIG: &str = include_str!("../assets/rigs/leg_rig.json");
    const EPS: f32 = 1e-4;

    const LAYERED: &str = r#"{
        "name": "layered",
        "skeleton": {
            "bones": [
                { "name": "root" },
                { "name": "hip", "parent": 0, "position": [0.0, 0.0, 1.0] }
            ],
            "pose_parameters": [
                { "name": "lean", "start": 0.0, "end": 1.0 },
                { "name": "turn", "start": -1.0, "end": 1.0 }
            ]
        },
        "clips": [
            { "name": "base", "frame_count": 2, "tracks": [ { "bone": 1, "positions": [[0.0, 0.0, 1.0]] } ] },
            { "name": "raise", "frame_count": 2, "tracks": [ { "bone": 1, "positions": [[0.0, 0.0, 2.0]] } ] },
            { "name": "zero", "frame_count": 2, "delta": true,
              "tracks": [ { "bone": 1, "positions": [[0.0, 0.0, 0.0]], "rotations": [[0.0, 0.0, 0.0, 1.0]] } ] },
            { "name": "nudge", "frame_count": 2, "delta": true, "tracks": [ { "bone": 1, "positions": [[0.0, 0.4, 0.0]] } ] }
        ],
        "sequences": [
            { "name": "base", "grid": { "clips": [0] },
              "layers": [ { "sequence": 1, "start": 0.0, "peak": 0.5, "tail": 0.5, "end": 1.0 } ] },
            { "name": "raise", "grid": { "clips": [1] } },
            { "name": "nudge", "flags": "DELTA", "grid": { "axes": [ { "param": 0, "size": 2 } ], "clips": [2, 3] } },
            { "name": "zero", "flags": "DELTA", "grid": { "clips": [2] } },
            { "name": "posed", "grid": { "clips": [0] },
              "layers": [ { "sequence": 1, "flags": "POSE", "pose": 0, "start": 0.0, "peak": 1.0, "tail": 1.0, "end": 2.0 } ] },
            { "name": "lean_turn",
              "grid": { "axes": [ { "param": 0, "size": 2 }, { "param": 1, "size": 2 } ], "clips": [0, 1, 1, 0] } }
        ]
    }"#;

    fn leg_rig() -> AnimationLibrary {
        AnimationLibrary::from_json(LEG_RIG).unwrap()
    }

    fn layered() -> AnimationLibrary {
        AnimationLibrary::from_json(LAYERED).unwrap()
    }

    fn seq<'a>(library: &'a AnimationLibrary, name: &str) -> &'a Sequence {
        let id = library.sequence_index(name).unwrap();
        library.sequence(id).unwrap()
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_blend_coordinate_maps_range() {
        let library = leg_rig();
        let sway = seq(&library, "sway");
        assert_eq!(resolve_blend_coordinate(&library, sway, 0, &[-1.0]), (0.0, 0));
        assert_eq!(resolve_blend_coordinate(&library, sway, 0, &[0.0]), (0.5, 0));
        assert_eq!(resolve_blend_coordinate(&library, sway, 0, &[3.0]), (1.0, 0));
        // No second axis
        assert_eq!(resolve_blend_coordinate(&library, sway, 1, &[0.0]), (0.0, 0));
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_blend_coordinate_wide_axis_picks_column() {
        let mut library = leg_rig();
        let sway = &mut library.sequences[3];
        sway.grid.axes[0].size = 5;
        sway.grid.clips = vec![ClipId(3); 5];

        let sway = seq(&library, "sway");
        let (s, index) = resolve_blend_coordinate(&library, sway, 0, &[0.25]);
        // 0.625 of the way across four spans
        assert_eq!(index, 2);
        assert!((s - 0.5).abs() < EPS, "s {}", s);

        let (s, index) = resolve_blend_coordinate(&library, sway, 0, &[1.0]);
        assert_eq!(index, 3);
        assert!((s - 1.0).abs() < EPS);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_blend_coordinate_pose_keys() {
        let mut library = leg_rig();
        let axis = &mut library.sequences[3].grid.axes[0];
        axis.size = 3;
        axis.keys = vec![-1.0, -0.5, 1.0];
        library.sequences[3].grid.clips = vec![ClipId(3), ClipId(4), ClipId(3)];

        let sway = seq(&library, "sway");
        let (s, index) = resolve_blend_coordinate(&library, sway, 0, &[-0.75]);
        assert_eq!(index, 0);
        assert!((s - 0.5).abs() < EPS);

        let (s, index) = resolve_blend_coordinate(&library, sway, 0, &[0.25]);
        assert_eq!(index, 1);
        assert!((s - 0.5).abs() < EPS);
    }

    #[test]
    fn test_looping_parameter_wraps() {
        let mut library = leg_rig();
        let desc = &mut library.skeleton.pose_parameters[0];
        desc.start = -180.0;
        desc.end = 180.0;
        desc.loop_range = 360.0;

        let sway = seq(&library, "sway");
        let (s_wrapped, _) = resolve_blend_coordinate(&library, sway, 0, &[270.0]);
        let (s_direct, _) = resolve_blend_coordinate(&library, sway, 0, &[-90.0]);
        assert!((s_wrapped - s_direct).abs() < EPS);
        assert!((s_direct - 0.25).abs() < EPS);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_corner_weights_sum_to_one() {
        let library = leg_rig();
        let sway = seq(&library, "sway");
        let corners = seq_anims(&library, sway, &[0.5]);
        let total: f32 = corners.iter().map(|(_, w)| w).sum();
        assert!((total - 1.0).abs() < EPS);
        assert_eq!(corners[0].0, ClipId(3));
        assert_eq!(corners[1].0, ClipId(4));
        assert!((corners[1].1 - 0.75).abs() < EPS);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_two_axis_corner_weights() {
        let library = layered();
        let grid = seq(&library, "lean_turn");

        let corners = seq_anims(&library, grid, &[0.25, 0.5]);
        let clips: Vec<ClipId> = corners.iter().map(|&(clip, _)| clip).collect();
        assert_eq!(clips, vec![ClipId(0), ClipId(1), ClipId(1), ClipId(0)]);
        for (&(_, w), expected) in corners.iter().zip([0.1875, 0.0625, 0.5625, 0.1875]) {
            assert!((w - expected).abs() < EPS, "weight {} expected {}", w, expected);
        }

        // Sweep past both ends of each range
        for i in 0..=20 {
            for j in 0..=20 {
                let lean = -0.1 + 1.2 * i as f32 / 20.0;
                let turn = -1.2 + 2.4 * j as f32 / 20.0;
                let corners = seq_anims(&library, grid, &[lean, turn]);
                assert!(corners.iter().all(|&(_, w)| w >= 0.0), "{:?} at ({}, {})", corners, lean, turn);
                let total: f32 = corners.iter().map(|(_, w)| w).sum();
                assert!((total - 1.0).abs() < 1e-5, "sum {} at ({}, {})", total, lean, turn);
            }
        }
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_blend_coordinate_is_continuous() {
        let library = layered();
        let grid = seq(&library, "lean_turn");

        for axis in 0..2 {
            let base = [0.3, 0.3];
            let mut nudged = base;
            nudged[axis] += 1e-6;
            let (s, index) = resolve_blend_coordinate(&library, grid, axis, &base);
            let (s_nudged, index_nudged) = resolve_blend_coordinate(&library, grid, axis, &nudged);
            assert_eq!(index, index_nudged);
            assert!((s - s_nudged).abs() < 1e-5, "axis {}: {} -> {}", axis, s, s_nudged);

            let weights = seq_anims(&library, grid, &base);
            let weights_nudged = seq_anims(&library, grid, &nudged);
            for (a, b) in weights.iter().zip(&weights_nudged) {
                assert!((a.1 - b.1).abs() < 1e-5);
            }
        }
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_cycles_per_second_and_duration() {
        let library = leg_rig();
        let stand = seq(&library, "stand");
        assert!((cycles_per_second(&library, stand, &[]) - 30.0).abs() < EPS);
        assert!((sequence_duration(&library, stand, &[]) - 1.0 / 30.0).abs() < EPS);

        // Three frames at 30 fps: half a cycle per frame step
        let sway = seq(&library, "sway");
        assert!((cycles_per_second(&library, sway, &[0.0]) - 15.0).abs() < EPS);

        let mut still = library.clone();
        still.clips[0].frame_count = 1;
        assert_eq!(sequence_duration(&still, seq(&still, "stand"), &[]), 0.0);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_cycle_normalization() {
        let library = leg_rig();
        let looping = seq(&library, "sway");
        let once = seq(&library, "stand");

        assert!((normalize_cycle(looping, 1.25, 0.0, 1.0) - 0.25).abs() < EPS);
        assert!((normalize_cycle(looping, -0.25, 0.0, 1.0) - 0.75).abs() < EPS);
        assert_eq!(normalize_cycle(once, 1.5, 0.0, 1.0), 0.9999);
        assert_eq!(normalize_cycle(once, -2.0, 0.0, 1.0), 0.0);
        assert_eq!(normalize_cycle(once, 0.5, 0.0, 1.0), 0.5);
        assert_eq!(normalize_cycle(once, f32::NAN, 0.0, 1.0), 0.0);

        let mut realtime = looping.clone();
        realtime.flags |= SequenceFlags::REALTIME;
        assert!((normalize_cycle(&realtime, 0.9, 0.1, 15.0) - 0.5).abs() < EPS);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_single_pose_blends_grid_corners() {
        let library = leg_rig();
        let sway = seq(&library, "sway");
        let mut pose = Pose::rest(&library.skeleton);

        let ctx = EvalContext::new(&[0.0], BoneMask::ANYTHING, 0.0);
        assert!(calc_pose_single(&library, sway, &mut pose, 0.5, &ctx));
        assert!(pose.positions[1].abs_diff_eq(Vec3::new(0.0, 0.0, 1.0), EPS));

        let ctx = EvalContext::new(&[1.0], BoneMask::ANYTHING, 0.0);
        assert!(calc_pose_single(&library, sway, &mut pose, 0.5, &ctx));
        assert!(pose.positions[1].abs_diff_eq(Vec3::new(0.1, 0.0, 1.0), EPS));

        let ctx = EvalContext::new(&[-0.5], BoneMask::ANYTHING, 0.0);
        assert!(calc_pose_single(&library, sway, &mut pose, 0.5, &ctx));
        assert!(pose.positions[1].abs_diff_eq(Vec3::new(-0.05, 0.0, 1.0), EPS));
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_masked_bones_are_not_written() {
        let library = leg_rig();
        let sway = seq(&library, "sway");
        let mut pose = Pose::identity(library.skeleton.bone_count());

        // The foot is the only bone without an attachment bit
        let ctx = EvalContext::new(&[1.0], BoneMask::ATTACHMENT, 0.0);
        calc_pose_single(&library, sway, &mut pose, 0.0, &ctx);
        assert_eq!(pose.positions[1], Vec3::new(0.1, 0.0, 1.0));
        assert_eq!(pose.positions[3], Vec3::ZERO);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_all_zero_delta_leaves_pose() {
        let library = layered();
        let zero = seq(&library, "zero");
        let mut pose = Pose::rest(&library.skeleton);
        let before = pose.clone();

        let ctx = EvalContext::new(&[0.0], BoneMask::ANYTHING, 0.0);
        assert!(!calc_pose_single(&library, zero, &mut pose, 0.0, &ctx));
        assert_eq!(pose, before);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_zero_corner_scales_other_corner() {
        let library = layered();
        let nudge = seq(&library, "nudge");
        let mut pose = Pose::rest(&library.skeleton);

        let ctx = EvalContext::new(&[0.5], BoneMask::ANYTHING, 0.0);
        assert!(calc_pose_single(&library, nudge, &mut pose, 0.0, &ctx));
        assert!(pose.positions[1].abs_diff_eq(Vec3::new(0.0, 0.2, 0.0), EPS));
        assert!(pose.rotations[1].abs_diff_eq(Quat::IDENTITY, EPS));
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_slerp_bones_endpoints_are_exact() {
        let library = leg_rig();
        let stand = seq(&library, "stand");
        let skeleton = &library.skeleton;
        let mut rng = rand::rng();
        use rand::Rng;

        let mut src = Pose::rest(skeleton);
        for q in &mut src.rotations {
            let axis = Vec3::new(
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
                rng.random_range(0.1..1.0),
            )
            .normalize();
            *q = Quat::from_axis_angle(axis, rng.random_range(-3.0..3.0));
        }
        let base = Pose::rest(skeleton);

        let mut dst = base.clone();
        slerp_bones(skeleton, stand, &mut dst, &src, 0.0, BoneMask::ANYTHING);
        assert_eq!(dst, base);

        let mut dst = base.clone();
        slerp_bones(skeleton, stand, &mut dst, &src, 1.0, BoneMask::ANYTHING);
        assert_eq!(dst.rotations, src.rotations);
        assert_eq!(dst.positions, src.positions);

        // Over-unity weights clamp
        let mut dst = base.clone();
        slerp_bones(skeleton, stand, &mut dst, &src, 7.0, BoneMask::ANYTHING);
        assert_eq!(dst.rotations, src.rotations);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_delta_sequence_adds_on_top() {
        let library = layered();
        let nudge = seq(&library, "nudge");
        let skeleton = &library.skeleton;

        let mut dst = Pose::rest(skeleton);
        let mut delta = Pose::identity(skeleton.bone_count());
        delta.positions[1] = Vec3::new(0.0, 0.4, 0.0);
        delta.rotations[1] = Quat::from_rotation_z(0.5);

        slerp_bones(skeleton, nudge, &mut dst, &delta, 0.5, BoneMask::ANYTHING);
        assert!(dst.positions[1].abs_diff_eq(Vec3::new(0.0, 0.2, 1.0), EPS));
        assert!(dst.rotations[1].abs_diff_eq(Quat::from_rotation_z(0.25), EPS));
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_world_space_slerp_keeps_child_world_rotation() {
        let library = layered();
        let mut world = seq(&library, "base").clone();
        world.flags = SequenceFlags::WORLD;
        world.bone_weights = vec![0.0, 1.0];
        let skeleton = &library.skeleton;

        let mut dst = Pose::rest(skeleton);
        dst.rotations[0] = Quat::from_rotation_z(std::f32::consts::FRAC_PI_2);
        let mut src = Pose::rest(skeleton);
        src.positions[1] = Vec3::new(0.0, 0.0, 3.0);

        slerp_bones(skeleton, &world, &mut dst, &src, 1.0, BoneMask::ANYTHING);

        // Root untouched, child faces the source's world orientation
        assert_eq!(dst.rotations[0], Quat::from_rotation_z(std::f32::consts::FRAC_PI_2));
        let child_world = dst.rotations[0] * dst.rotations[1];
        assert!(child_world.abs_diff_eq(Quat::IDENTITY, EPS), "{:?}", child_world);
        assert!(dst.positions[1].abs_diff_eq(Vec3::new(0.0, 0.0, 3.0), EPS));
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_layer_ramp_weights() {
        let layer: Layer = serde_json::from_str(
            r#"{ "sequence": 0, "start": 0.2, "peak": 0.4, "tail": 0.6, "end": 0.8 }"#,
        )
        .unwrap();
        assert_eq!(layer_weight(&layer, 0.1, 1.0), None);
        assert_eq!(layer_weight(&layer, 0.8, 1.0), None);
        assert!((layer_weight(&layer, 0.3, 1.0).unwrap() - 0.5).abs() < EPS);
        assert!((layer_weight(&layer, 0.5, 0.5).unwrap() - 0.5).abs() < EPS);
        assert!((layer_weight(&layer, 0.7, 1.0).unwrap() - 0.5).abs() < EPS);

        let mut spline = layer.clone();
        spline.flags = LayerFlags::SPLINE;
        assert!((layer_weight(&spline, 0.25, 1.0).unwrap() - simple_spline(0.25)).abs() < EPS);

        let mut noblend = layer.clone();
        noblend.flags = LayerFlags::NOBLEND;
        assert!((layer_weight(&noblend, 0.3, 0.2).unwrap() - 0.5).abs() < EPS);

        let mut xfade = layer;
        xfade.flags = LayerFlags::XFADE;
        // s = 0.5, w = 0.5: 0.25 / 0.75
        assert!((layer_weight(&xfade, 0.7, 0.5).unwrap() - 1.0 / 3.0).abs() < EPS);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_calc_pose_applies_cycle_layer() {
        let library = layered();
        let base = library.sequence_index("base").unwrap();
        let mut pose = Pose::rest(&library.skeleton);

        let ctx = EvalContext::new(&[0.0], BoneMask::ANYTHING, 0.0);
        calc_pose(&library, None, &mut pose, base, 0.25, &ctx, 1.0);
        assert!((pose.positions[1].z - 1.5).abs() < EPS, "z {}", pose.positions[1].z);

        calc_pose(&library, None, &mut pose, base, 0.5, &ctx, 1.0);
        assert!((pose.positions[1].z - 2.0).abs() < EPS);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_pose_layer_follows_parameter() {
        let library = layered();
        let posed = library.sequence_index("posed").unwrap();
        let mut pose = Pose::rest(&library.skeleton);

        let ctx = EvalContext::new(&[0.5], BoneMask::ANYTHING, 0.0);
        calc_pose(&library, None, &mut pose, posed, 0.0, &ctx, 1.0);
        assert!((pose.positions[1].z - 1.5).abs() < EPS);

        let ctx = EvalContext::new(&[1.0], BoneMask::ANYTHING, 0.0);
        calc_pose(&library, None, &mut pose, posed, 0.0, &ctx, 1.0);
        assert!((pose.positions[1].z - 2.0).abs() < EPS);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_accumulate_delta_over_base() {
        let library = layered();
        let nudge = library.sequence_index("nudge").unwrap();
        let mut pose = Pose::rest(&library.skeleton);

        let ctx = EvalContext::new(&[1.0], BoneMask::ANYTHING, 0.0);
        accumulate_pose(&library, None, &mut pose, nudge, 0.0, &ctx, 0.5);
        assert!(pose.positions[1].abs_diff_eq(Vec3::new(0.0, 0.2, 1.0), EPS));

        // Unknown sequences are ignored
        let before = pose.clone();
        accumulate_pose(&library, None, &mut pose, SequenceId(42), 0.0, &ctx, 1.0);
        assert_eq!(pose, before);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_calc_pose_queues_ik_rules() {
        let library = leg_rig();
        let stand = library.sequence_index("stand").unwrap();
        let mut ik = IkContext::default();
        ik.init(&library.skeleton, Affine3A::IDENTITY, 0.0, 1, BoneMask::ANYTHING);
        let mut pose = Pose::rest(&library.skeleton);

        let ctx = EvalContext::new(&[0.0], BoneMask::ANYTHING, 0.0);
        calc_pose(&library, Some(&mut ik), &mut pose, stand, 0.5, &ctx, 1.0);
        assert_eq!(ik.rules(ChainId(0)).len(), 1);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_sequence_locks_pin_foot_under_layers() {
        let mut library = leg_rig();
        // Sway with the foot locked: the hip moves, the foot stays
        library.sequences[3].ik_locks = vec![serde_json::from_str(r#"{ "chain": 0 }"#).unwrap()];
        let sway = library.sequence_index("sway").unwrap();
        let mut pose = Pose::rest(&library.skeleton);

        let ctx = EvalContext::new(&[1.0], BoneMask::ANYTHING, 0.0);
        accumulate_pose(&library, None, &mut pose, sway, 0.0, &ctx, 1.0);
        assert!(pose.positions[1].abs_diff_eq(Vec3::new(0.1, 0.0, 1.0), EPS));

        let mut chain = BoneChain::new(library.skeleton.bone_count(), Affine3A::IDENTITY);
        let foot = crate::math::position(&chain.build(&library.skeleton, &pose, 3));
        assert!(foot.abs_diff_eq(Vec3::ZERO, EPS), "foot at {:?}", foot);
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_autoplay_sequences_play_on_top() {
        let mut library = layered();
        library.sequences[1].flags |= SequenceFlags::AUTOPLAY;
        let mut pose = Pose::rest(&library.skeleton);

        let ctx = EvalContext::new(&[0.0], BoneMask::ANYTHING, 0.0);
        calc_autoplay_sequences(&library, None, &mut pose, &ctx, 0.3);
        assert!((pose.positions[1].z - 2.0).abs() < EPS);
    }
}
