use crate::bone::{BoneChain, BoneIndex};
use crate::config::IkTuning;
use crate::math::position;
use crate::skeleton::IkChain;
use glam::{Affine3A, Vec3, Vec3A};

/// Knee position for a two link limb rooted at the origin.
///
/// `p` is the end effector, `d` a point the knee should bend toward, and
/// `a`/`b` the link lengths. Returns the knee and whether the triangle was
/// solvable; the knee is only meaningful on success.
pub fn solve_two_link(a: f32, b: f32, p: Vec3, d: Vec3) -> (Vec3, bool) {
    // Basis with x along the effector and the bend hint in the +y half plane
    let x = p.normalize_or_zero();
    let y = (d - x * d.dot(x)).normalize_or_zero();

    let c = p.length();
    let dist = (c + (a * a - b * b) / c) / 2.0;
    let e = (a * a - dist * dist).sqrt();

    let knee = x * dist + y * e;
    (knee, dist > c - b && dist < a)
}

/// Point the matrix's X axis along `dir`, keeping its Z axis as the up hint
fn align_ik_matrix(m: &mut Affine3A, dir: Vec3A) {
    let x = dir.normalize_or_zero();
    let y = m.matrix3.z_axis.cross(x).normalize_or_zero();
    let z = x.cross(y);
    m.matrix3.x_axis = x;
    m.matrix3.y_axis = y;
    m.matrix3.z_axis = z;
}

/// Solve hip/knee/foot toward `target` with the knee biased along `knee_dir`
/// from `knee_pos`. Links must already be built in `world`.
///
/// The target is pulled inside the reachable shell before solving. On
/// success the hip and knee matrices are re-aimed and the knee and foot
/// translations moved; on failure `world` is left untouched.
pub fn solve_ik_links(
    world: &mut BoneChain,
    links: [BoneIndex; 3],
    target: Vec3,
    knee_pos: Vec3,
    knee_dir: Vec3,
    tuning: &IkTuning,
) -> bool {
    let [hip, knee, foot] = links;
    let world_hip = position(&world.world(hip));
    let world_knee = position(&world.world(knee));
    let world_foot = position(&world.world(foot));

    let l1 = (world_knee - world_hip).length();
    let l2 = (world_foot - world_knee).length();

    let ik_knee = knee_pos - world_hip;

    // Exaggerate the bias for nearly straight legs
    let d = ((target - world_hip).length() - l1.min(l2)).max(l1 + l2) * 100.0;
    let ik_target_knee = ik_knee + knee_dir * d;

    let mut ik_foot = target - world_hip;
    let max_reach = (l1 + l2) * tuning.knee_max_epsilon;
    if ik_foot.length() > max_reach {
        ik_foot = ik_foot.normalize_or_zero() * max_reach;
    }
    let min_reach = (l1 - l2).abs() * tuning.knee_min_factor;
    if ik_foot.length() < min_reach {
        ik_foot = ik_foot.normalize_or_zero() * min_reach;
    }

    let (solved_knee, ok) = solve_two_link(l1, l2, ik_foot, ik_target_knee);
    if !ok {
        return false;
    }

    let mut m_hip = world.world(hip);
    align_ik_matrix(&mut m_hip, solved_knee.into());
    world.set_world(hip, m_hip);

    let mut m_knee = world.world(knee);
    align_ik_matrix(&mut m_knee, (ik_foot - solved_knee).into());
    m_knee.translation = (solved_knee + world_hip).into();
    world.set_world(knee, m_knee);

    let mut m_foot = world.world(foot);
    m_foot.translation = (ik_foot + world_hip).into();
    world.set_world(foot, m_foot);

    true
}

/// Solve without a bend preference: the knee keeps bending the way it
/// currently bends. Fails when the leg is too straight to tell.
pub fn solve_ik_links_free(
    world: &mut BoneChain,
    links: [BoneIndex; 3],
    target: Vec3,
    tuning: &IkTuning,
) -> bool {
    let [hip, knee, foot] = links;
    let world_hip = position(&world.world(hip));
    let world_knee = position(&world.world(knee));
    let world_foot = position(&world.world(foot));

    let l1 = (world_knee - world_hip).length();
    let l2 = (world_foot - world_knee).length();
    let l3 = (world_foot - world_hip).length();

    if l3 <= f32::EPSILON || l3 > (l1 + l2) * tuning.knee_max_epsilon {
        return false;
    }

    let half = (world_foot - world_hip) * (l1 / l3);
    let knee_dir = ((world_knee - world_hip) - half).normalize_or_zero();

    solve_ik_links(world, links, target, world_knee, knee_dir, tuning)
}

/// Solve a skeleton chain, using its authored bend direction when it has one
pub fn solve_chain(chain: &IkChain, target: Vec3, world: &mut BoneChain, tuning: &IkTuning) -> bool {
    match chain.bend_direction() {
        Some(dir) => {
            let hip = world.world(chain.hip());
            let knee_dir = Vec3::from(hip.transform_vector3a(dir.into()));
            let knee_pos = position(&world.world(chain.knee()));
            solve_ik_links(world, chain.links, target, knee_pos, knee_dir, tuning)
        }
        None => solve_ik_links_free(world, chain.links, target, tuning),
    }
}
