//! Linear algebra primitives using glam plus the quaternion kernels the
//! blend and IK code is tuned against.
//!
//! The kernels differ from glam's built-ins in a few places:
//! `slerp_no_align` never flips the second operand, `scale_angle` keeps the
//! sign of `w`, and every blend returns its endpoints exactly at 0 and 1.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use glam::Mat4;

pub use glam::{Affine3A, Mat3A, Quat, Vec3, Vec3A, Vec4};

/// Tolerance shared by the slerp kernels
pub const QUAT_EPSILON: f32 = 1e-6;

/// Cubic ease-in/ease-out, `3t² − 2t³`
#[inline]
pub fn simple_spline(t: f32) -> f32 {
    let t2 = t * t;
    3.0 * t2 - 2.0 * t2 * t
}

/// Quaternion kernels used by pose blending and IK latching.
pub trait QuatBlend: Sized {
    /// Return `self` or `-self`, whichever lies in the same hemisphere as `reference`
    fn aligned_to(self, reference: Quat) -> Quat;

    /// Normalized lerp toward `q` after aligning it to `self`
    fn blend_to(self, q: Quat, t: f32) -> Quat;

    /// Normalized lerp toward `q` without hemisphere correction
    fn blend_no_align(self, q: Quat, t: f32) -> Quat;

    /// Normalized lerp toward identity, keeping the sign of `w`
    fn identity_blend(self, t: f32) -> Quat;

    /// Spherical interpolation toward `q` after aligning it to `self`
    fn slerp_to(self, q: Quat, t: f32) -> Quat;

    /// Spherical interpolation without hemisphere correction
    fn slerp_no_align(self, q: Quat, t: f32) -> Quat;

    /// Scale the rotation angle by `t`
    fn scale_angle(self, t: f32) -> Quat;

    /// `normalize(scale(self, s) * q)`
    fn scale_then_compose(self, s: f32, q: Quat) -> Quat;

    /// `normalize(self * scale(q, s))`
    fn compose_scaled(self, s: f32, q: Quat) -> Quat;

    /// `self + s * align(q, self)`, unnormalized (for weighted averages)
    fn accumulate(self, s: f32, q: Quat) -> Quat;

    /// Hamilton product with `q` aligned to `self` first
    fn mul_aligned(self, q: Quat) -> Quat;
}

impl QuatBlend for Quat {
    #[inline]
    fn aligned_to(self, reference: Quat) -> Quat {
        let p = Vec4::from(reference);
        let q = Vec4::from(self);
        if (p - q).length_squared() > (p + q).length_squared() {
            -self
        } else {
            self
        }
    }

    fn blend_to(self, q: Quat, t: f32) -> Quat {
        self.blend_no_align(q.aligned_to(self), t)
    }

    fn blend_no_align(self, q: Quat, t: f32) -> Quat {
        if t <= 0.0 {
            return self;
        }
        if t >= 1.0 {
            return q;
        }
        let v = Vec4::from(self) * (1.0 - t) + Vec4::from(q) * t;
        Quat::from_vec4(v).normalize()
    }

    fn identity_blend(self, t: f32) -> Quat {
        let sclp = 1.0 - t;
        let w = if self.w < 0.0 {
            self.w * sclp - t
        } else {
            self.w * sclp + t
        };
        Quat::from_xyzw(self.x * sclp, self.y * sclp, self.z * sclp, w).normalize()
    }

    fn slerp_to(self, q: Quat, t: f32) -> Quat {
        self.slerp_no_align(q.aligned_to(self), t)
    }

    fn slerp_no_align(self, q: Quat, t: f32) -> Quat {
        if t == 0.0 {
            return self;
        }
        if t == 1.0 {
            return q;
        }

        let p = Vec4::from(self);
        let qv = Vec4::from(q);
        let cosom = p.dot(qv);

        if 1.0 + cosom > QUAT_EPSILON {
            let (sclp, sclq) = if 1.0 - cosom > QUAT_EPSILON {
                let omega = cosom.acos();
                let sinom = omega.sin();
                (
                    ((1.0 - t) * omega).sin() / sinom,
                    (t * omega).sin() / sinom,
                )
            } else {
                (1.0 - t, t)
            };
            Quat::from_vec4(p * sclp + qv * sclq)
        } else {
            // Antipodal: rotate through a perpendicular quaternion
            let perp = Vec4::new(-q.y, q.x, -q.w, q.z);
            let sclp = ((1.0 - t) * std::f32::consts::FRAC_PI_2).sin();
            let sclq = (t * std::f32::consts::FRAC_PI_2).sin();
            Quat::from_xyzw(
                sclp * p.x + sclq * perp.x,
                sclp * p.y + sclq * perp.y,
                sclp * p.z + sclq * perp.z,
                perp.w,
            )
        }
    }

    fn scale_angle(self, t: f32) -> Quat {
        let xyz = Vec3::new(self.x, self.y, self.z);
        let sinom = xyz.length().min(1.0);
        let sinsom = (sinom.asin() * t).sin();

        let scale = sinsom / (sinom + f32::EPSILON);
        let xyz = xyz * scale;

        let r = (1.0 - sinsom * sinsom).max(0.0).sqrt();
        let w = if self.w < 0.0 { -r } else { r };
        Quat::from_xyzw(xyz.x, xyz.y, xyz.z, w)
    }

    fn scale_then_compose(self, s: f32, q: Quat) -> Quat {
        self.scale_angle(s).mul_aligned(q).normalize()
    }

    fn compose_scaled(self, s: f32, q: Quat) -> Quat {
        self.mul_aligned(q.scale_angle(s)).normalize()
    }

    fn accumulate(self, s: f32, q: Quat) -> Quat {
        let q2 = q.aligned_to(self);
        Quat::from_vec4(Vec4::from(self) + Vec4::from(q2) * s)
    }

    #[inline]
    fn mul_aligned(self, q: Quat) -> Quat {
        self * q.aligned_to(self)
    }
}

/// Rigid transform from a rotation and translation
#[inline]
pub fn rigid(rotation: Quat, translation: Vec3) -> Affine3A {
    Affine3A::from_rotation_translation(rotation, translation)
}

/// Split a rigid transform into rotation and translation
#[inline]
pub fn decompose(m: &Affine3A) -> (Quat, Vec3) {
    (
        Quat::from_mat3a(&m.matrix3).normalize(),
        Vec3::from(m.translation),
    )
}

/// Translation column of a transform
#[inline]
pub fn position(m: &Affine3A) -> Vec3 {
    Vec3::from(m.translation)
}

/// Row-major 3x4 matrix, the packed layout the bone cache stores and hands
/// to skinning code.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct PackedBoneMatrix {
    pub rows: [[f32; 4]; 3],
}

const_assert_eq!(std::mem::size_of::<PackedBoneMatrix>(), 48);

impl PackedBoneMatrix {
    pub const IDENTITY: Self = Self {
        rows: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ],
    };

    /// Pack an affine transform
    #[inline(always)]
    pub fn from_affine(m: &Affine3A) -> Self {
        cfg_if::cfg_if! {
            if #[cfg(any(target_feature = "simd128", target_feature = "sse2"))] {
                Self::from_affine_transposed(m)
            } else {
                Self::from_affine_scalar(m)
            }
        }
    }

    /// Let glam's vectorised transpose do the shuffling
    #[allow(dead_code)]
    fn from_affine_transposed(m: &Affine3A) -> Self {
        let t = Mat4::from(*m).transpose();
        Self {
            rows: [t.x_axis.to_array(), t.y_axis.to_array(), t.z_axis.to_array()],
        }
    }

    #[allow(dead_code)]
    fn from_affine_scalar(m: &Affine3A) -> Self {
        let x = m.matrix3.x_axis;
        let y = m.matrix3.y_axis;
        let z = m.matrix3.z_axis;
        let t = m.translation;
        Self {
            rows: [
                [x.x, y.x, z.x, t.x],
                [x.y, y.y, z.y, t.y],
                [x.z, y.z, z.z, t.z],
            ],
        }
    }

    /// Unpack into an affine transform
    pub fn to_affine(&self) -> Affine3A {
        let r = &self.rows;
        Affine3A::from_cols(
            Vec3A::new(r[0][0], r[1][0], r[2][0]),
            Vec3A::new(r[0][1], r[1][1], r[2][1]),
            Vec3A::new(r[0][2], r[1][2], r[2][2]),
            Vec3A::new(r[0][3], r[1][3], r[2][3]),
        )
    }
}
