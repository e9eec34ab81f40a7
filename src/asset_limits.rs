//! Shared rig limits used by both build.rs and runtime code.
//!
//! This module is included by both the build script and the skeleton loader
//! so that compile-time asset validation and runtime validation agree.

// Some constants are only used by build.rs for validation
#![allow(dead_code)]

/// Largest skeleton the bone bit-sets and cache index tables can address.
pub const MAX_BONES: usize = 128;

/// Upper bound on IK chains per skeleton (size of the per-frame chain result table).
pub const MAX_IK_CHAINS: usize = 32;

/// Number of persistent IK target slots per character.
pub const MAX_IK_TARGETS: usize = 12;

/// A sequence blends along at most two pose parameters.
pub const MAX_BLEND_AXES: usize = 2;

/// Number of joints in an analytic IK chain (hip, knee, foot).
pub const IK_CHAIN_LINKS: usize = 3;
