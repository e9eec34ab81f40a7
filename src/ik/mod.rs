//! Inverse kinematics: the analytic two-bone solver, per-frame rules
//! extracted from clips, persistent targets, and the context that ties
//! them together across frames.

pub mod context;
pub mod rule;
pub mod solver;
pub mod target;

pub use context::IkContext;
pub use rule::{sequence_error, ContextRule, PhaseWindow};
pub use solver::{solve_chain, solve_ik_links, solve_ik_links_free, solve_two_link};
pub use target::{
    ErrorState, IkTarget, LatchState, OwnerFrame, RigidPose, TargetEstimate, TraceProbe, NO_FRAME,
};
