//! Bone-level data: indices, local poses and world chains, clips, caches.

pub mod cache;
pub mod clip;
pub mod id;
pub mod pose;

pub use cache::*;
pub use clip::*;
pub use id::*;
pub use pose::*;
