use serde::{Deserialize, Serialize};

/// Bones are addressed by their position in the skeleton's bone table.
/// The table is ordered for topological traversal (parents before children).
pub type BoneIndex = usize;

macro_rules! index_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u16);

        impl $name {
            /// Convert to array index
            #[inline]
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl From<usize> for $name {
            fn from(index: usize) -> Self {
                Self(index as u16)
            }
        }
    };
}

index_id!(
    /// Index into the library's sequence table
    SequenceId
);

index_id!(
    /// Index into the library's clip table
    ClipId
);

index_id!(
    /// Index into the skeleton's IK chain table
    ChainId
);

index_id!(
    /// Index into the skeleton's pose parameter table
    PoseParamId
);
