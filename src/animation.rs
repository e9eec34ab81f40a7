use crate::bone::{Clip, ClipId, SequenceId};
use crate::error::RigError;
use crate::sequence::{Sequence, SequenceFlags};
use crate::skeleton::Skeleton;
use serde::{Deserialize, Serialize};

/// Animation library - loaded once, read-only during evaluation
///
/// Holds the skeleton together with every clip and sequence that refers to
/// it. Ids are plain indices into the tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnimationLibrary {
    #[serde(default)]
    pub name: String,
    pub skeleton: Skeleton,
    #[serde(default)]
    pub clips: Vec<Clip>,
    #[serde(default)]
    pub sequences: Vec<Sequence>,
}

impl AnimationLibrary {
    /// Parse a rig document, validate it and build derived clip data
    pub fn from_json(json: &str) -> Result<Self, RigError> {
        let mut library: AnimationLibrary = serde_json::from_str(json)?;
        library.validate()?;
        library.prepare();
        log::info!(
            "Loaded rig '{}' ({} bones, {} clips, {} sequences)",
            library.name,
            library.skeleton.bone_count(),
            library.clips.len(),
            library.sequences.len()
        );
        Ok(library)
    }

    pub fn validate(&self) -> Result<(), RigError> {
        self.skeleton.validate()?;
        for clip in &self.clips {
            clip.validate(&self.skeleton)?;
        }
        for seq in &self.sequences {
            seq.validate(&self.skeleton, self.clips.len(), self.sequences.len())?;
        }
        self.check_layer_cycles()
    }

    /// Layers recurse into their sequences, so the layer graph must be acyclic
    fn check_layer_cycles(&self) -> Result<(), RigError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            Active,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.sequences.len()];
        for root in 0..self.sequences.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            // Iterative DFS: (sequence, next layer to visit)
            let mut stack = vec![(root, 0usize)];
            marks[root] = Mark::Active;
            while let Some((seq, next)) = stack.pop() {
                let layers = &self.sequences[seq].layers;
                let Some(layer) = layers.get(next) else {
                    marks[seq] = Mark::Done;
                    continue;
                };
                stack.push((seq, next + 1));

                let child = layer.sequence.index();
                match marks.get(child) {
                    Some(Mark::Active) => {
                        return Err(RigError::LayerCycle {
                            sequence: self.sequences[child].name.clone(),
                        });
                    }
                    Some(Mark::Unvisited) => {
                        marks[child] = Mark::Active;
                        stack.push((child, 0));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Rebuild clip lookup tables, zero frames and all-zero flags
    pub fn prepare(&mut self) {
        let bone_count = self.skeleton.bone_count();
        for clip in &mut self.clips {
            clip.prepare(bone_count);
        }
    }

    #[inline]
    pub fn clip(&self, id: ClipId) -> Option<&Clip> {
        self.clips.get(id.index())
    }

    #[inline]
    pub fn sequence(&self, id: SequenceId) -> Option<&Sequence> {
        self.sequences.get(id.index())
    }

    pub fn clip_mut(&mut self, id: ClipId) -> Option<&mut Clip> {
        self.clips.get_mut(id.index())
    }

    pub fn sequence_index(&self, name: &str) -> Option<SequenceId> {
        self.sequences
            .iter()
            .position(|s| s.name == name)
            .map(SequenceId::from)
    }

    /// Sequences played every frame regardless of the caller's sequence
    pub fn autoplay_sequences(&self) -> impl Iterator<Item = SequenceId> + '_ {
        self.sequences
            .iter()
            .enumerate()
            .filter(|(_, s)| s.has(SequenceFlags::AUTOPLAY))
            .map(|(i, _)| SequenceId::from(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_bindgen_test::*;

    const LEG_RIG: &str = include_str!("../assets/rigs/leg_rig.json");

    #[test]
    #[wasm_bindgen_test]
    fn test_fixture_loads() {
        let library = AnimationLibrary::from_json(LEG_RIG).unwrap();
        assert_eq!(library.skeleton.bone_count(), 4);
        assert_eq!(library.skeleton.ik_chains.len(), 1);
        assert!(library.sequence_index("stand").is_some());
        assert!(library.clip(ClipId(0)).is_some());
        assert!(library.sequence(SequenceId(99)).is_none());
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_unknown_clip_reference_is_rejected() {
        let json = r#"{
            "skeleton": { "bones": [ { "name": "root" } ] },
            "clips": [ { "name": "idle", "frame_count": 1 } ],
            "sequences": [ { "name": "idle", "grid": { "clips": [3] } } ]
        }"#;
        assert!(matches!(
            AnimationLibrary::from_json(json),
            Err(RigError::UnknownClip { clip: 3, .. })
        ));
    }

    #[test]
    fn test_bad_hierarchy_is_rejected() {
        let json = r#"{ "skeleton": { "bones": [ { "name": "a", "parent": 0 } ] } }"#;
        assert!(matches!(
            AnimationLibrary::from_json(json),
            Err(RigError::ParentOrder { .. })
        ));
        assert!(matches!(
            AnimationLibrary::from_json("{"),
            Err(RigError::Json(_))
        ));
    }

    #[test]
    fn test_layer_cycle_is_rejected() {
        let json = r#"{
            "skeleton": { "bones": [ { "name": "root" } ] },
            "clips": [ { "name": "idle", "frame_count": 1 } ],
            "sequences": [
                { "name": "a", "grid": { "clips": [0] }, "layers": [ { "sequence": 1 } ] },
                { "name": "b", "grid": { "clips": [0] }, "layers": [ { "sequence": 2 } ] },
                { "name": "c", "grid": { "clips": [0] }, "layers": [ { "sequence": 0 } ] }
            ]
        }"#;
        assert!(matches!(
            AnimationLibrary::from_json(json),
            Err(RigError::LayerCycle { .. })
        ));

        // Shared layers without a loop are fine
        let json = r#"{
            "skeleton": { "bones": [ { "name": "root" } ] },
            "clips": [ { "name": "idle", "frame_count": 1 } ],
            "sequences": [
                { "name": "a", "grid": { "clips": [0] }, "layers": [ { "sequence": 2 }, { "sequence": 1 } ] },
                { "name": "b", "grid": { "clips": [0] }, "layers": [ { "sequence": 2 } ] },
                { "name": "c", "grid": { "clips": [0] } }
            ]
        }"#;
        assert!(AnimationLibrary::from_json(json).is_ok());
    }

    #[test]
    fn test_autoplay_sequences_are_listed() {
        let mut library = AnimationLibrary::from_json(LEG_RIG).unwrap();
        assert_eq!(library.autoplay_sequences().count(), 0);
        library.sequences[0].flags |= SequenceFlags::AUTOPLAY;
        assert_eq!(
            library.autoplay_sequences().collect::<Vec<_>>(),
            vec![SequenceId(0)]
        );
    }
}
