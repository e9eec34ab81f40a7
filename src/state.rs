//! Registry of live rigs behind the wasm bindings
//!
//! Implements a Context Passing pattern where:
//! 1. `RigInstance` owns all per-character state and is usable on its own
//! 2. Core functions take explicit references (`&AnimationLibrary`, `&mut Pose`)
//! 3. WASM bindings are thin wrappers that look a rig up by handle and call
//!    into it
//!
//! Only the bindings touch the thread-local registry; tests and native
//! callers hold `RigInstance` values directly.

use std::cell::RefCell;

use crate::rig::RigInstance;

/// Opaque rig handle: slot index in the low 16 bits, slot generation in
/// the high 16 bits. Zero is never handed out.
pub type RigHandle = u32;

struct RigSlot {
    generation: u16,
    rig: Option<RigInstance>,
}

pub struct RigRegistry {
    slots: Vec<RigSlot>,
    free: Vec<usize>,
}

impl Default for RigRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RigRegistry {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn pack(index: usize, generation: u16) -> RigHandle {
        ((generation as u32) << 16) | index as u32
    }

    fn slot_index(&self, handle: RigHandle) -> Option<usize> {
        let index = (handle & 0xffff) as usize;
        let generation = (handle >> 16) as u16;
        let slot = self.slots.get(index)?;
        (slot.generation == generation && slot.rig.is_some()).then_some(index)
    }

    /// Store a rig and hand back its handle
    pub fn insert(&mut self, rig: RigInstance) -> Option<RigHandle> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < 0xffff => {
                self.slots.push(RigSlot {
                    generation: 1,
                    rig: None,
                });
                self.slots.len() - 1
            }
            None => {
                log::warn!("Rig registry is full");
                return None;
            }
        };
        let slot = &mut self.slots[index];
        slot.rig = Some(rig);
        Some(Self::pack(index, slot.generation))
    }

    /// Drop a rig; its handle and any copies of it go stale
    pub fn remove(&mut self, handle: RigHandle) -> Option<RigInstance> {
        let index = self.slot_index(handle)?;
        let slot = &mut self.slots[index];
        let rig = slot.rig.take();
        // Generation 0 is skipped so handle 0 stays invalid
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(index);
        rig
    }

    pub fn get(&self, handle: RigHandle) -> Option<&RigInstance> {
        let index = self.slot_index(handle)?;
        self.slots[index].rig.as_ref()
    }

    pub fn get_mut(&mut self, handle: RigHandle) -> Option<&mut RigInstance> {
        let index = self.slot_index(handle)?;
        self.slots[index].rig.as_mut()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Global state access, thin wrapper for WASM bindings only
thread_local! {
    static RIGS: RefCell<RigRegistry> = const { RefCell::new(RigRegistry::new()) };
}

/// Execute a closure with mutable access to the registry
pub fn with_registry_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut RigRegistry) -> R,
{
    RIGS.with(|rigs| f(&mut rigs.borrow_mut()))
}

/// Execute a closure with immutable access to one rig
///
/// Returns None if the handle is stale or unknown
pub fn with_rig<F, R>(handle: RigHandle, f: F) -> Option<R>
where
    F: FnOnce(&RigInstance) -> R,
{
    RIGS.with(|rigs| rigs.borrow().get(handle).map(f))
}

/// Execute a closure with mutable access to one rig
///
/// Returns None if the handle is stale or unknown
pub fn with_rig_mut<F, R>(handle: RigHandle, f: F) -> Option<R>
where
    F: FnOnce(&mut RigInstance) -> R,
{
    RIGS.with(|rigs| rigs.borrow_mut().get_mut(handle).map(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bone::PoseParamId;
    use wasm_bindgen_test::*;

    const LEG_RIG: &str = include_str!("../assets/rigs/leg_rig.json");

    fn rig() -> RigInstance {
        RigInstance::from_json(LEG_RIG, None).unwrap()
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_removed_handle_goes_stale() {
        let mut registry = RigRegistry::new();
        let a = registry.insert(rig()).unwrap();
        assert_ne!(a, 0);
        assert!(registry.get(a).is_some());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(a).is_some());
        assert!(registry.get(a).is_none());
        assert!(registry.remove(a).is_none());
        assert!(registry.is_empty());

        // The slot is reused under a new generation
        let b = registry.insert(rig()).unwrap();
        assert_eq!(a & 0xffff, b & 0xffff);
        assert_ne!(a, b);
        assert!(registry.get(a).is_none());
        assert!(registry.get_mut(b).is_some());
    }

    #[test]
    #[wasm_bindgen_test]
    fn test_zero_handle_is_never_valid() {
        let mut registry = RigRegistry::new();
        registry.insert(rig()).unwrap();
        assert!(registry.get(0).is_none());
    }

    #[test]
    fn test_thread_local_access() {
        let handle = with_registry_mut(|rigs| rigs.insert(rig())).unwrap();
        let bones = with_rig(handle, |rig| rig.library().skeleton.bone_count());
        assert_eq!(bones, Some(4));

        let set = with_rig_mut(handle, |rig| rig.set_pose_parameter(PoseParamId(0), 0.5));
        assert_eq!(set, Some(true));

        with_registry_mut(|rigs| rigs.remove(handle));
        assert_eq!(with_rig(handle, |_| ()), None);
    }
}
