use super::id::BoneIndex;
use crate::asset_limits::MAX_BONES;
use crate::math::PackedBoneMatrix;
use crate::skeleton::{BoneMask, Skeleton};
use glam::Affine3A;
use std::collections::BTreeMap;

const SET_WORDS: usize = MAX_BONES.div_ceil(64);

/// Bitset over bone indices.
/// Bit i corresponds to the bone at index i.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoneSet([u64; SET_WORDS]);

impl BoneSet {
    #[inline]
    pub fn is_marked(&self, bone: BoneIndex) -> bool {
        bone < MAX_BONES && (self.0[bone / 64] & (1 << (bone % 64))) != 0
    }

    /// Mark a bone. Indices past the limit are ignored.
    #[inline]
    pub fn mark(&mut self, bone: BoneIndex) {
        if bone < MAX_BONES {
            self.0[bone / 64] |= 1 << (bone % 64);
        }
    }

    #[inline]
    pub fn unmark(&mut self, bone: BoneIndex) {
        if bone < MAX_BONES {
            self.0[bone / 64] &= !(1 << (bone % 64));
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = [0; SET_WORDS];
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    pub fn count(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// World matrices of the bones selected by a mask, captured at one time.
///
/// Bone 0 is always cached so that the character origin is available even
/// when the mask selects nothing else.
#[derive(Debug, Clone)]
pub struct BoneCache {
    built_time: Option<f32>,
    bone_mask: BoneMask,
    skeleton_to_cached: Vec<Option<u16>>,
    cached_to_skeleton: Vec<u16>,
    matrices: Vec<PackedBoneMatrix>,
}

impl BoneCache {
    pub fn new(skeleton: &Skeleton, world: &[Affine3A], mask: BoneMask, time: f32) -> Self {
        let mut skeleton_to_cached = vec![None; skeleton.bone_count()];
        let mut cached_to_skeleton = Vec::new();
        for (i, bone) in skeleton.bones.iter().enumerate() {
            if i == 0 || bone.is_used_by(mask) {
                skeleton_to_cached[i] = Some(cached_to_skeleton.len() as u16);
                cached_to_skeleton.push(i as u16);
            }
        }

        let mut cache = Self {
            built_time: None,
            bone_mask: mask,
            skeleton_to_cached,
            matrices: vec![PackedBoneMatrix::IDENTITY; cached_to_skeleton.len()],
            cached_to_skeleton,
        };
        cache.update_bones(world, time);
        cache
    }

    /// Approximate heap footprint of a cache holding `cached_bones` bones
    pub const fn estimated_size(cached_bones: usize) -> usize {
        cached_bones * (2 + 2 + std::mem::size_of::<PackedBoneMatrix>())
    }

    pub fn size_bytes(&self) -> usize {
        Self::estimated_size(self.cached_to_skeleton.len())
    }

    /// Refresh every cached matrix from skeleton-indexed world transforms
    pub fn update_bones(&mut self, world: &[Affine3A], time: f32) {
        for (slot, &bone) in self.cached_to_skeleton.iter().enumerate() {
            if let Some(m) = world.get(bone as usize) {
                self.matrices[slot] = PackedBoneMatrix::from_affine(m);
            }
        }
        self.built_time = Some(time);
    }

    /// True while no more than `max_drift` seconds have passed since the build
    pub fn is_valid(&self, time: f32, max_drift: f32) -> bool {
        self.built_time
            .is_some_and(|built| time - built <= max_drift)
    }

    pub fn invalidate(&mut self) {
        self.built_time = None;
    }

    pub fn built_time(&self) -> Option<f32> {
        self.built_time
    }

    pub fn bone_mask(&self) -> BoneMask {
        self.bone_mask
    }

    /// Matrix of a skeleton bone, if the bone was cached
    pub fn cached_bone(&self, bone: BoneIndex) -> Option<&PackedBoneMatrix> {
        let slot = (*self.skeleton_to_cached.get(bone)?)?;
        self.matrices.get(slot as usize)
    }

    /// Scatter the cached matrices into a skeleton-indexed array.
    /// Entries for bones that are not cached are left untouched.
    pub fn read_cached_bones(&self, out: &mut [Affine3A]) {
        for (slot, &bone) in self.cached_to_skeleton.iter().enumerate() {
            if let Some(dst) = out.get_mut(bone as usize) {
                *dst = self.matrices[slot].to_affine();
            }
        }
    }

    /// Packed matrices in cached order
    pub fn matrices(&self) -> &[PackedBoneMatrix] {
        &self.matrices
    }

    pub fn cached_bones(&self) -> impl Iterator<Item = BoneIndex> + '_ {
        self.cached_to_skeleton.iter().map(|&b| b as usize)
    }
}

/// Opaque reference to a cache entry. The generation makes handles to a
/// destroyed entry stay dead when the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheHandle {
    index: u32,
    generation: u32,
}

impl CacheHandle {
    /// Pack into a single integer for the wasm boundary
    pub fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

/// Decides which live entry to drop when the byte budget is exceeded
pub trait EvictionPolicy: Default {
    /// Entry was created or read
    fn touch(&mut self, slot: usize);
    /// Entry was destroyed
    fn remove(&mut self, slot: usize);
    /// Next entry to evict
    fn victim(&self) -> Option<usize>;
}

/// Least-recently-used eviction.
///
/// Every touch stamps the slot with a fresh counter value; the oldest stamp
/// is the victim.
#[derive(Debug, Default)]
pub struct LruPolicy {
    next_stamp: u64,
    stamps: Vec<Option<u64>>,
    by_stamp: BTreeMap<u64, usize>,
}

impl EvictionPolicy for LruPolicy {
    fn touch(&mut self, slot: usize) {
        self.remove(slot);
        if slot >= self.stamps.len() {
            self.stamps.resize(slot + 1, None);
        }
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.stamps[slot] = Some(stamp);
        self.by_stamp.insert(stamp, slot);
    }

    fn remove(&mut self, slot: usize) {
        if let Some(stamp) = self.stamps.get_mut(slot).and_then(Option::take) {
            self.by_stamp.remove(&stamp);
        }
    }

    fn victim(&self) -> Option<usize> {
        self.by_stamp.first_key_value().map(|(_, &slot)| slot)
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<BoneCache>,
}

/// Owns bone cache entries under a shared byte budget
#[derive(Debug)]
pub struct BoneCacheManager<P: EvictionPolicy = LruPolicy> {
    slots: Vec<Slot>,
    free: Vec<usize>,
    policy: P,
    budget_bytes: usize,
    used_bytes: usize,
}

impl Default for BoneCacheManager<LruPolicy> {
    fn default() -> Self {
        Self::new(16 * 1024)
    }
}

impl<P: EvictionPolicy> BoneCacheManager<P> {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            policy: P::default(),
            budget_bytes,
            used_bytes: 0,
        }
    }

    /// Build a cache entry, evicting old entries if it would not fit
    pub fn create_resource(
        &mut self,
        skeleton: &Skeleton,
        world: &[Affine3A],
        mask: BoneMask,
        time: f32,
    ) -> CacheHandle {
        let cache = BoneCache::new(skeleton, world, mask, time);
        let size = cache.size_bytes();

        while self.used_bytes + size > self.budget_bytes {
            let Some(victim) = self.policy.victim() else {
                break;
            };
            log::debug!("Evicting bone cache slot {}", victim);
            self.release_slot(victim);
        }

        let index = self.free.pop().unwrap_or_else(|| {
            self.slots.push(Slot::default());
            self.slots.len() - 1
        });
        let slot = &mut self.slots[index];
        slot.entry = Some(cache);
        self.used_bytes += size;
        self.policy.touch(index);

        CacheHandle {
            index: index as u32,
            generation: slot.generation,
        }
    }

    fn slot_index(&self, handle: CacheHandle) -> Option<usize> {
        let index = handle.index as usize;
        let slot = self.slots.get(index)?;
        (slot.generation == handle.generation && slot.entry.is_some()).then_some(index)
    }

    fn release_slot(&mut self, index: usize) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if let Some(entry) = slot.entry.take() {
            self.used_bytes -= entry.size_bytes();
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index);
        }
        self.policy.remove(index);
    }

    /// Entry regardless of freshness
    pub fn get_resource(&mut self, handle: CacheHandle) -> Option<&BoneCache> {
        let index = self.slot_index(handle)?;
        self.policy.touch(index);
        self.slots[index].entry.as_ref()
    }

    pub fn get_resource_mut(&mut self, handle: CacheHandle) -> Option<&mut BoneCache> {
        let index = self.slot_index(handle)?;
        self.policy.touch(index);
        self.slots[index].entry.as_mut()
    }

    /// Entry only while it is still fresh at `time`
    pub fn get_valid(
        &mut self,
        handle: CacheHandle,
        time: f32,
        max_drift: f32,
    ) -> Option<&BoneCache> {
        self.get_resource(handle)
            .filter(|cache| cache.is_valid(time, max_drift))
    }

    pub fn invalidate_resource(&mut self, handle: CacheHandle) {
        if let Some(cache) = self.get_resource_mut(handle) {
            cache.invalidate();
        }
    }

    pub fn destroy_resource(&mut self, handle: CacheHandle) {
        if let Some(index) = self.slot_index(handle) {
            self.release_slot(index);
        }
    }

    pub fn is_alive(&self, handle: CacheHandle) -> bool {
        self.slot_index(handle).is_some()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }
}
