//! Fixed-size slot pools for index nodes.
//!
//! Each node kind lives in its own pool. A pool hands out [`SlotId`]s instead
//! of pointers:
//! - Slots are grouped in fixed-capacity segments, so a handle is just an index.
//! - Every slot carries a generation that is bumped on free; resolving a handle
//!   checks it, so a stale handle cannot silently alias a reused slot.
//! - Vacuum marks sparse segments, relocates their live slots elsewhere and
//!   then releases the segments' memory.

use std::mem;

use tracing::warn;

use crate::error::{ArtError, Result};

/// A 64-bit reference to a slot in a [`FixedSizeAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    /// Flat slot index across all segments of the owning pool.
    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

struct Segment<T> {
    slots: Vec<Slot<T>>,
    /// Offsets of freed slots within `slots`.
    free: Vec<u32>,
    live: usize,
    vacuum: bool,
    /// Generation assigned to slots when a released segment is reused.
    generation_floor: u32,
}

impl<T> Segment<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            vacuum: false,
            generation_floor: 0,
        }
    }

    fn has_room(&self, capacity: usize) -> bool {
        !self.free.is_empty() || self.slots.len() < capacity
    }

    fn release(&mut self) {
        debug_assert_eq!(self.live, 0, "releasing a segment with live slots");
        let max_generation = self
            .slots
            .iter()
            .map(|s| s.generation)
            .max()
            .unwrap_or(self.generation_floor);
        self.generation_floor = max_generation.wrapping_add(1);
        self.slots = Vec::new();
        self.free = Vec::new();
        self.vacuum = false;
    }
}

/// A pool of equally sized values addressed by [`SlotId`].
pub struct FixedSizeAllocator<T> {
    kind: &'static str,
    segments: Vec<Segment<T>>,
    slots_per_segment: usize,
    max_segments: Option<usize>,
    /// Segment that most recently had room; allocation starts searching here.
    cursor: usize,
    live: usize,
}

impl<T> FixedSizeAllocator<T> {
    /// Create an empty pool. `kind` names the pool in errors and logs.
    pub fn new(kind: &'static str, slots_per_segment: usize, max_segments: Option<usize>) -> Self {
        assert!(slots_per_segment > 0, "segments must hold at least one slot");
        assert!(
            slots_per_segment <= u32::MAX as usize,
            "segment size exceeds the slot index range"
        );
        Self {
            kind,
            segments: Vec::new(),
            slots_per_segment,
            max_segments,
            cursor: 0,
            live: 0,
        }
    }

    /// Move `value` into a free slot.
    pub fn allocate(&mut self, value: T) -> Result<SlotId> {
        let slot = self.reserve()?;
        self.place(slot, value);
        Ok(slot)
    }

    /// Claim an empty slot outside of any segment marked for vacuum.
    fn reserve(&mut self) -> Result<SlotId> {
        let capacity = self.slots_per_segment;
        let segment_idx = match self.find_segment_with_room() {
            Some(idx) => idx,
            None => self.add_segment()?,
        };
        self.cursor = segment_idx;

        let segment = &mut self.segments[segment_idx];
        let offset = match segment.free.pop() {
            Some(offset) => offset as usize,
            None => {
                segment.slots.push(Slot {
                    generation: segment.generation_floor,
                    value: None,
                });
                segment.slots.len() - 1
            }
        };
        segment.live += 1;
        let generation = segment.slots[offset].generation;
        self.live += 1;

        let index = segment_idx * capacity + offset;
        Ok(SlotId {
            index: u32::try_from(index).map_err(|_| self.exhausted())?,
            generation,
        })
    }

    fn place(&mut self, slot: SlotId, value: T) {
        let entry = self.slot_mut(slot);
        debug_assert!(entry.value.is_none(), "placing into an occupied slot");
        entry.value = Some(value);
    }

    fn find_segment_with_room(&self) -> Option<usize> {
        let capacity = self.slots_per_segment;
        let n = self.segments.len();
        (0..n)
            .map(|i| (self.cursor + i) % n)
            .find(|&i| !self.segments[i].vacuum && self.segments[i].has_room(capacity))
    }

    fn add_segment(&mut self) -> Result<usize> {
        // Released segments are reused before the pool grows.
        if let Some(idx) = self
            .segments
            .iter()
            .position(|s| !s.vacuum && s.slots.capacity() == 0 && s.live == 0)
        {
            self.segments[idx].slots.reserve_exact(self.slots_per_segment);
            return Ok(idx);
        }
        if let Some(max) = self.max_segments {
            if self.segments.len() >= max {
                return Err(self.exhausted());
            }
        }
        let mut segment = Segment::new();
        segment.slots.reserve_exact(self.slots_per_segment);
        self.segments.push(segment);
        Ok(self.segments.len() - 1)
    }

    fn exhausted(&self) -> ArtError {
        ArtError::AllocatorExhausted {
            kind: self.kind,
            segments: self.segments.len(),
            slots_per_segment: self.slots_per_segment,
        }
    }

    #[inline]
    fn locate(&self, slot: SlotId) -> (usize, usize) {
        (
            slot.index() / self.slots_per_segment,
            slot.index() % self.slots_per_segment,
        )
    }

    fn slot_ref(&self, slot: SlotId) -> &Slot<T> {
        let (segment, offset) = self.locate(slot);
        let entry = self
            .segments
            .get(segment)
            .and_then(|s| s.slots.get(offset))
            .filter(|e| e.generation == slot.generation);
        match entry {
            Some(entry) => entry,
            None => panic!("stale {} handle {:?}", self.kind, slot),
        }
    }

    fn slot_mut(&mut self, slot: SlotId) -> &mut Slot<T> {
        let kind = self.kind;
        let (segment, offset) = self.locate(slot);
        let entry = self
            .segments
            .get_mut(segment)
            .and_then(|s| s.slots.get_mut(offset))
            .filter(|e| e.generation == slot.generation);
        match entry {
            Some(entry) => entry,
            None => panic!("stale {} handle {:?}", kind, slot),
        }
    }

    /// Resolve a handle.
    ///
    /// # Panics
    /// Panics if the handle was freed or relocated.
    pub fn get(&self, slot: SlotId) -> &T {
        match &self.slot_ref(slot).value {
            Some(value) => value,
            None => panic!("{} slot {:?} is vacant", self.kind, slot),
        }
    }

    /// Resolve a handle for mutation.
    ///
    /// # Panics
    /// Panics if the handle was freed or relocated.
    pub fn get_mut(&mut self, slot: SlotId) -> &mut T {
        let kind = self.kind;
        match &mut self.slot_mut(slot).value {
            Some(value) => value,
            None => panic!("{} slot {:?} is vacant", kind, slot),
        }
    }

    /// Whether `slot` is still a live handle into this pool.
    pub fn contains(&self, slot: SlotId) -> bool {
        let (segment, offset) = self.locate(slot);
        self.segments
            .get(segment)
            .and_then(|s| s.slots.get(offset))
            .is_some_and(|e| e.generation == slot.generation && e.value.is_some())
    }

    /// Free a slot, returning its value. The handle becomes stale.
    pub fn free(&mut self, slot: SlotId) -> T {
        let (segment_idx, offset) = self.locate(slot);
        let entry = self.slot_mut(slot);
        let value = match entry.value.take() {
            Some(value) => value,
            None => panic!("double free of slot {:?}", slot),
        };
        entry.generation = entry.generation.wrapping_add(1);

        let segment = &mut self.segments[segment_idx];
        segment.free.push(offset as u32);
        segment.live -= 1;
        self.live -= 1;
        value
    }

    /// Mark segments whose live fraction is below `threshold` for vacuum.
    ///
    /// Returns whether any segment was marked. While marked, no allocation
    /// lands in those segments.
    pub fn init_vacuum(&mut self, threshold: f64) -> bool {
        let capacity = self.slots_per_segment as f64;
        let mut marked = false;
        for segment in &mut self.segments {
            if segment.slots.capacity() > 0 && (segment.live as f64) < threshold * capacity {
                segment.vacuum = true;
                marked = true;
            }
        }
        // Relocating the only sparse segment into a brand new one gains nothing.
        if marked && self.segments.len() == 1 && self.segments[0].live > 0 {
            self.segments[0].vacuum = false;
            marked = false;
        }
        marked
    }

    /// Whether the slot lives in a segment marked for vacuum.
    #[inline]
    pub fn needs_vacuum(&self, slot: SlotId) -> bool {
        let (segment, _) = self.locate(slot);
        self.segments.get(segment).is_some_and(|s| s.vacuum)
    }

    /// Move a value out of a vacuum segment. The old handle becomes stale.
    pub fn relocate(&mut self, slot: SlotId) -> Result<SlotId> {
        debug_assert!(self.needs_vacuum(slot));
        let target = self.reserve()?;
        let value = self.free(slot);
        self.place(target, value);
        Ok(target)
    }

    /// Release the memory of vacuumed segments. Returns how many were released.
    pub fn finalize_vacuum(&mut self) -> usize {
        let mut released = 0;
        for segment in &mut self.segments {
            if !segment.vacuum {
                continue;
            }
            if segment.live == 0 {
                segment.release();
                released += 1;
            } else {
                // The pass stopped early or missed a handle; keep the memory.
                warn!(kind = self.kind, live = segment.live, "vacuum left live slots behind");
                segment.vacuum = false;
            }
        }
        self.cursor = 0;
        released
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of segments currently holding memory.
    pub fn segment_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.slots.capacity() > 0)
            .count()
    }

    /// Bytes reserved by this pool.
    pub fn memory_usage(&self) -> usize {
        self.segments
            .iter()
            .map(|s| s.slots.capacity() * mem::size_of::<Slot<T>>() + s.free.capacity() * 4)
            .sum()
    }

    /// Drop every value and segment.
    pub fn reset(&mut self) {
        self.segments.clear();
        self.cursor = 0;
        self.live = 0;
    }
}
