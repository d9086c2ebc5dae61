/// `scripting/arena.rs` — Buffers visible to script handles
///
/// Script handles never hold pointers. They hold a `BufferKey` (slot index +
/// generation) and byte offsets. Every slot is allocated once at its full
/// capacity; binding new content bumps the generation, so a handle that
/// outlives its callback fails with `StaleHandle` instead of reading reused
/// memory. Stash slots are a fixed pool behind the three per-call slots,
/// leased to script objects and returned when the lease is dropped.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::BindingError;
use crate::forge::ForgeCursor;

/// Incoming event sequence of the current callback.
pub const INPUT: usize = 0;
/// Outgoing event sequence of the current callback.
pub const OUTPUT: usize = 1;
/// Transient atoms passed to `stash`/`apply`/`save`/`restore`.
pub const SCRATCH: usize = 2;
/// First of the leased stash slots.
const FIRST_STASH: usize = SCRATCH + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferKey {
    slot: u32,
    generation: u32,
}

impl BufferKey {
    /// A key that names no slot; every access through it is stale.
    pub const fn detached() -> Self {
        Self {
            slot: u32::MAX,
            generation: 0,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot as usize
    }
}

/// Claim on one stash slot. Dropping it hands the slot back; the arena
/// invalidates the slot's handles on its next sweep.
#[derive(Debug)]
pub struct Lease {
    leased: Arc<[AtomicBool]>,
    index: usize,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.leased[self.index].store(false, Ordering::Release);
    }
}

struct Slot {
    bytes: Vec<u8>,
    /// Usable length of `bytes` for the current binding.
    active: usize,
    /// Bytes filled by a copy; forge-written slots use the cursor instead.
    filled: usize,
    generation: u32,
    live: bool,
    cursor: ForgeCursor,
}

impl Slot {
    fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0; capacity],
            active: 0,
            filled: 0,
            generation: 0,
            live: false,
            cursor: ForgeCursor::new(),
        }
    }

    fn rebind(&mut self, active: usize) {
        self.generation = self.generation.wrapping_add(1);
        self.active = active.min(self.bytes.len());
        self.filled = 0;
        self.live = true;
        self.cursor.reset();
    }

    fn readable(&self) -> &[u8] {
        let end = self.filled.max(self.cursor.offset()).min(self.active);
        &self.bytes[..end]
    }
}

pub struct BufferArena {
    slots: Vec<Slot>,
    /// One flag per stash slot, set while a `Lease` holds it.
    leased: Arc<[AtomicBool]>,
}

impl BufferArena {
    /// Allocates the per-call slots and `stash_slots` stash slots, the
    /// scratch and stash slots holding `stash_capacity` bytes each.
    pub fn new(event_capacity: usize, stash_capacity: usize, stash_slots: usize) -> Self {
        let mut slots = Vec::with_capacity(FIRST_STASH + stash_slots);
        slots.push(Slot::new(event_capacity));
        slots.push(Slot::new(event_capacity));
        slots.push(Slot::new(stash_capacity));
        slots.extend((0..stash_slots).map(|_| Slot::new(stash_capacity)));
        Self {
            slots,
            leased: (0..stash_slots).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    fn key(&self, slot: usize) -> BufferKey {
        BufferKey {
            slot: slot as u32,
            generation: self.slots[slot].generation,
        }
    }

    fn slot(&self, key: BufferKey) -> Result<&Slot, BindingError> {
        match self.slots.get(key.slot()) {
            Some(s) if s.live && s.generation == key.generation => Ok(s),
            _ => Err(BindingError::StaleHandle),
        }
    }

    fn slot_mut(&mut self, key: BufferKey) -> Result<&mut Slot, BindingError> {
        match self.slots.get_mut(key.slot()) {
            Some(s) if s.live && s.generation == key.generation => Ok(s),
            _ => Err(BindingError::StaleHandle),
        }
    }

    pub fn capacity(&self, slot: usize) -> usize {
        self.slots.get(slot).map_or(0, |s| s.bytes.len())
    }

    /// Copies `bytes` into `slot` for reading.
    pub fn bind_copy(&mut self, slot: usize, bytes: &[u8]) -> Result<BufferKey, BindingError> {
        let s = self.slots.get_mut(slot).ok_or(BindingError::StaleHandle)?;
        if bytes.len() > s.bytes.len() {
            return Err(BindingError::Capacity(bytes.len()));
        }
        s.rebind(bytes.len());
        s.bytes[..bytes.len()].copy_from_slice(bytes);
        s.filled = bytes.len();
        Ok(self.key(slot))
    }

    /// Prepares `slot` as a forge destination of up to `len` bytes.
    pub fn bind_output(&mut self, slot: usize, len: usize) -> Result<BufferKey, BindingError> {
        let s = self.slots.get_mut(slot).ok_or(BindingError::StaleHandle)?;
        s.rebind(len);
        Ok(self.key(slot))
    }

    /// Invalidates every handle into `slot`.
    pub fn release(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            s.generation = s.generation.wrapping_add(1);
            s.live = false;
        }
    }

    pub fn bytes(&self, key: BufferKey) -> Result<&[u8], BindingError> {
        Ok(self.slot(key)?.readable())
    }

    /// Destination bytes and cursor for a forge.
    pub fn forge_parts(&mut self, key: BufferKey) -> Result<(&mut [u8], &mut ForgeCursor), BindingError> {
        let s = self.slot_mut(key)?;
        let active = s.active;
        Ok((&mut s.bytes[..active], &mut s.cursor))
    }

    /// Reads from `src` while writing to `dst`; the slots must differ.
    pub fn split(
        &mut self,
        src: BufferKey,
        dst: BufferKey,
    ) -> Result<(&[u8], &mut [u8], &mut ForgeCursor), BindingError> {
        self.slot(src)?;
        self.slot(dst)?;
        let (a, b) = (src.slot(), dst.slot());
        if a == b {
            return Err(BindingError::StaleHandle);
        }
        let (read, write) = if a < b {
            let (lo, hi) = self.slots.split_at_mut(b);
            (&lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.slots.split_at_mut(a);
            (&hi[0], &mut lo[b])
        };
        let active = write.active;
        Ok((read.readable(), &mut write.bytes[..active], &mut write.cursor))
    }

    /// Leases a free stash slot, rebound and empty.
    pub fn alloc_owned(&mut self) -> Result<(BufferKey, Lease), BindingError> {
        let index = self
            .leased
            .iter()
            .position(|flag| {
                flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
            .ok_or(BindingError::StashSlots(self.leased.len()))?;
        let slot = FIRST_STASH + index;
        let s = &mut self.slots[slot];
        let capacity = s.bytes.len();
        s.rebind(capacity);
        let lease = Lease {
            leased: Arc::clone(&self.leased),
            index,
        };
        Ok((self.key(slot), lease))
    }

    /// Stash slots currently leased.
    pub fn leased(&self) -> usize {
        self.leased.iter().filter(|f| f.load(Ordering::Acquire)).count()
    }

    /// Invalidates stash slots whose lease was dropped.
    pub fn sweep(&mut self) {
        for (flag, s) in self.leased.iter().zip(self.slots.iter_mut().skip(FIRST_STASH)) {
            if s.live && !flag.load(Ordering::Acquire) {
                s.generation = s.generation.wrapping_add(1);
                s.live = false;
            }
        }
    }

    /// Resets the forge cursor of an owned slot so it can be rewritten.
    pub fn rewind(&mut self, key: BufferKey) -> Result<(), BindingError> {
        let s = self.slot_mut(key)?;
        s.cursor.reset();
        s.filled = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebinding_makes_old_keys_stale() {
        let mut arena = BufferArena::new(64, 32, 0);
        let first = arena.bind_copy(INPUT, &[1, 2, 3]).unwrap();
        assert_eq!(arena.bytes(first).unwrap(), &[1, 2, 3]);
        let second = arena.bind_copy(INPUT, &[4]).unwrap();
        assert!(matches!(arena.bytes(first), Err(BindingError::StaleHandle)));
        assert_eq!(arena.bytes(second).unwrap(), &[4]);
        arena.release(INPUT);
        assert!(arena.bytes(second).is_err());
    }

    #[test]
    fn oversize_input_is_rejected() {
        let mut arena = BufferArena::new(4, 4, 0);
        assert!(matches!(arena.bind_copy(INPUT, &[0; 5]), Err(BindingError::Capacity(5))));
    }

    #[test]
    fn output_is_limited_to_requested_length() {
        let mut arena = BufferArena::new(64, 32, 0);
        let key = arena.bind_output(OUTPUT, 16).unwrap();
        let (buf, cursor) = arena.forge_parts(key).unwrap();
        assert_eq!(buf.len(), 16);
        assert_eq!(cursor.offset(), 0);
        let key = arena.bind_output(OUTPUT, 1000).unwrap();
        assert_eq!(arena.forge_parts(key).unwrap().0.len(), 64);
    }

    #[test]
    fn split_borrows_two_slots() {
        let mut arena = BufferArena::new(64, 32, 0);
        let src = arena.bind_copy(INPUT, &[9; 8]).unwrap();
        let dst = arena.bind_output(OUTPUT, 64).unwrap();
        let (read, write, _) = arena.split(src, dst).unwrap();
        write[..8].copy_from_slice(read);
        assert!(arena.split(dst, dst).is_err());
    }

    #[test]
    fn owned_slots_are_swept_and_reused() {
        let mut arena = BufferArena::new(8, 16, 2);
        let (key, lease) = arena.alloc_owned().unwrap();
        assert_eq!(arena.capacity(key.slot()), 16);
        assert!(arena.bytes(key).is_ok());
        drop(lease);
        assert_eq!(arena.leased(), 0);
        arena.sweep();
        assert!(arena.bytes(key).is_err());
        let (again, _lease) = arena.alloc_owned().unwrap();
        assert_eq!(again.slot(), key.slot());
        assert!(arena.bytes(again).is_ok());
    }

    #[test]
    fn stash_pool_is_fixed() {
        let mut arena = BufferArena::new(8, 16, 2);
        let _a = arena.alloc_owned().unwrap();
        let _b = arena.alloc_owned().unwrap();
        assert!(matches!(arena.alloc_owned(), Err(BindingError::StashSlots(2))));
        assert_eq!(arena.leased(), 2);
        assert!(arena.bytes(BufferKey::detached()).is_err());
    }
}
