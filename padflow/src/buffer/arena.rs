// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Slab-backed buffer arena with explicit reference and pin counts.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use slab::Slab;

use crate::buffer::meta::{BufferFlags, ChannelMask, RoiMeta};

/// One block of media memory. Cloning shares the block, it never copies.
pub type Memory = Bytes;

/// Identity of a buffer slot, stable for the slot's lifetime.
///
/// Slot keys are recycled by the arena; the serial tells two generations of
/// the same key apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    key: usize,
    serial: u64,
}

struct Slot {
    serial: u64,
    refs: usize,
    pins: usize,
    memories: Vec<Memory>,
    pts: Option<Duration>,
    dts: Option<Duration>,
    duration: Option<Duration>,
    flags: BufferFlags,
    channel_mask: Option<ChannelMask>,
    rois: Vec<RoiMeta>,
    parents: Vec<usize>,
}

impl Slot {
    fn new(serial: u64, memories: Vec<Memory>) -> Self {
        Slot {
            serial,
            refs: 1,
            pins: 0,
            memories,
            pts: None,
            dts: None,
            duration: None,
            flags: BufferFlags::default(),
            channel_mask: None,
            rois: Vec::new(),
            parents: Vec::new(),
        }
    }
}

#[derive(Default)]
struct ArenaInner {
    slots: Slab<Slot>,
    next_serial: u64,
}

impl ArenaInner {
    fn insert(&mut self, memories: Vec<Memory>) -> (usize, u64) {
        let serial = self.next_serial;
        self.next_serial += 1;
        (self.slots.insert(Slot::new(serial, memories)), serial)
    }

    /// Drops one owning reference and finalizes every slot that became
    /// unreachable. Finalized slots are handed back so their memory is
    /// released outside the arena lock.
    fn unref(&mut self, key: usize) -> Vec<Slot> {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.refs = slot.refs.saturating_sub(1);
        }
        self.collect(key)
    }

    fn collect(&mut self, key: usize) -> Vec<Slot> {
        let mut finalized = Vec::new();
        let mut pending = vec![key];
        while let Some(key) = pending.pop() {
            let unreachable = self
                .slots
                .get(key)
                .is_some_and(|slot| slot.refs == 0 && slot.pins == 0);
            if !unreachable {
                continue;
            }
            let mut slot = self.slots.remove(key);
            for parent in slot.parents.drain(..) {
                if let Some(parent_slot) = self.slots.get_mut(parent) {
                    parent_slot.pins = parent_slot.pins.saturating_sub(1);
                    pending.push(parent);
                }
            }
            finalized.push(slot);
        }
        finalized
    }
}

/// Owner of every buffer slot of a pipeline branch.
///
/// The arena is cheaply cloneable; all clones share the same slots.
#[derive(Clone, Default)]
pub struct BufferArena {
    inner: Arc<Mutex<ArenaInner>>,
}

impl BufferArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a buffer owning the given memory blocks.
    pub fn allocate(&self, memories: Vec<Memory>) -> Buffer {
        let (key, serial) = self.inner.lock().insert(memories);
        Buffer {
            arena: self.inner.clone(),
            key,
            serial,
        }
    }

    /// Allocates a buffer without memory, e.g. as a composite container.
    pub fn allocate_empty(&self) -> Buffer {
        self.allocate(Vec::new())
    }

    /// Allocates a single-block buffer holding `data`.
    pub fn from_vec(&self, data: Vec<u8>) -> Buffer {
        self.allocate(vec![Bytes::from(data)])
    }

    /// Allocates a single-block buffer holding a copy of `data`.
    pub fn copy_from_slice(&self, data: &[u8]) -> Buffer {
        self.allocate(vec![Bytes::copy_from_slice(data)])
    }

    /// Number of slots not finalized yet.
    pub fn live_count(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// True while the slot identified by `id` has not been finalized.
    pub fn contains(&self, id: BufferId) -> bool {
        self.inner
            .lock()
            .slots
            .get(id.key)
            .is_some_and(|slot| slot.serial == id.serial)
    }
}

impl fmt::Debug for BufferArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferArena")
            .field("live", &self.live_count())
            .finish()
    }
}

/// Owning handle to a buffer slot.
///
/// Cloning adds a reference, dropping removes one. A slot is finalized once
/// no handle refers to it and no composite buffer pins it.
///
/// Metadata setters act on the shared slot: every handle of the same buffer
/// observes the change.
pub struct Buffer {
    arena: Arc<Mutex<ArenaInner>>,
    key: usize,
    serial: u64,
}

impl Buffer {
    fn with_slot<R>(&self, f: impl FnOnce(&Slot) -> R) -> R {
        let inner = self.arena.lock();
        f(&inner.slots[self.key])
    }

    fn with_slot_mut<R>(&self, f: impl FnOnce(&mut Slot) -> R) -> R {
        let mut inner = self.arena.lock();
        f(&mut inner.slots[self.key])
    }

    /// Identity of the underlying slot.
    pub fn id(&self) -> BufferId {
        BufferId {
            key: self.key,
            serial: self.serial,
        }
    }

    /// Arena this buffer lives in.
    pub fn arena(&self) -> BufferArena {
        BufferArena {
            inner: self.arena.clone(),
        }
    }

    /// True when both handles refer to the same slot.
    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.arena, &other.arena) && self.key == other.key
    }

    /// Number of owning handles.
    pub fn ref_count(&self) -> usize {
        self.with_slot(|slot| slot.refs)
    }

    /// Number of composite buffers pinning this one.
    pub fn pin_count(&self) -> usize {
        self.with_slot(|slot| slot.pins)
    }

    /// True for the sole owning handle.
    pub fn is_writable(&self) -> bool {
        self.ref_count() == 1
    }

    /// Presentation timestamp.
    pub fn pts(&self) -> Option<Duration> {
        self.with_slot(|slot| slot.pts)
    }

    /// Sets the presentation timestamp.
    pub fn set_pts(&self, pts: Option<Duration>) {
        self.with_slot_mut(|slot| slot.pts = pts)
    }

    /// Decode timestamp.
    pub fn dts(&self) -> Option<Duration> {
        self.with_slot(|slot| slot.dts)
    }

    /// Sets the decode timestamp.
    pub fn set_dts(&self, dts: Option<Duration>) {
        self.with_slot_mut(|slot| slot.dts = dts)
    }

    /// Duration.
    pub fn duration(&self) -> Option<Duration> {
        self.with_slot(|slot| slot.duration)
    }

    /// Sets the duration.
    pub fn set_duration(&self, duration: Option<Duration>) {
        self.with_slot_mut(|slot| slot.duration = duration)
    }

    /// Flags.
    pub fn flags(&self) -> BufferFlags {
        self.with_slot(|slot| slot.flags)
    }

    /// Sets the flags.
    pub fn set_flags(&self, flags: BufferFlags) {
        self.with_slot_mut(|slot| slot.flags = flags)
    }

    /// Copies timestamps and flags from `src`.
    pub fn copy_metadata_from(&self, src: &Buffer) {
        let (pts, dts, duration, flags) =
            src.with_slot(|slot| (slot.pts, slot.dts, slot.duration, slot.flags));
        self.with_slot_mut(|slot| {
            slot.pts = pts;
            slot.dts = dts;
            slot.duration = duration;
            slot.flags = flags;
        })
    }

    /// Number of memory blocks.
    pub fn n_memory(&self) -> usize {
        self.with_slot(|slot| slot.memories.len())
    }

    /// Memory block at `idx`.
    pub fn memory(&self, idx: usize) -> Option<Memory> {
        self.with_slot(|slot| slot.memories.get(idx).cloned())
    }

    /// All memory blocks.
    pub fn memories(&self) -> Vec<Memory> {
        self.with_slot(|slot| slot.memories.clone())
    }

    /// Total size of all memory blocks.
    pub fn size(&self) -> usize {
        self.with_slot(|slot| slot.memories.iter().map(Bytes::len).sum())
    }

    /// Appends a memory block.
    pub fn append_memory(&self, memory: Memory) {
        self.with_slot_mut(|slot| slot.memories.push(memory))
    }

    /// Moves every memory block out of this buffer.
    pub fn take_memories(&self) -> Vec<Memory> {
        self.with_slot_mut(|slot| std::mem::take(&mut slot.memories))
    }

    /// All memory as one contiguous block. Single-block buffers are shared,
    /// multi-block buffers are merged into a new block.
    pub fn contiguous(&self) -> Memory {
        self.with_slot(|slot| match slot.memories.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            blocks => {
                let mut merged = BytesMut::with_capacity(blocks.iter().map(Bytes::len).sum());
                for block in blocks {
                    merged.extend_from_slice(block);
                }
                merged.freeze()
            }
        })
    }

    /// Channel bitmask of a composite buffer.
    pub fn channel_mask(&self) -> Option<ChannelMask> {
        self.with_slot(|slot| slot.channel_mask)
    }

    /// Sets the channel bitmask.
    pub fn set_channel_mask(&self, mask: ChannelMask) {
        self.with_slot_mut(|slot| slot.channel_mask = Some(mask))
    }

    /// Region-of-interest metadata.
    pub fn rois(&self) -> Vec<RoiMeta> {
        self.with_slot(|slot| slot.rois.clone())
    }

    /// Attaches a region of interest.
    pub fn add_roi(&self, roi: RoiMeta) {
        self.with_slot_mut(|slot| slot.rois.push(roi))
    }

    /// Pins `parent` for as long as this buffer's slot lives.
    ///
    /// The pin keeps the parent slot (and its metadata) alive without
    /// granting ownership: no handle is created and the parent's reference
    /// count is left alone.
    ///
    /// Returns `false`, without pinning, when `parent` lives in another arena.
    pub fn add_parent(&self, parent: &Buffer) -> bool {
        if !Arc::ptr_eq(&self.arena, &parent.arena) {
            return false;
        }
        let mut inner = self.arena.lock();
        inner.slots[parent.key].pins += 1;
        inner.slots[self.key].parents.push(parent.key);
        true
    }

    /// Slots pinned by this buffer.
    pub fn parents(&self) -> Vec<BufferId> {
        let inner = self.arena.lock();
        inner.slots[self.key]
            .parents
            .iter()
            .map(|&key| BufferId {
                key,
                serial: inner.slots[key].serial,
            })
            .collect()
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        self.with_slot_mut(|slot| slot.refs += 1);
        Buffer {
            arena: self.arena.clone(),
            key: self.key,
            serial: self.serial,
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let finalized = self.arena.lock().unref(self.key);
        drop(finalized);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (pts, duration, memories) =
            self.with_slot(|slot| (slot.pts, slot.duration, slot.memories.len()));
        f.debug_struct("Buffer")
            .field("key", &self.key)
            .field("pts", &pts)
            .field("duration", &duration)
            .field("memories", &memories)
            .finish()
    }
}
