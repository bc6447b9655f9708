// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Seqlock status mailbox: one writer, many readers, bounded-stale reads
// acceptable, readers never block.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::spin_lock::adaptive_yield_pub;

/// Number of rotating slots.
pub const MBX_SLOTS: usize = 4;

#[repr(C)]
struct MbxSlot<T> {
    seq: AtomicU32,
    overflow: AtomicU32,
    payload: UnsafeCell<T>,
}

/// Header + rotating slot array stored in caller-owned (possibly shared)
/// memory — the `MBX section` of §6's shared-memory layout.
#[repr(C)]
struct MbxHeader {
    index: AtomicI32,
}

/// A bounded-slot writer-wins mailbox. `T` must be `Copy` so a slot can be
/// read via a single non-atomic memcpy bracketed by the seqlock.
pub struct Mbx<T: Copy> {
    header: *mut MbxHeader,
    slots: *mut MbxSlot<T>,
}

unsafe impl<T: Copy> Send for Mbx<T> {}
unsafe impl<T: Copy> Sync for Mbx<T> {}

/// A composite version stamp: `(overflow << 32) | seq`. Monotonic for the
/// lifetime of one slot's occupancy of the mailbox's rotation.
pub type MbxVersion = u64;

impl<T: Copy> Mbx<T> {
    pub fn storage_size() -> usize {
        std::mem::size_of::<MbxHeader>() + std::mem::size_of::<MbxSlot<T>>() * MBX_SLOTS
    }

    /// # Safety
    /// `base` must point to at least [`Mbx::storage_size`] bytes of valid,
    /// writable memory outliving `self`. Pass `init = true` exactly once per
    /// fresh allocation (the first opener); later attaches pass `false`.
    pub unsafe fn from_raw(base: *mut u8, init: bool) -> Self {
        let header = base as *mut MbxHeader;
        let slots = base.add(std::mem::size_of::<MbxHeader>()) as *mut MbxSlot<T>;
        if init {
            (*header).index.store(-1, Ordering::Relaxed);
            for i in 0..MBX_SLOTS {
                let s = &*slots.add(i);
                s.seq.store(0, Ordering::Relaxed);
                s.overflow.store(0, Ordering::Relaxed);
            }
        }
        Self { header, slots }
    }

    fn header(&self) -> &MbxHeader {
        unsafe { &*self.header }
    }

    fn slot(&self, i: usize) -> &MbxSlot<T> {
        unsafe { &*self.slots.add(i) }
    }

    /// Publish `payload` into the next rotating slot.
    pub fn write(&self, payload: T) {
        let last = self.header().index.load(Ordering::Relaxed);
        let i = if last < 0 { 0 } else { (last as usize + 1) % MBX_SLOTS };
        let slot = self.slot(i);

        // A crashed writer can leave seq odd (torn). Nudge it even before
        // starting a fresh write so the invariant "even seq => stable" holds.
        if slot.seq.load(Ordering::Relaxed) % 2 == 1 {
            slot.seq.fetch_add(1, Ordering::AcqRel);
        }

        slot.seq.fetch_add(1, Ordering::AcqRel); // now odd: write in progress
        unsafe {
            *slot.payload.get() = payload;
        }
        let prev = slot.seq.fetch_add(1, Ordering::Release); // now even
        if prev == u32::MAX {
            slot.overflow.fetch_add(1, Ordering::Relaxed);
        }
        self.header().index.store(i as i32, Ordering::Release);
    }

    /// Read the most recently published payload, retrying until a torn
    /// read is avoided. Returns `None` if nothing has ever been published.
    pub fn read(&self) -> Option<(T, MbxVersion)> {
        let last = self.header().index.load(Ordering::Acquire);
        if last < 0 {
            return None;
        }
        let slot = self.slot(last as usize);
        let mut k = 0u32;
        loop {
            let seq1 = slot.seq.load(Ordering::Acquire);
            if seq1 % 2 == 1 {
                adaptive_yield_pub(&mut k);
                continue;
            }
            let of1 = slot.overflow.load(Ordering::Acquire);
            let payload = unsafe { *slot.payload.get() };
            let seq2 = slot.seq.load(Ordering::Acquire);
            let of2 = slot.overflow.load(Ordering::Acquire);
            if seq1 == seq2 && of1 == of2 {
                let version = ((of1 as u64) << 32) | seq1 as u64;
                return Some((payload, version));
            }
            adaptive_yield_pub(&mut k);
        }
    }

    /// Reset to the empty state. Only safe with no concurrent writer.
    pub fn reset(&self) {
        self.header().index.store(-1, Ordering::Relaxed);
        for i in 0..MBX_SLOTS {
            let s = self.slot(i);
            s.seq.store(0, Ordering::Relaxed);
            s.overflow.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Status {
        fill: u32,
        tstamp: u64,
    }

    fn make_mbx() -> (Vec<u8>, Mbx<Status>) {
        let mut buf = vec![0u8; Mbx::<Status>::storage_size()];
        let mbx = unsafe { Mbx::from_raw(buf.as_mut_ptr(), true) };
        (buf, mbx)
    }

    #[test]
    fn empty_mailbox_reads_none() {
        let (_buf, m) = make_mbx();
        assert!(m.read().is_none());
    }

    #[test]
    fn read_reflects_last_write() {
        let (_buf, m) = make_mbx();
        m.write(Status { fill: 1, tstamp: 100 });
        m.write(Status { fill: 2, tstamp: 200 });
        let (got, _v) = m.read().unwrap();
        assert_eq!(got, Status { fill: 2, tstamp: 200 });
    }

    #[test]
    fn version_is_stable_across_repeated_reads_of_same_publication() {
        let (_buf, m) = make_mbx();
        m.write(Status { fill: 1, tstamp: 100 });
        let (_, v1) = m.read().unwrap();
        let (_, v2) = m.read().unwrap();
        assert_eq!(v1, v2);
    }

    #[test]
    fn version_changes_across_publications() {
        let (_buf, m) = make_mbx();
        m.write(Status { fill: 1, tstamp: 100 });
        let (_, v1) = m.read().unwrap();
        m.write(Status { fill: 2, tstamp: 200 });
        let (_, v2) = m.read().unwrap();
        assert_ne!(v1, v2);
    }

    #[test]
    fn torn_slot_is_recovered_on_next_write() {
        let (_buf, m) = make_mbx();
        m.write(Status { fill: 1, tstamp: 1 });
        // Simulate a crashed writer leaving the slot's seq odd.
        let last = m.header().index.load(Ordering::Relaxed);
        m.slot(last as usize).seq.fetch_add(1, Ordering::Relaxed);
        m.write(Status { fill: 9, tstamp: 9 });
        let (got, _) = m.read().unwrap();
        assert_eq!(got, Status { fill: 9, tstamp: 9 });
    }

    #[test]
    fn rotation_cycles_through_all_slots() {
        let (_buf, m) = make_mbx();
        for i in 0..(MBX_SLOTS as u32 * 2) {
            m.write(Status { fill: i, tstamp: i as u64 });
        }
        let (got, _) = m.read().unwrap();
        assert_eq!(got.fill, MBX_SLOTS as u32 * 2 - 1);
    }
}
