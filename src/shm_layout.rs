// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Section table for the per-direction shared-memory region (§6):
//
//   [header]
//   [section table: (section_id, offset, length)+]
//   [MBX section]
//   [FIFO section]
//
// All sections are aligned to 8 bytes. The region may be reached via an fd
// passed over ancillary data (cross-process, see asyncio::socket) or by
// direct pointer (in-process, see asyncio::inproc). The header carries a
// named [`RwLock`] guarding the section table itself: `build` holds it
// exclusively while writing entries, so a second process racing in with
// `open_named` right after `ShmHandle::acquire` never reads a torn table.

use std::io;

use crate::error::DspdError;
use crate::rw_lock::RwLock;
use crate::shm::{ShmHandle, ShmOpenMode};

const MAGIC: u32 = 0x4453_5044; // "DSPD"
const VERSION: u32 = 1;

/// Identifies a sub-section inside one direction's shared-memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SectionId {
    Mbx = 1,
    Fifo = 2,
}

#[repr(C)]
struct RegionHeader {
    magic: u32,
    version: u32,
    section_count: u32,
    table_lock: RwLock,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct SectionEntry {
    id: u32,
    offset: u32,
    length: u32,
    _reserved: u32,
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// A view over a laid-out shared-memory region: header, section table, and
/// the sections themselves. Does not own the backing storage.
#[derive(Debug)]
pub struct ShmLayout {
    base: *mut u8,
    entries: Vec<SectionEntry>,
}

unsafe impl Send for ShmLayout {}
unsafe impl Sync for ShmLayout {}

impl ShmLayout {
    fn table_bytes(count: usize) -> usize {
        align8(std::mem::size_of::<RegionHeader>()) + std::mem::size_of::<SectionEntry>() * count
    }

    /// Total storage required for a region holding an MBX section of
    /// `mbx_len` bytes and a FIFO section of `fifo_len` bytes.
    pub fn total_size(mbx_len: usize, fifo_len: usize) -> usize {
        let table = Self::table_bytes(2);
        let mbx_off = align8(table);
        let fifo_off = align8(mbx_off + mbx_len);
        fifo_off + fifo_len
    }

    /// Lay out a fresh region at `base` (which must be at least
    /// [`ShmLayout::total_size`] bytes) with an MBX section followed by a
    /// FIFO section, and write the header + section table.
    ///
    /// # Safety
    /// `base` must point to valid, writable memory of the required size for
    /// the lifetime of the returned `ShmLayout`.
    pub unsafe fn build(base: *mut u8, mbx_len: usize, fifo_len: usize) -> Self {
        let table = Self::table_bytes(2);
        let mbx_off = align8(table);
        let fifo_off = align8(mbx_off + mbx_len);

        let header = base as *mut RegionHeader;
        std::ptr::write(std::ptr::addr_of_mut!((*header).table_lock), RwLock::new());
        (*header).table_lock.lock();

        (*header).magic = MAGIC;
        (*header).version = VERSION;
        (*header).section_count = 2;

        let entries = vec![
            SectionEntry { id: SectionId::Mbx as u32, offset: mbx_off as u32, length: mbx_len as u32, _reserved: 0 },
            SectionEntry { id: SectionId::Fifo as u32, offset: fifo_off as u32, length: fifo_len as u32, _reserved: 0 },
        ];
        let table_ptr = base.add(align8(std::mem::size_of::<RegionHeader>())) as *mut SectionEntry;
        for (i, e) in entries.iter().enumerate() {
            std::ptr::write(table_ptr.add(i), *e);
        }

        (*header).table_lock.unlock();
        Self { base, entries }
    }

    /// Attach to a region previously written by [`ShmLayout::build`] (in
    /// this or another process). Fails with `Protocol` if the header is
    /// malformed, and `Invalid` if a claimed section would run past `len`.
    ///
    /// # Safety
    /// `base` must point to at least `len` bytes of valid memory containing
    /// a region previously initialized by [`ShmLayout::build`].
    pub unsafe fn open(base: *mut u8, len: usize) -> Result<Self, DspdError> {
        if len < std::mem::size_of::<RegionHeader>() {
            return Err(DspdError::Protocol);
        }
        let header = &*(base as *const RegionHeader);
        if header.magic != MAGIC || header.version != VERSION {
            return Err(DspdError::Protocol);
        }
        // Hold the shared lock across the whole table read, so a racing
        // `build()` on another process can't hand us a torn section_count
        // or half-written entries.
        header.table_lock.lock_shared();
        let count = header.section_count as usize;
        let table_ptr = base.add(align8(std::mem::size_of::<RegionHeader>())) as *const SectionEntry;
        let mut entries = Vec::with_capacity(count);
        let mut err = None;
        for i in 0..count {
            let e = std::ptr::read(table_ptr.add(i));
            if (e.offset as usize).saturating_add(e.length as usize) > len {
                err = Some(DspdError::Invalid);
                break;
            }
            entries.push(e);
        }
        header.table_lock.unlock_shared();
        if let Some(e) = err {
            return Err(e);
        }
        Ok(Self { base, entries })
    }

    /// Locate a section by id. Returns `(pointer, length)`.
    pub fn section(&self, id: SectionId) -> Option<(*mut u8, usize)> {
        self.entries
            .iter()
            .find(|e| e.id == id as u32)
            .map(|e| (unsafe { self.base.add(e.offset as usize) }, e.length as usize))
    }

    /// Acquire a named shared-memory segment and lay out a fresh region in
    /// it. The returned `ShmHandle` must outlive the `ShmLayout` — the
    /// layout only borrows its backing pointer.
    pub fn create_named(name: &str, mbx_len: usize, fifo_len: usize) -> io::Result<(ShmHandle, Self)> {
        let size = Self::total_size(mbx_len, fifo_len);
        let handle = ShmHandle::acquire(name, size, ShmOpenMode::CreateOrOpen)?;
        let layout = unsafe { Self::build(handle.as_mut_ptr(), mbx_len, fifo_len) };
        Ok((handle, layout))
    }

    /// Attach to a named shared-memory segment previously written by
    /// [`ShmLayout::create_named`] in this or another process.
    pub fn open_named(name: &str, size_hint: usize) -> io::Result<(ShmHandle, Self)> {
        let handle = ShmHandle::acquire(name, size_hint, ShmOpenMode::Open)?;
        let layout = unsafe { Self::open(handle.as_mut_ptr(), handle.user_size()) }
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok((handle, layout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_open_roundtrips_sections() {
        let size = ShmLayout::total_size(64, 256);
        let mut buf = vec![0u8; size];
        let layout = unsafe { ShmLayout::build(buf.as_mut_ptr(), 64, 256) };
        let (mbx_ptr, mbx_len) = layout.section(SectionId::Mbx).unwrap();
        let (fifo_ptr, fifo_len) = layout.section(SectionId::Fifo).unwrap();
        assert_eq!(mbx_len, 64);
        assert_eq!(fifo_len, 256);
        assert!(fifo_ptr as usize >= mbx_ptr as usize + 64);

        let reopened = unsafe { ShmLayout::open(buf.as_mut_ptr(), size).unwrap() };
        assert_eq!(reopened.section(SectionId::Mbx).unwrap().1, 64);
    }

    #[test]
    fn open_rejects_bad_magic() {
        let mut buf = vec![0u8; 64];
        let err = unsafe { ShmLayout::open(buf.as_mut_ptr(), buf.len()) }.unwrap_err();
        assert_eq!(err, DspdError::Protocol);
    }

    #[test]
    fn concurrent_open_never_observes_a_torn_table() {
        // Model a server racing a client: the server's `build()` runs in a
        // loop on one thread while many reader threads hammer `open()` on
        // the same buffer. Every successful open must see a fully written,
        // internally consistent table (every field the table-lock spot
        // check above expects) or be rejected with `Protocol` while the
        // region isn't ready yet — it must never read a half-written
        // section_count or entries.
        use std::sync::Arc;

        let size = ShmLayout::total_size(64, 256);
        let buf: Arc<Vec<u8>> = Arc::new(vec![0u8; size]);
        let base = buf.as_ptr() as usize;

        let writer = std::thread::spawn(move || {
            for _ in 0..200 {
                unsafe { ShmLayout::build(base as *mut u8, 64, 256) };
            }
        });

        let mut readers = Vec::new();
        for _ in 0..4 {
            let size = size;
            readers.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    match unsafe { ShmLayout::open(base as *mut u8, size) } {
                        Ok(layout) => {
                            assert_eq!(layout.section(SectionId::Mbx).unwrap().1, 64);
                            assert_eq!(layout.section(SectionId::Fifo).unwrap().1, 256);
                        }
                        Err(e) => assert_eq!(e, DspdError::Protocol),
                    }
                }
            }));
        }

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }

    #[test]
    fn create_named_then_open_named_roundtrips() {
        let name = format!("dspd-shm-layout-test-{}", std::process::id());
        let (creator, layout) = ShmLayout::create_named(&name, 64, 256).unwrap();
        let (mbx_ptr, mbx_len) = layout.section(SectionId::Mbx).unwrap();
        assert_eq!(mbx_len, 64);
        assert!(!mbx_ptr.is_null());

        let size = ShmLayout::total_size(64, 256);
        let (opener, reopened) = ShmLayout::open_named(&name, size).unwrap();
        assert_eq!(reopened.section(SectionId::Fifo).unwrap().1, 256);

        drop(opener);
        drop(creator);
        ShmHandle::unlink_by_name(&name);
    }
}
