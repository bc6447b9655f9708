// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lock-free single-producer/single-consumer byte ring, laid out so the
// header + ring fit inside one shared-memory section (see shm::Section).
//
// Exactly one writer advances `in`; exactly one reader advances `out`.
// Both counters are 32-bit and wrap freely — only their difference is
// meaningful, so unsigned wraparound arithmetic is used throughout.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::error::DspdError;

/// Header stored at the start of a FIFO's backing storage.
///
/// Binary layout matches §6 of the shared-memory section format:
/// `in, out, error | capacity × element_size`.
#[repr(C)]
pub struct FifoHeader {
    wr_in: AtomicU32,
    rd_out: AtomicU32,
    error: AtomicI32,
}

impl FifoHeader {
    pub const SIZE: usize = std::mem::size_of::<FifoHeader>();
}

/// Computed read-side triple from [`Fifo::space`] / [`Fifo::length`].
#[derive(Debug, Clone, Copy)]
pub struct FifoCounters {
    pub r#in: u32,
    pub out: u32,
    pub count: u32,
}

/// A fixed-capacity SPSC byte ring living in caller-owned (possibly shared)
/// memory. `Fifo` itself holds only a pointer + length — it never owns the
/// backing allocation, mirroring the C original where the ring is placed
/// directly into a shared-memory section.
pub struct Fifo {
    header: *mut FifoHeader,
    data: *mut u8,
    capacity: u32,
}

unsafe impl Send for Fifo {}
unsafe impl Sync for Fifo {}

impl Fifo {
    /// Total bytes of backing storage required for a FIFO of `capacity` bytes.
    pub fn storage_size(capacity: u32) -> usize {
        FifoHeader::SIZE + capacity as usize
    }

    /// Construct a view over `capacity` bytes of storage starting at `base`,
    /// which must be at least [`Fifo::storage_size`] bytes and outlive `self`.
    /// Initializes the header iff `init` is true (first opener of fresh
    /// storage); subsequent attaches in other processes pass `init = false`.
    ///
    /// # Safety
    /// `base` must point to valid, writable memory of the required size for
    /// the lifetime of the returned `Fifo`, and must not be concurrently
    /// constructed as a `Fifo` with a different `capacity`.
    pub unsafe fn from_raw(base: *mut u8, capacity: u32, init: bool) -> Self {
        let header = base as *mut FifoHeader;
        let data = base.add(FifoHeader::SIZE);
        if init {
            (*header).wr_in.store(0, Ordering::Relaxed);
            (*header).rd_out.store(0, Ordering::Relaxed);
            (*header).error.store(0, Ordering::Relaxed);
        }
        Self { header, data, capacity }
    }

    fn hdr(&self) -> &FifoHeader {
        unsafe { &*self.header }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Sticky terminal error word. Any side may set it; both sides read it.
    pub fn get_error(&self) -> i32 {
        self.hdr().error.load(Ordering::Acquire)
    }

    /// Set the sticky terminal error word (e.g. device disappeared).
    pub fn set_error(&self, err: i32) {
        self.hdr().error.store(err, Ordering::Release);
    }

    fn check_invariant(&self, r#in: u32, out: u32) -> Result<u32, DspdError> {
        let used = r#in.wrapping_sub(out);
        if used as u64 > self.capacity as u64 {
            self.set_error(DspdError::Fault as i32 + 1);
            return Err(DspdError::Fault);
        }
        Ok(used)
    }

    /// `(in, out, free_count)`, acquire-ordered.
    pub fn space(&self) -> Result<FifoCounters, DspdError> {
        let r#in = self.hdr().wr_in.load(Ordering::Acquire);
        let out = self.hdr().rd_out.load(Ordering::Acquire);
        let used = self.check_invariant(r#in, out)?;
        Ok(FifoCounters { r#in, out, count: self.capacity - used })
    }

    /// `(in, out, used_count)`, acquire-ordered.
    pub fn length(&self) -> Result<FifoCounters, DspdError> {
        let r#in = self.hdr().wr_in.load(Ordering::Acquire);
        let out = self.hdr().rd_out.load(Ordering::Acquire);
        let used = self.check_invariant(r#in, out)?;
        Ok(FifoCounters { r#in, out, count: used })
    }

    fn slot(&self, index: u32) -> *mut u8 {
        unsafe { self.data.add((index % self.capacity) as usize) }
    }

    /// Reserve a writable region of up to `want` bytes. Returns a raw pointer
    /// and the contiguous length actually reserved, which is shorter than
    /// `want` iff the region straddles the wrap point or the ring is nearly
    /// full — the caller re-reserves for the remainder.
    pub fn reserve_write(&self, want: u32) -> Result<(*mut u8, u32), DspdError> {
        let c = self.space()?;
        let avail = c.count.min(want);
        if avail == 0 {
            return Ok((std::ptr::null_mut(), 0));
        }
        let offset = c.r#in % self.capacity;
        let contiguous = (self.capacity - offset).min(avail);
        Ok((self.slot(c.r#in), contiguous))
    }

    /// Advance `in` by `n` bytes (release-ordered). A large `n` obtained by
    /// casting a negative delta to `u32` implements rewind of the write side.
    pub fn commit_write(&self, n: u32) {
        self.hdr().wr_in.fetch_add(n, Ordering::Release);
    }

    /// Reserve a readable region of up to `want` bytes, same wrap-shortening
    /// rule as [`reserve_write`].
    pub fn reserve_read(&self, want: u32) -> Result<(*const u8, u32), DspdError> {
        let c = self.length()?;
        let avail = c.count.min(want);
        if avail == 0 {
            return Ok((std::ptr::null(), 0));
        }
        let offset = c.out % self.capacity;
        let contiguous = (self.capacity - offset).min(avail);
        Ok((self.slot(c.out) as *const u8, contiguous))
    }

    /// Advance `out` by `n` bytes (release-ordered).
    pub fn commit_read(&self, n: u32) {
        self.hdr().rd_out.fetch_add(n, Ordering::Release);
    }

    /// Peek at `count` bytes starting `offset` bytes past the current read
    /// cursor without committing. Returns the contiguous length available,
    /// which may be less than `count`.
    pub fn peek(&self, offset: u32, count: u32) -> Result<(*const u8, u32), DspdError> {
        let c = self.length()?;
        if offset >= c.count {
            return Ok((std::ptr::null(), 0));
        }
        let want = count.min(c.count - offset);
        let start = c.out.wrapping_add(offset);
        let slot_offset = start % self.capacity;
        let contiguous = (self.capacity - slot_offset).min(want);
        Ok((self.slot(start) as *const u8, contiguous))
    }

    /// Copy `src` into the ring, issuing as many reserve/commit rounds as the
    /// wrap point requires. Returns bytes written (may be less than
    /// `src.len()` if the ring fills).
    pub fn write(&self, src: &[u8]) -> Result<usize, DspdError> {
        let mut written = 0usize;
        while written < src.len() {
            let want = (src.len() - written) as u32;
            let (ptr, n) = self.reserve_write(want)?;
            if n == 0 {
                break;
            }
            unsafe {
                std::ptr::copy_nonoverlapping(src[written..].as_ptr(), ptr, n as usize);
            }
            self.commit_write(n);
            written += n as usize;
        }
        Ok(written)
    }

    /// Copy up to `dst.len()` bytes out of the ring. Returns bytes read.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, DspdError> {
        let mut read = 0usize;
        while read < dst.len() {
            let want = (dst.len() - read) as u32;
            let (ptr, n) = self.reserve_read(want)?;
            if n == 0 {
                break;
            }
            unsafe {
                std::ptr::copy_nonoverlapping(ptr, dst[read..].as_mut_ptr(), n as usize);
            }
            self.commit_read(n);
            read += n as usize;
        }
        Ok(read)
    }

    /// Reset both counters to zero. Only safe with no concurrent producer
    /// or consumer.
    pub fn reset(&self) {
        self.hdr().wr_in.store(0, Ordering::Relaxed);
        self.hdr().rd_out.store(0, Ordering::Relaxed);
        self.hdr().error.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_fifo(capacity: u32) -> (Vec<u8>, Fifo) {
        let mut buf = vec![0u8; Fifo::storage_size(capacity)];
        let fifo = unsafe { Fifo::from_raw(buf.as_mut_ptr(), capacity, true) };
        (buf, fifo)
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (_buf, f) = make_fifo(16);
        let n = f.write(b"hello world").unwrap();
        assert_eq!(n, 11);
        let mut out = [0u8; 11];
        let n = f.read(&mut out).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn wrap_shortens_reservation() {
        let (_buf, f) = make_fifo(8);
        f.write(b"123456").unwrap();
        let mut tmp = [0u8; 4];
        f.read(&mut tmp).unwrap(); // out=4
        // in=6, out=4 -> space=6, but contiguous to end is 8-6=2
        let (_ptr, n) = f.reserve_write(6).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn full_buffer_returns_zero_contiguous() {
        let (_buf, f) = make_fifo(4);
        f.write(b"abcd").unwrap();
        let (ptr, n) = f.reserve_write(4).unwrap();
        assert!(ptr.is_null());
        assert_eq!(n, 0);
    }

    #[test]
    fn invariant_violation_sets_fault() {
        let (_buf, f) = make_fifo(4);
        // Force in - out > capacity by writing the raw header directly.
        f.hdr().wr_in.store(100, Ordering::Relaxed);
        f.hdr().rd_out.store(0, Ordering::Relaxed);
        let err = f.length().unwrap_err();
        assert_eq!(err, DspdError::Fault);
        assert_ne!(f.get_error(), 0);
    }

    #[test]
    fn rewind_via_wrapping_commit() {
        let (_buf, f) = make_fifo(16);
        f.write(b"abcdefgh").unwrap();
        let mut tmp = [0u8; 4];
        f.read(&mut tmp).unwrap(); // out = 4
        f.commit_read(4u32.wrapping_neg()); // rewind by 4
        let c = f.length().unwrap();
        assert_eq!(c.count, 8);
    }
}
