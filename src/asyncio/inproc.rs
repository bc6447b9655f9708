// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Same-process transport: two byte FIFOs (one per direction) plus a
// condvar wakeup. Used when client and server live in the same address
// space and a real socket would only add copies (§4.6).

use std::io;
use std::sync::{Arc, Condvar, Mutex};

use super::wire::Packet;
use super::Transport;
use crate::fifo::Fifo;

struct Ring {
    storage: Vec<u8>,
    fifo: Fifo,
}

impl Ring {
    fn new(capacity: u32) -> Self {
        let mut storage = vec![0u8; Fifo::storage_size(capacity)];
        let fifo = unsafe { Fifo::from_raw(storage.as_mut_ptr(), capacity, true) };
        Self { storage, fifo }
    }
}

unsafe impl Send for Ring {}

/// Copy `dst.len()` bytes out of `fifo` without committing the read
/// cursor. Returns `false` (leaving `dst` partially clobbered but that's
/// fine, the caller discards it) if not enough data is queued yet.
fn peek_exact(fifo: &Fifo, dst: &mut [u8]) -> Result<bool, crate::error::DspdError> {
    let need = dst.len() as u32;
    let mut got = 0u32;
    while got < need {
        let (ptr, n) = fifo.peek(got, need - got)?;
        if n == 0 {
            return Ok(false);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, dst[got as usize..].as_mut_ptr(), n as usize);
        }
        got += n;
    }
    Ok(true)
}

struct Doorbell {
    lock: Mutex<u64>,
    cv: Condvar,
}

impl Doorbell {
    fn new() -> Self {
        Self { lock: Mutex::new(0), cv: Condvar::new() }
    }

    fn ring(&self) {
        let mut n = self.lock.lock().unwrap();
        *n = n.wrapping_add(1);
        self.cv.notify_all();
    }
}

/// One direction of the pair: write `Packet`s into `out`, read them back
/// out of `inn`. `client` and `server` constructed by [`pair`] share the
/// same two rings with directions swapped.
pub struct InProcTransport {
    out: Arc<Ring>,
    inn: Arc<Ring>,
    doorbell: Arc<Doorbell>,
}

/// Build a connected pair: whatever the client sends, the server receives
/// on its `inn`, and vice versa.
pub fn pair(capacity: u32) -> io::Result<(InProcTransport, InProcTransport)> {
    let a_to_b = Arc::new(Ring::new(capacity));
    let b_to_a = Arc::new(Ring::new(capacity));
    let doorbell = Arc::new(Doorbell::new());
    let client = InProcTransport { out: a_to_b.clone(), inn: b_to_a.clone(), doorbell: doorbell.clone() };
    let server = InProcTransport { out: b_to_a, inn: a_to_b, doorbell };
    Ok((client, server))
}

impl InProcTransport {
    /// Block until a reply is queued or `timeout` elapses.
    pub fn wait(&self, timeout: std::time::Duration) -> bool {
        let guard = self.doorbell.lock.lock().unwrap();
        let start = *guard;
        let (guard, result) =
            self.doorbell.cv.wait_timeout_while(guard, timeout, |n| *n == start).unwrap();
        drop(guard);
        !result.timed_out()
    }
}

impl Transport for InProcTransport {
    fn send_packet(&mut self, packet: &Packet, _fd: Option<i32>) -> io::Result<()> {
        let encoded = packet.encode();
        self.out
            .fifo
            .write(&encoded)
            .map_err(|_| io::Error::new(io::ErrorKind::WouldBlock, "fifo full"))?;
        self.doorbell.ring();
        Ok(())
    }

    fn try_recv_packet(&mut self) -> io::Result<Option<(Packet, Option<i32>)>> {
        let fault = || io::Error::new(io::ErrorKind::Other, "fifo fault");
        let mut header_buf = [0u8; super::wire::HEADER_LEN];
        if !peek_exact(&self.inn.fifo, &mut header_buf).map_err(|_| fault())? {
            return Ok(None);
        }
        let header = super::wire::PacketHeader::from_bytes(&header_buf)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad header"))?;
        let mut buf = vec![0u8; header.len as usize];
        if !peek_exact(&self.inn.fifo, &mut buf).map_err(|_| fault())? {
            return Ok(None);
        }
        self.inn.fifo.read(&mut buf).map_err(|_| fault())?;
        let packet = Packet::decode(&buf).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad packet"))?;
        Ok(Some((packet, None)))
    }
}
