// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Message-framed request/reply channel (§4.6). `AsyncIoContext` is generic
// over a [`Transport`]; two transports are provided: [`socket`] (byte
// stream + wire packets, cross-process) and [`inproc`] (dual-FIFO,
// zero-copy, same-process).

pub mod inproc;
pub mod socket;
pub mod wire;

use std::collections::VecDeque;
use std::io;

use crate::error::{DspdError, DspdResult};

/// A transport carries framed packets and, optionally, one file descriptor
/// riding on a reply via ancillary data (socket transport only — `inproc`
/// never produces one).
pub trait Transport {
    fn send_packet(&mut self, packet: &wire::Packet, fd: Option<i32>) -> io::Result<()>;
    /// Non-blocking: `Ok(None)` means no packet ready yet.
    fn try_recv_packet(&mut self) -> io::Result<Option<(wire::Packet, Option<i32>)>>;
}

type CompleteFn = Box<dyn FnOnce(DspdResult<(Vec<u8>, Option<i32>)>) + Send>;

struct PendingOp {
    cancelled: bool,
    complete: Option<CompleteFn>,
}

/// Request/reply async-io context. Completion callbacks run on whoever
/// calls [`AsyncIoContext::poll`] (never the transport thread) — in the
/// full system that is the owning event loop's dispatch thread.
pub struct AsyncIoContext<T: Transport> {
    transport: T,
    pending: VecDeque<PendingOp>,
    next_cmd: u16,
}

impl<T: Transport> AsyncIoContext<T> {
    pub fn new(transport: T) -> Self {
        Self { transport, pending: VecDeque::new(), next_cmd: 0 }
    }

    /// Submit exactly one operation. Order of submission is preserved:
    /// replies are matched strictly FIFO against the pending queue (§5).
    pub fn submit(
        &mut self,
        cmd: u16,
        stream: i32,
        requested_reply_size: i32,
        payload: Vec<u8>,
        complete: impl FnOnce(DspdResult<(Vec<u8>, Option<i32>)>) + Send + 'static,
    ) -> DspdResult<()> {
        let packet = wire::Packet::request(cmd, stream, requested_reply_size, payload);
        self.transport.send_packet(&packet, None).map_err(|_| DspdError::Protocol)?;
        self.pending.push_back(PendingOp { cancelled: false, complete: Some(Box::new(complete)) });
        Ok(())
    }

    /// Drain and dispatch any replies the transport has ready. Returns the
    /// number of completions fired. Never blocks.
    pub fn poll(&mut self) -> DspdResult<usize> {
        let mut fired = 0;
        loop {
            let received = self.transport.try_recv_packet().map_err(|_| DspdError::Protocol)?;
            let Some((packet, fd)) = received else { break };
            let Some(op) = self.pending.pop_front() else {
                // A reply with nothing pending is a protocol violation —
                // drop it rather than panicking; the caller's next
                // operation will surface the underlying desync.
                continue;
            };
            if op.cancelled {
                continue;
            }
            let result = if packet.header.is_error() {
                Err(decode_error(packet.header.rdata))
            } else {
                Ok((packet.payload, fd))
            };
            if let Some(cb) = op.complete {
                cb(result);
            }
            fired += 1;
        }
        Ok(fired)
    }

    /// Cancel the oldest still-queued operation. If it has not completed
    /// yet, its completion fires synchronously with `Cancelled`; cancelling
    /// after completion already ran is a no-op. Takes effect no later than
    /// the next [`AsyncIoContext::poll`] (§5).
    pub fn cancel_oldest(&mut self) {
        if let Some(op) = self.pending.front_mut() {
            if !op.cancelled {
                op.cancelled = true;
                if let Some(cb) = op.complete.take() {
                    cb(Err(DspdError::Cancelled));
                }
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn next_cmd_id(&mut self) -> u16 {
        let id = self.next_cmd;
        self.next_cmd = self.next_cmd.wrapping_add(1);
        id
    }
}

fn decode_error(rdata: i32) -> DspdError {
    match rdata {
        x if x == DspdError::Again as i32 => DspdError::Again,
        x if x == DspdError::Pipe as i32 => DspdError::Pipe,
        x if x == DspdError::Strpipe as i32 => DspdError::Strpipe,
        x if x == DspdError::BadFd as i32 => DspdError::BadFd,
        x if x == DspdError::BadF as i32 => DspdError::BadF,
        x if x == DspdError::NoDev as i32 => DspdError::NoDev,
        x if x == DspdError::Fault as i32 => DspdError::Fault,
        x if x == DspdError::Invalid as i32 => DspdError::Invalid,
        x if x == DspdError::Busy as i32 => DspdError::Busy,
        _ => DspdError::Protocol,
    }
}
