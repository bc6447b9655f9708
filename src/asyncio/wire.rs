// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Wire packet codec for the socket transport (§6). Little-endian,
// fixed 20-byte header followed by `len - 20` payload bytes.

use crate::error::DspdError;

pub const HEADER_LEN: usize = 20;

pub mod flags {
    pub const ERROR: u16 = 0x0001;
    pub const CMSG_FD: u16 = 0x0002;
    pub const REMOTE: u16 = 0x0004;
    pub const POLLHUP: u16 = 0x0080;
}

/// The fixed wire header. `rdata` is the requested reply size on a request,
/// or the error code / actual size on a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub len: u32,
    pub cmd: u16,
    pub flags: u16,
    pub stream: i32,
    pub rdata: i32,
    pub reserved: u32,
}

impl PacketHeader {
    pub fn new(cmd: u16, stream: i32, rdata: i32, payload_len: usize) -> Self {
        Self { len: (HEADER_LEN + payload_len) as u32, cmd, flags: 0, stream, rdata, reserved: 0 }
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.len.to_le_bytes());
        buf[4..6].copy_from_slice(&self.cmd.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..12].copy_from_slice(&self.stream.to_le_bytes());
        buf[12..16].copy_from_slice(&self.rdata.to_le_bytes());
        buf[16..20].copy_from_slice(&self.reserved.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, DspdError> {
        if buf.len() < HEADER_LEN {
            return Err(DspdError::Protocol);
        }
        let len = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if (len as usize) < HEADER_LEN {
            return Err(DspdError::Protocol);
        }
        Ok(Self {
            len,
            cmd: u16::from_le_bytes(buf[4..6].try_into().unwrap()),
            flags: u16::from_le_bytes(buf[6..8].try_into().unwrap()),
            stream: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            rdata: i32::from_le_bytes(buf[12..16].try_into().unwrap()),
            reserved: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        })
    }

    pub fn payload_len(self) -> usize {
        self.len as usize - HEADER_LEN
    }

    pub fn is_error(self) -> bool {
        self.flags & flags::ERROR != 0
    }

    pub fn has_cmsg_fd(self) -> bool {
        self.flags & flags::CMSG_FD != 0
    }
}

/// A fully decoded packet: header plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn request(cmd: u16, stream: i32, requested_reply_size: i32, payload: Vec<u8>) -> Self {
        Self { header: PacketHeader::new(cmd, stream, requested_reply_size, payload.len()), payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DspdError> {
        let header = PacketHeader::from_bytes(buf)?;
        let total = header.len as usize;
        if buf.len() < total {
            return Err(DspdError::Protocol);
        }
        Ok(Self { header, payload: buf[HEADER_LEN..total].to_vec() })
    }
}
