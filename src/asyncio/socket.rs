// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-process transport: a `UnixStream` carrying wire packets, with an
// optional file descriptor riding a reply via `SCM_RIGHTS` ancillary data
// (used to hand the client its shared-memory segment fd on `Open`, §4.6).

#![cfg(unix)]

use std::io::{self, Write};
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use super::wire::{Packet, PacketHeader, HEADER_LEN};
use super::Transport;

/// Wraps a connected, non-blocking `UnixStream`. Partial reads are buffered
/// internally until a full packet is available.
pub struct SocketTransport {
    stream: UnixStream,
    inbuf: Vec<u8>,
    pending_fd: Option<RawFd>,
}

impl SocketTransport {
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self { stream, inbuf: Vec::new(), pending_fd: None })
    }

    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a)?, Self::new(b)?))
    }

    fn fill_from_socket(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            match recv_with_fd(&self.stream, &mut chunk) {
                Ok((0, _)) => break,
                Ok((n, fd)) => {
                    self.inbuf.extend_from_slice(&chunk[..n]);
                    if let Some(fd) = fd {
                        self.pending_fd = Some(fd);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Transport for SocketTransport {
    fn send_packet(&mut self, packet: &Packet, fd: Option<i32>) -> io::Result<()> {
        let encoded = packet.encode();
        match fd {
            Some(fd) => send_with_fd(&self.stream, &encoded, fd),
            None => self.stream.write_all(&encoded),
        }
    }

    fn try_recv_packet(&mut self) -> io::Result<Option<(Packet, Option<i32>)>> {
        self.fill_from_socket()?;
        if self.inbuf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = PacketHeader::from_bytes(&self.inbuf)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad header"))?;
        let total = header.len as usize;
        if self.inbuf.len() < total {
            return Ok(None);
        }
        let packet = Packet::decode(&self.inbuf[..total])
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad packet"))?;
        self.inbuf.drain(..total);
        Ok(Some((packet, self.pending_fd.take())))
    }
}

/// Write `buf` plus one ancillary fd in a single `sendmsg(2)`.
fn send_with_fd(stream: &UnixStream, buf: &[u8], fd: RawFd) -> io::Result<()> {
    let iov = libc::iovec { iov_base: buf.as_ptr() as *mut _, iov_len: buf.len() };
    let mut cbuf = [0u8; unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize }];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;
    msg.msg_control = cbuf.as_mut_ptr() as *mut _;
    msg.msg_controllen = cbuf.len() as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        std::ptr::write(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
    }

    let n = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read into `buf`, returning `(bytes_read, fd_if_any)`. Plain `read(2)`
/// never carries ancillary data, so this always goes through `recvmsg(2)`.
fn recv_with_fd(stream: &UnixStream, buf: &mut [u8]) -> io::Result<(usize, Option<RawFd>)> {
    let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut _, iov_len: buf.len() };
    let mut cbuf = [0u8; unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize }];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cbuf.as_mut_ptr() as *mut _;
    msg.msg_controllen = cbuf.len() as _;

    let n = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut fd = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                fd = Some(std::ptr::read(libc::CMSG_DATA(cmsg) as *const RawFd));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    Ok((n as usize, fd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;

    #[test]
    fn plain_packet_roundtrips_over_socketpair() {
        let (mut a, mut b) = SocketTransport::pair().unwrap();
        let p = Packet::request(3, 0, 32, b"hi".to_vec());
        a.send_packet(&p, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let (got, fd) = b.try_recv_packet().unwrap().unwrap();
        assert_eq!(got, p);
        assert!(fd.is_none());
    }

    #[test]
    fn fd_rides_along_with_packet() {
        let (mut a, mut b) = SocketTransport::pair().unwrap();
        let tmp = std::fs::File::open("/dev/null").unwrap();
        let raw = tmp.into_raw_fd();
        let p = Packet::request(9, 1, 0, vec![]);
        a.send_packet(&p, Some(raw)).unwrap();
        unsafe { libc::close(raw) };
        std::thread::sleep(std::time::Duration::from_millis(20));
        let (got, fd) = b.try_recv_packet().unwrap().unwrap();
        assert_eq!(got, p);
        assert!(fd.is_some());
        unsafe { libc::close(fd.unwrap()) };
    }

    #[test]
    fn partial_write_reassembles_before_decode() {
        let (mut a, mut b) = SocketTransport::pair().unwrap();
        let p = Packet::request(1, 0, 0, vec![0u8; 10]);
        let encoded = p.encode();
        a.stream.write_all(&encoded[..5]).unwrap();
        assert!(b.try_recv_packet().unwrap().is_none());
        a.stream.write_all(&encoded[5..]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(b.try_recv_packet().unwrap().unwrap().0, p);
    }
}
