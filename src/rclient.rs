// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Remote client wrapper (§4.7): a thin façade gluing a `PcmClient`-shaped
// caller onto async-io plus shared-memory negotiation. Owns the handshake
// that turns a bare transport into two attached `PcmStream`s: request a
// client slot, reserve a device, negotiate hw params, receive the shm
// section descriptors, attach, then `CONNECT`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::asyncio::{AsyncIoContext, Transport};
use crate::error::{DspdError, DspdResult};
use crate::pcm::format::PcmFormat;
use crate::pcm::{Direction, PcmStream, StreamParams};
use crate::shm_layout::ShmLayout;
use crate::waiter::Waiter;

/// Device reservation is contended: two applications on the same host can
/// race to open the same sound card. The server is the arbiter and returns
/// [`DspdError::Busy`] to the loser; the loser then blocks on a named
/// [`Waiter`] keyed by the device index until the winner releases it,
/// rather than hammering the server with retries.
///
/// The busy flag itself is process-local (a real multi-process deployment
/// would place it in the same named shared-memory segment the `Waiter`'s
/// mutex lives in), but the wait/notify channel is the same named,
/// cross-process-capable primitive either way.
fn device_registry() -> &'static Mutex<HashMap<i32, Arc<AtomicBool>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<i32, Arc<AtomicBool>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn device_flag(device_index: i32) -> Arc<AtomicBool> {
    device_registry()
        .lock()
        .unwrap()
        .entry(device_index)
        .or_insert_with(|| Arc::new(AtomicBool::new(false)))
        .clone()
}

fn device_waiter_name(device_index: i32) -> String {
    format!("dspd-device-{device_index}")
}

/// Mark `device_index` free and wake whoever is waiting on it.
fn release_device(device_index: i32) -> DspdResult<()> {
    device_flag(device_index).store(false, Ordering::Release);
    let waiter = Waiter::open(&device_waiter_name(device_index)).map_err(|_| DspdError::Fault)?;
    waiter.broadcast().map_err(|_| DspdError::Fault)
}

/// Wire command codes for the handshake requests. Everything past
/// `Connect` (actual transfer commands: trigger, delay, rewind...) rides
/// the same [`AsyncIoContext`] once the handshake completes, keyed off the
/// stream index negotiated here.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeCmd {
    GetClient = 1,
    ReserveDevice = 2,
    SetHwParams = 3,
    Connect = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    HaveClientSlot,
    DeviceReserved,
    ParamsNegotiated,
    StreamsAttached,
    Connected,
}

/// Negotiated hw params returned by the server alongside the shm section
/// table location for this client's streams.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatedParams {
    pub format: PcmFormat,
    pub rate: u32,
    pub channels: u32,
    pub fragsize_frames: u32,
    pub bufsize_frames: u32,
}

fn format_to_tag(format: PcmFormat) -> u8 {
    format as u8
}

fn format_from_tag(tag: u8) -> DspdResult<PcmFormat> {
    Ok(match tag {
        0 => PcmFormat::U8,
        1 => PcmFormat::S8,
        2 => PcmFormat::S16Le,
        3 => PcmFormat::S16Be,
        4 => PcmFormat::U16Le,
        5 => PcmFormat::U16Be,
        6 => PcmFormat::S32Le,
        7 => PcmFormat::S32Be,
        8 => PcmFormat::U32Le,
        9 => PcmFormat::U32Be,
        10 => PcmFormat::Float32Le,
        11 => PcmFormat::Float64Le,
        _ => return Err(DspdError::Protocol),
    })
}

pub struct RemoteClient<T: Transport> {
    io: AsyncIoContext<T>,
    state: HandshakeState,
    client_index: Option<i32>,
    device_index: Option<i32>,
    params: Option<NegotiatedParams>,
    playback: Option<PcmStream>,
    capture: Option<PcmStream>,
}

impl<T: Transport> RemoteClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            io: AsyncIoContext::new(transport),
            state: HandshakeState::Init,
            client_index: None,
            device_index: None,
            params: None,
            playback: None,
            capture: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Blocking round trip: submit one request, spin [`AsyncIoContext::poll`]
    /// until its completion fires. The handshake is inherently sequential
    /// (each step needs the previous reply), so there is no benefit to
    /// exposing it as a pipelined async sequence here — callers that need
    /// non-blocking behavior drive `io` directly once connected.
    fn call(&mut self, cmd: HandshakeCmd, payload: Vec<u8>) -> DspdResult<Vec<u8>> {
        use std::sync::{Arc, Mutex};

        let result: Arc<Mutex<Option<DspdResult<Vec<u8>>>>> = Arc::new(Mutex::new(None));
        let slot = result.clone();
        self.io.submit(cmd as u16, -1, 256, payload, move |r| {
            *slot.lock().unwrap() = Some(r.map(|(bytes, _fd)| bytes));
        })?;

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            self.io.poll()?;
            if let Some(r) = result.lock().unwrap().take() {
                return r;
            }
            if std::time::Instant::now() > deadline {
                return Err(DspdError::Again);
            }
            std::thread::sleep(std::time::Duration::from_micros(200));
        }
    }

    /// Step 1: request a client slot. Advances to [`HandshakeState::HaveClientSlot`].
    pub fn request_client_slot(&mut self) -> DspdResult<i32> {
        if self.state != HandshakeState::Init {
            return Err(DspdError::Invalid);
        }
        let reply = self.call(HandshakeCmd::GetClient, Vec::new())?;
        let index = decode_i32(&reply)?;
        self.client_index = Some(index);
        self.state = HandshakeState::HaveClientSlot;
        Ok(index)
    }

    /// Step 2: reserve a device by index.
    ///
    /// If the server reports the device busy, blocks on a named [`Waiter`]
    /// for up to 5 seconds per attempt until the current holder releases it
    /// (see [`abort_handshake`](Self::abort_handshake)), then retries.
    pub fn reserve_device(&mut self, device_index: i32) -> DspdResult<()> {
        if self.state != HandshakeState::HaveClientSlot {
            return Err(DspdError::Invalid);
        }
        let flag = device_flag(device_index);
        let waiter = Waiter::open(&device_waiter_name(device_index)).map_err(|_| DspdError::Fault)?;
        loop {
            waiter
                .wait_if(|| flag.load(Ordering::Acquire), Some(5_000))
                .map_err(|_| DspdError::Fault)?;
            match self.call(HandshakeCmd::ReserveDevice, device_index.to_le_bytes().to_vec()) {
                Ok(_) => break,
                Err(DspdError::Busy) => {
                    flag.store(true, Ordering::Release);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        self.device_index = Some(device_index);
        self.state = HandshakeState::DeviceReserved;
        Ok(())
    }

    /// Step 3: negotiate hw params.
    pub fn set_hw_params(&mut self, requested: NegotiatedParams) -> DspdResult<NegotiatedParams> {
        if self.state != HandshakeState::DeviceReserved {
            return Err(DspdError::Invalid);
        }
        let mut payload = Vec::with_capacity(17);
        payload.push(format_to_tag(requested.format));
        payload.extend_from_slice(&requested.rate.to_le_bytes());
        payload.extend_from_slice(&requested.channels.to_le_bytes());
        payload.extend_from_slice(&requested.fragsize_frames.to_le_bytes());
        payload.extend_from_slice(&requested.bufsize_frames.to_le_bytes());
        let reply = self.call(HandshakeCmd::SetHwParams, payload)?;
        if reply.len() < 17 {
            return Err(DspdError::Protocol);
        }
        let negotiated = NegotiatedParams {
            format: format_from_tag(reply[0])?,
            rate: u32::from_le_bytes(reply[1..5].try_into().unwrap()),
            channels: u32::from_le_bytes(reply[5..9].try_into().unwrap()),
            fragsize_frames: u32::from_le_bytes(reply[9..13].try_into().unwrap()),
            bufsize_frames: u32::from_le_bytes(reply[13..17].try_into().unwrap()),
        };
        self.params = Some(negotiated);
        self.state = HandshakeState::ParamsNegotiated;
        Ok(negotiated)
    }

    /// Steps 4-5: attach the negotiated streams to an already-mapped shm
    /// region (fd-to-pointer mapping is the caller's job — see
    /// [`crate::shm::ShmHandle`] for the cross-process path, or a plain
    /// pointer for in-process). `layout` must contain an MBX and FIFO
    /// section per direction requested.
    ///
    /// # Safety
    /// `layout` must outlive every attached stream, and no other party may
    /// construct conflicting views over the same sections concurrently.
    pub unsafe fn attach_streams(
        &mut self,
        layout: &ShmLayout,
        directions: &[Direction],
        init: bool,
    ) -> DspdResult<()> {
        if self.state != HandshakeState::ParamsNegotiated {
            return Err(DspdError::Invalid);
        }
        let params = self.params.ok_or(DspdError::Invalid)?;
        for &dir in directions {
            let stream_params = StreamParams {
                format: params.format,
                channels: params.channels,
                rate: params.rate,
                bufsize_frames: params.bufsize_frames,
                fragsize_frames: params.fragsize_frames,
            };
            let mut stream = PcmStream::new(dir, stream_params);
            stream.attach(layout, init).map_err(|_| DspdError::Fault)?;
            match dir {
                Direction::Playback => self.playback = Some(stream),
                Direction::Capture => self.capture = Some(stream),
            }
        }
        self.state = HandshakeState::StreamsAttached;
        Ok(())
    }

    /// Step 6: cement the binding. After this, `take_streams` hands the
    /// attached streams to the caller.
    pub fn connect(&mut self) -> DspdResult<()> {
        if self.state != HandshakeState::StreamsAttached {
            return Err(DspdError::Invalid);
        }
        self.call(HandshakeCmd::Connect, Vec::new())?;
        self.state = HandshakeState::Connected;
        Ok(())
    }

    pub fn take_streams(&mut self) -> (Option<PcmStream>, Option<PcmStream>) {
        (self.playback.take(), self.capture.take())
    }

    /// Unwind in reverse and drop the transport — called on any handshake
    /// failure partway through (§4.7). Releases the reserved device, if
    /// any, so another client blocked in [`reserve_device`](Self::reserve_device)
    /// can proceed.
    pub fn abort_handshake(mut self) {
        if let Some(device_index) = self.device_index.take() {
            let _ = release_device(device_index);
        }
        self.playback = None;
        self.capture = None;
        self.state = HandshakeState::Init;
    }
}

fn decode_i32(buf: &[u8]) -> DspdResult<i32> {
    if buf.len() < 4 {
        return Err(DspdError::Protocol);
    }
    Ok(i32::from_le_bytes(buf[0..4].try_into().unwrap()))
}
