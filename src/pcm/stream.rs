// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// One half-duplex PCM stream: FIFO + MBX + format converter + pointer
// bookkeeping (§4.3). A full-duplex client instantiates two of these
// (see pcm::client).

use crate::clock;
use crate::error::{DspdError, DspdResult};
use crate::fifo::Fifo;
use crate::mbx::Mbx;
use crate::pcm::format::PcmFormat;
use crate::pcm::status::PcmStatus;
use crate::shm_layout::{SectionId, ShmLayout};

/// Grace period after the initial trigger before xruns are reported, as a
/// fraction of one fragment. Named rather than inlined since the 0.5
/// factor is load-bearing and easy to lose in a refactor (§9).
pub const XRUN_GRACE_FRAGMENTS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Playback,
    Capture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Init,
    Bound,
    Prepared,
    Paused,
    Running,
    Error,
}

/// Result of [`PcmStream::get_next_wakeup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// `avail_min` frames are already available.
    Now,
    /// No timer needed (stream not running).
    None,
    /// Arm a timer for this absolute monotonic time.
    At(u64),
}

/// Stream parameters negotiated with the device (subset of §6's
/// `dspd_cli_params` relevant to one direction).
#[derive(Debug, Clone, Copy)]
pub struct StreamParams {
    pub format: PcmFormat,
    pub channels: u32,
    pub rate: u32,
    pub bufsize_frames: u32,
    pub fragsize_frames: u32,
}

impl StreamParams {
    pub fn frame_bytes(&self) -> u32 {
        self.format.sample_bytes() as u32 * self.channels
    }

    pub fn sample_period_ns(&self) -> u64 {
        1_000_000_000u64 / self.rate as u64
    }
}

pub struct PcmStream {
    direction: Direction,
    params: StreamParams,
    state: StreamState,
    fifo: Option<Fifo>,
    mbx: Option<Mbx<PcmStatus>>,
    hw_ptr: u64,
    appl_ptr: u64,
    error: Option<DspdError>,
    no_xrun: bool,
    constant_latency: bool,
    trigger_tstamp: Option<u64>,
    last_status: PcmStatus,
    /// Clock-drift accumulator nudging `get_next_wakeup`, bounded to
    /// ±(fragment_time / 2) per §4.4.
    drift_ns: i64,
}

impl PcmStream {
    pub fn new(direction: Direction, params: StreamParams) -> Self {
        Self {
            direction,
            params,
            state: StreamState::Init,
            fifo: None,
            mbx: None,
            hw_ptr: 0,
            appl_ptr: 0,
            error: None,
            no_xrun: false,
            constant_latency: false,
            trigger_tstamp: None,
            last_status: PcmStatus::default(),
            drift_ns: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn set_no_xrun(&mut self, no_xrun: bool) {
        self.no_xrun = no_xrun;
    }

    pub fn set_constant_latency(&mut self, enable: bool) {
        self.constant_latency = enable;
    }

    fn bufsize(&self) -> u32 {
        self.params.bufsize_frames
    }

    fn frame_bytes(&self) -> u32 {
        self.params.frame_bytes()
    }

    /// Bind to an existing shared-memory layout containing one FIFO section
    /// and one mailbox section. Validates section sizes against
    /// `bufsize * frame_bytes` and `mailbox_bufsize(sizeof(status))`.
    /// Allowed only from [`StreamState::Init`].
    ///
    /// # Safety
    /// `layout` must outlive the returned bindings; `init` selects whether
    /// this call initializes fresh storage (`true`, first opener) or attaches
    /// to storage another party already initialized (`false`).
    pub unsafe fn attach(&mut self, layout: &ShmLayout, init: bool) -> DspdResult<()> {
        if self.state != StreamState::Init {
            return Err(DspdError::BadF);
        }
        let (fifo_ptr, fifo_len) = layout.section(SectionId::Fifo).ok_or(DspdError::Invalid)?;
        let (mbx_ptr, mbx_len) = layout.section(SectionId::Mbx).ok_or(DspdError::Invalid)?;

        let want_fifo = self.bufsize() as usize * self.frame_bytes() as usize;
        if fifo_len != Fifo::storage_size(want_fifo as u32) {
            return Err(DspdError::Invalid);
        }
        if mbx_len != Mbx::<PcmStatus>::storage_size() {
            return Err(DspdError::Invalid);
        }

        self.fifo = Some(Fifo::from_raw(fifo_ptr, want_fifo as u32, init));
        self.mbx = Some(Mbx::from_raw(mbx_ptr, init));
        self.state = StreamState::Bound;
        Ok(())
    }

    fn fifo(&self) -> DspdResult<&Fifo> {
        self.fifo.as_ref().ok_or(DspdError::BadF)
    }

    fn check_direction(&self, want: Direction) -> DspdResult<()> {
        if self.direction != want {
            return Err(DspdError::BadFd);
        }
        Ok(())
    }

    fn raise(&mut self, err: DspdError) -> DspdError {
        if !err.is_transient() {
            self.error = Some(err);
            self.state = StreamState::Error;
        }
        err
    }

    /// Convert `bytes` (external format) to interleaved float32 and push
    /// into the FIFO. Partial transfers permitted.
    pub fn write(&mut self, bytes: &[u8]) -> DspdResult<usize> {
        self.check_direction(Direction::Playback)?;
        if let Some(e) = self.error {
            return Err(e);
        }
        if let Err(e) = self.check_xrun() {
            return Err(self.raise(e));
        }
        let frame_bytes = self.frame_bytes() as usize;
        let float_frame_bytes = self.params.channels as usize * 4;
        let frames = bytes.len() / frame_bytes;
        let mut converted = vec![0u8; frames * float_frame_bytes];
        for f in 0..frames {
            for c in 0..self.params.channels as usize {
                let s = self.params.format.sample_bytes();
                let src = &bytes[f * frame_bytes + c * s..][..s];
                let v = self.params.format.to_float32(src).map_err(|e| self.raise(e))?;
                let dst = &mut converted[f * float_frame_bytes + c * 4..][..4];
                dst.copy_from_slice(&v.to_le_bytes());
            }
        }
        let fifo = self.fifo()?;
        let written_bytes = fifo.write(&converted).map_err(|e| self.raise(e))?;
        let written_frames = (written_bytes / float_frame_bytes) as u64;
        self.appl_ptr += written_frames;
        if written_bytes == 0 {
            return Err(DspdError::Again);
        }
        Ok(written_frames as usize * frame_bytes)
    }

    /// Pull interleaved float32 frames out of the FIFO and convert to the
    /// caller's external format.
    pub fn read(&mut self, out: &mut [u8]) -> DspdResult<usize> {
        self.check_direction(Direction::Capture)?;
        if let Some(e) = self.error {
            return Err(e);
        }
        if let Err(e) = self.check_xrun() {
            return Err(self.raise(e));
        }
        let frame_bytes = self.frame_bytes() as usize;
        let float_frame_bytes = self.params.channels as usize * 4;
        let frames = out.len() / frame_bytes;
        let mut raw = vec![0u8; frames * float_frame_bytes];
        let fifo = self.fifo()?;
        let got_bytes = fifo.read(&mut raw).map_err(|e| self.raise(e))?;
        if got_bytes == 0 {
            return Err(DspdError::Again);
        }
        let got_frames = got_bytes / float_frame_bytes;
        for f in 0..got_frames {
            for c in 0..self.params.channels as usize {
                let v = f32::from_le_bytes(
                    raw[f * float_frame_bytes + c * 4..][..4].try_into().unwrap(),
                );
                let s = self.params.format.sample_bytes();
                let dst = &mut out[f * frame_bytes + c * s..][..s];
                self.params.format.from_float32(v, dst).map_err(|e| self.raise(e))?;
            }
        }
        self.appl_ptr += got_frames as u64;
        Ok(got_frames * frame_bytes)
    }

    fn occupancy(&self) -> DspdResult<u32> {
        let fifo = self.fifo()?;
        let c = fifo.length()?;
        let float_frame_bytes = self.params.channels * 4;
        Ok(c.count / float_frame_bytes)
    }

    /// Writable frames (playback) or readable frames (capture).
    pub fn avail(&self) -> DspdResult<u32> {
        let fill = self.occupancy()?;
        Ok(match self.direction {
            Direction::Playback => self.bufsize().saturating_sub(fill),
            Direction::Capture => fill,
        })
    }

    /// Refresh from the mailbox (if `sync`) and extrapolate `delay`/`tstamp`
    /// forward using the stored sample period and wall-clock.
    pub fn status(&mut self, sync: bool) -> DspdResult<PcmStatus> {
        if sync {
            if let Some(mbx) = &self.mbx {
                if let Some((s, _v)) = mbx.read() {
                    self.last_status = s;
                    self.hw_ptr = s.hw_ptr;
                }
            }
        }
        let now = clock::now_ns();
        let elapsed_ns = now.saturating_sub(self.last_status.tstamp);
        let period = self.params.sample_period_ns().max(1);
        let elapsed_frames = elapsed_ns / period;
        let fill = self.occupancy()?;
        let (extrap_appl, extrap_hw) = match self.direction {
            Direction::Playback => (self.appl_ptr, self.last_status.hw_ptr + elapsed_frames),
            Direction::Capture => (self.appl_ptr, self.last_status.hw_ptr + elapsed_frames),
        };
        let space = match self.direction {
            Direction::Playback => self.bufsize().saturating_sub(fill),
            Direction::Capture => self.bufsize().saturating_sub(fill),
        };
        Ok(PcmStatus {
            appl_ptr: extrap_appl,
            hw_ptr: extrap_hw,
            tstamp: now,
            fill,
            space,
            delay: extrap_appl as i64 - extrap_hw as i64,
            error: self.error.map(|_| -1).unwrap_or(0),
        })
    }

    /// Move `appl_ptr` backwards by up to `n` frames, bounded by the safe
    /// rewind amount unless `no_xrun` is set. Returns the amount moved.
    pub fn rewind(&mut self, n: u64) -> DspdResult<u64> {
        let fifo = self.fifo()?;
        let max = if self.no_xrun { n } else { n.min(self.occupancy()? as u64) };
        let float_frame_bytes = self.params.channels * 4;
        fifo.commit_write(((max as u32 * float_frame_bytes) as u32).wrapping_neg());
        self.appl_ptr = self.appl_ptr.saturating_sub(max);
        Ok(max)
    }

    /// Move `appl_ptr` forward by up to `n` frames (undoing a rewind).
    pub fn forward(&mut self, n: u64) -> DspdResult<u64> {
        let float_frame_bytes = self.params.channels * 4;
        let fifo = self.fifo()?;
        let avail = self.avail()? as u64;
        let max = if self.no_xrun { n } else { n.min(avail) };
        fifo.commit_write(max as u32 * float_frame_bytes);
        self.appl_ptr += max;
        Ok(max)
    }

    /// Set `appl_ptr` to an absolute or relative value and issue the
    /// matching FIFO commit. Exposed as two call sites (absolute/relative)
    /// per §9's design note rather than one ambiguous flag.
    pub fn set_pointer_absolute(&mut self, value: u64) -> DspdResult<()> {
        let delta = value as i64 - self.appl_ptr as i64;
        self.apply_pointer_delta(delta)
    }

    pub fn set_pointer_relative(&mut self, delta_frames: i64) -> DspdResult<()> {
        self.apply_pointer_delta(delta_frames)
    }

    fn apply_pointer_delta(&mut self, delta: i64) -> DspdResult<()> {
        let float_frame_bytes = self.params.channels * 4;
        let fifo = self.fifo()?;
        let n = (delta.unsigned_abs() as u32) * float_frame_bytes;
        if delta >= 0 {
            fifo.commit_write(n);
        } else {
            fifo.commit_write(n.wrapping_neg());
        }
        self.appl_ptr = (self.appl_ptr as i64 + delta).max(0) as u64;
        Ok(())
    }

    /// If `avail >= xrun_threshold` while `Running` and the grace period
    /// has elapsed, signal `Pipe`.
    pub fn check_xrun(&mut self) -> DspdResult<()> {
        if self.state != StreamState::Running || self.no_xrun {
            return Ok(());
        }
        let Some(trigger) = self.trigger_tstamp else { return Ok(()) };
        let grace_ns =
            (self.params.fragsize_frames as f64 * XRUN_GRACE_FRAGMENTS) as u64 * self.params.sample_period_ns();
        if clock::now_ns().saturating_sub(trigger) < grace_ns {
            return Ok(());
        }
        let avail = self.avail()?;
        let xrun_threshold = self.bufsize();
        if avail >= xrun_threshold {
            self.state = StreamState::Error;
            return Err(DspdError::Pipe);
        }
        Ok(())
    }

    /// Compute the wall-clock time by which `avail_min` frames will be
    /// available, applying the clock-drift accumulator.
    pub fn get_next_wakeup(&mut self, avail_min: u32) -> DspdResult<Wakeup> {
        if self.state != StreamState::Running {
            return Ok(Wakeup::None);
        }
        let avail = self.avail()?;
        if avail >= avail_min {
            return Ok(Wakeup::Now);
        }
        let missing = (avail_min - avail) as u64;
        let base = missing * self.params.sample_period_ns();
        let fragment_time = self.params.fragsize_frames as i64 * self.params.sample_period_ns() as i64;
        let bound = (fragment_time / 2).max(self.params.sample_period_ns() as i64 / 2);
        let drift = self.drift_ns.clamp(-bound, bound);
        let deadline = clock::now_ns() as i64 + base as i64 + drift;
        Ok(Wakeup::At(deadline.max(0) as u64))
    }

    /// Feed back the residual between a requested and actually observed
    /// availability at wakeup time, nudging future deadlines.
    pub fn record_wakeup_drift(&mut self, residual_ns: i64) {
        let fragment_time = self.params.fragsize_frames as i64 * self.params.sample_period_ns() as i64;
        let bound = (fragment_time / 2).max(self.params.sample_period_ns() as i64 / 2);
        self.drift_ns = (self.drift_ns + residual_ns).clamp(-bound, bound);
    }

    pub fn set_trigger_tstamp(&mut self, tstamp: u64) {
        self.trigger_tstamp = Some(tstamp);
    }

    pub fn set_running(&mut self, running: bool) -> DspdResult<()> {
        match (self.state, running) {
            (StreamState::Prepared, true) | (StreamState::Paused, true) => {
                self.state = StreamState::Running;
                self.set_trigger_tstamp(clock::now_ns());
                Ok(())
            }
            (StreamState::Running, false) => {
                self.state = StreamState::Prepared;
                Ok(())
            }
            _ => Err(DspdError::BadF),
        }
    }

    pub fn set_paused(&mut self, paused: bool) -> DspdResult<()> {
        match (self.state, paused) {
            (StreamState::Running, true) => {
                self.state = StreamState::Paused;
                Ok(())
            }
            (StreamState::Paused, false) => {
                self.state = StreamState::Running;
                Ok(())
            }
            _ => Err(DspdError::BadF),
        }
    }

    /// Return to `Prepared`, zeroing all pointers and the mailbox. Used to
    /// recover from an xrun (`Pipe`) or hardware suspend (`Strpipe`).
    pub fn reset(&mut self) -> DspdResult<()> {
        if self.state == StreamState::Init {
            return Err(DspdError::BadF);
        }
        self.hw_ptr = 0;
        self.appl_ptr = 0;
        self.error = None;
        self.trigger_tstamp = None;
        self.last_status = PcmStatus::default();
        if let Some(fifo) = &self.fifo {
            fifo.reset();
        }
        if let Some(mbx) = &self.mbx {
            mbx.reset();
        }
        self.state = StreamState::Prepared;
        Ok(())
    }

    pub fn prepare(&mut self) -> DspdResult<()> {
        if self.state != StreamState::Bound && self.state != StreamState::Prepared {
            return Err(DspdError::BadF);
        }
        self.state = StreamState::Prepared;
        Ok(())
    }
}
