// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// PCM data-plane: per-stream state machine, format conversion, and the
// client object that binds up to two streams to one device (§4.3, §4.4).

pub mod client;
pub mod format;
pub mod status;
pub mod stream;

pub use client::{ClientState, PcmClient, SwParams, SBIT_CAPTURE, SBIT_PLAYBACK};
pub use format::PcmFormat;
pub use status::PcmStatus;
pub use stream::{Direction, PcmStream, StreamParams, StreamState, Wakeup};
