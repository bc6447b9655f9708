// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Monotonic nanosecond clock used for all absolute-time deadlines (§5).
// `u64::MAX` means "no timeout"; `0` means "already expired".

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Current monotonic time in nanoseconds since the clock was first touched
/// in this process. Never wraps in practice (584 years of range).
pub fn now_ns() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Deadline meaning "never".
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Deadline meaning "already expired".
pub const EXPIRED: u64 = 0;
