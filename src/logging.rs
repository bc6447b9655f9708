// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// `tracing` initialization. Every long-running component (event loop,
// work queue, remote client handshake) emits structured spans/events
// through the `tracing` facade instead of printing directly, so a host
// process can route them wherever it likes.

use tracing_subscriber::EnvFilter;

/// Install a global subscriber reading its filter from `DSPD_LOG`
/// (falling back to `info`). Safe to call more than once — subsequent
/// calls are no-ops, since a process only ever wants one global
/// subscriber.
pub fn init() {
    let filter = EnvFilter::try_from_env("DSPD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
