// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-wide configuration: default stream parameters, the event loop's
// worker-thread count, and the transport a client should use to reach the
// local server. Loaded from a JSON file (path via `DSPD_CONFIG`) with
// built-in defaults when unset.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::pcm::format::PcmFormat;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, #[source] source: std::io::Error },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

fn default_format() -> PcmFormatConfig {
    PcmFormatConfig::S16Le
}

/// Serde-friendly mirror of [`PcmFormat`] — kept separate so the wire enum
/// doesn't need to grow `Serialize`/`Deserialize` derives it has no other
/// use for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PcmFormatConfig {
    U8,
    S8,
    S16Le,
    S16Be,
    U16Le,
    U16Be,
    S32Le,
    S32Be,
    U32Le,
    U32Be,
    Float32Le,
    Float64Le,
}

impl From<PcmFormatConfig> for PcmFormat {
    fn from(value: PcmFormatConfig) -> Self {
        match value {
            PcmFormatConfig::U8 => PcmFormat::U8,
            PcmFormatConfig::S8 => PcmFormat::S8,
            PcmFormatConfig::S16Le => PcmFormat::S16Le,
            PcmFormatConfig::S16Be => PcmFormat::S16Be,
            PcmFormatConfig::U16Le => PcmFormat::U16Le,
            PcmFormatConfig::U16Be => PcmFormat::U16Be,
            PcmFormatConfig::S32Le => PcmFormat::S32Le,
            PcmFormatConfig::S32Be => PcmFormat::S32Be,
            PcmFormatConfig::U32Le => PcmFormat::U32Le,
            PcmFormatConfig::U32Be => PcmFormat::U32Be,
            PcmFormatConfig::Float32Le => PcmFormat::Float32Le,
            PcmFormatConfig::Float64Le => PcmFormat::Float64Le,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DspdConfig {
    #[serde(default = "default_format")]
    pub default_format: PcmFormatConfig,
    #[serde(default = "default_rate")]
    pub default_rate: u32,
    #[serde(default = "default_channels")]
    pub default_channels: u32,
    #[serde(default = "default_fragsize")]
    pub default_fragsize_frames: u32,
    #[serde(default = "default_bufsize")]
    pub default_bufsize_frames: u32,
    #[serde(default = "default_work_threads")]
    pub work_threads: usize,
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

fn default_rate() -> u32 {
    48_000
}

fn default_channels() -> u32 {
    2
}

fn default_fragsize() -> u32 {
    256
}

fn default_bufsize() -> u32 {
    1024
}

fn default_work_threads() -> usize {
    2
}

fn default_socket_path() -> String {
    "/tmp/dspd.sock".to_string()
}

impl Default for DspdConfig {
    fn default() -> Self {
        Self {
            default_format: default_format(),
            default_rate: default_rate(),
            default_channels: default_channels(),
            default_fragsize_frames: default_fragsize(),
            default_bufsize_frames: default_bufsize(),
            work_threads: default_work_threads(),
            socket_path: default_socket_path(),
        }
    }
}

impl DspdConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let text = std::fs::read_to_string(path_ref)
            .map_err(|source| ConfigError::Read { path: path_ref.display().to_string(), source })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Read `DSPD_CONFIG` if set, otherwise fall back to built-in defaults.
    /// Never fails on a missing env var; a present-but-unreadable/invalid
    /// file is still an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var("DSPD_CONFIG") {
            Ok(path) => Self::from_file(path),
            Err(_) => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let cfg = DspdConfig::default();
        assert_eq!(cfg.default_rate, 48_000);
        assert!(cfg.default_bufsize_frames >= cfg.default_fragsize_frames);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let cfg: DspdConfig = serde_json::from_str(r#"{"default_rate": 44100}"#).unwrap();
        assert_eq!(cfg.default_rate, 44_100);
        assert_eq!(cfg.default_channels, 2);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = DspdConfig::from_file("/nonexistent/path/dspd.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
