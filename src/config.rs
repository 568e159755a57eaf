//! Runtime settings for the pipeline.
//!
//! Command-line arguments are collapsed into one immutable [`Settings`]
//! value before the player starts; every component reads its knobs from
//! the copy it was handed at construction and nothing mutates them
//! afterwards.

use std::{str::FromStr, time::Duration};

/// CRC validation policy for formats that carry checksums.
///
/// Applies to FLAC frame CRC-8/CRC-16 and Ogg page CRC-32.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CrcMode {
    /// Checksums are not computed.
    Disabled,

    /// Checksums are verified; mismatches are counted and logged, and
    /// verification auto-disables past an error threshold.
    #[default]
    Enabled,

    /// Checksums are verified; mismatched units are rejected.
    Strict,
}

impl FromStr for CrcMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(Self::Disabled),
            "enabled" | "on" => Ok(Self::Enabled),
            "strict" => Ok(Self::Strict),
            other => Err(format!(
                "unknown CRC mode {other:?} (expected disabled, enabled or strict)"
            )),
        }
    }
}

impl std::fmt::Display for CrcMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
            Self::Strict => "strict",
        })
    }
}

/// Immutable runtime settings.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Cap on live + pooled bytes in the chunk pool.
    pub pool_cap_bytes: usize,

    /// Capacity of the decoded-PCM ring, in samples.
    pub ring_capacity: usize,

    /// Checksum validation policy.
    pub crc_mode: CrcMode,

    /// Whole-request timeout for HTTP range reads.
    pub http_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pool_cap_bytes: 32 * 1024 * 1024,
            // Half a second of 48 kHz stereo keeps the callback fed across
            // a worker hiccup without adding noticeable seek latency.
            ring_capacity: 48_000,
            crc_mode: CrcMode::default(),
            http_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_mode_parses_all_spellings() {
        assert_eq!("off".parse::<CrcMode>(), Ok(CrcMode::Disabled));
        assert_eq!("Enabled".parse::<CrcMode>(), Ok(CrcMode::Enabled));
        assert_eq!("strict".parse::<CrcMode>(), Ok(CrcMode::Strict));
        assert!("paranoid".parse::<CrcMode>().is_err());
    }
}
