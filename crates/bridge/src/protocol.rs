//! Wire constants shared by capture clients, the bridge and the inference peer.
//!
//! Two framing conventions exist side by side:
//! - capture frames: `[i32 big-endian length][payload]`
//! - inference requests: `[mode byte]` followed by `[u32 little-endian length][payload]` fields

use crate::errors::FrameError;

/// Upper bound on a single declared payload length (100 MB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 100_000_000;

/// Size of every length prefix, on both protocols.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Body the inference peer answers a health probe with.
pub const HEALTH_OK: &str = "OK";

/// Request kind selected by the first byte of an inference request.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No fields; the peer answers `OK` and closes.
    Health = 0x01,
    /// Two fields: TOP image then SIDE image.
    Dual = 0x02,
    /// Two fields: camera label (UTF-8) then image.
    Single = 0x03,
}

impl Mode {
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x01 => Ok(Mode::Health),
            0x02 => Ok(Mode::Dual),
            0x03 => Ok(Mode::Single),
            other => Err(FrameError::UnknownMode(other)),
        }
    }

    /// Number of length-prefixed fields following the mode byte.
    pub fn field_count(&self) -> usize {
        match self {
            Mode::Health => 0,
            Mode::Dual | Mode::Single => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bytes_match_peer() {
        assert_eq!(Mode::Health as u8, 0x01);
        assert_eq!(Mode::Dual as u8, 0x02);
        assert_eq!(Mode::Single as u8, 0x03);
    }

    #[test]
    fn test_mode_from_u8() {
        assert_eq!(Mode::from_u8(0x02).unwrap(), Mode::Dual);
        assert!(matches!(
            Mode::from_u8(0x7f),
            Err(FrameError::UnknownMode(0x7f))
        ));
    }

    #[test]
    fn test_field_counts() {
        assert_eq!(Mode::Health.field_count(), 0);
        assert_eq!(Mode::Dual.field_count(), 2);
        assert_eq!(Mode::Single.field_count(), 2);
    }

    #[test]
    fn test_max_frame_len_reasonable() {
        assert!(DEFAULT_MAX_FRAME_LEN >= 10 * 1024 * 1024);
        assert!(DEFAULT_MAX_FRAME_LEN <= i32::MAX as usize);
    }
}
