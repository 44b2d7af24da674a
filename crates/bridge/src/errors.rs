use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure to decode or encode a length-prefixed frame.
///
/// Aborts the connection it happened on and nothing else.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Invalid frame length: {0}")]
    InvalidLength(i64),

    #[error("Frame length {len} exceeds maximum of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("Incomplete frame: expected {expected} bytes, received {received}")]
    IncompleteFrame { expected: usize, received: usize },

    #[error("Unknown inference mode: {0:#04x}")]
    UnknownMode(u8),
}

/// Failure talking to the inference peer.
///
/// Callers treat any variant as "no verdict available".
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to connect to inference peer {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("Failed to send request to inference peer: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to read response from inference peer: {0}")]
    Read(#[source] io::Error),

    #[error("Request encoding failed: {0}")]
    Frame(#[from] FrameError),

    #[error("Inference peer did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Inference peer reported unhealthy: {0:?}")]
    Unhealthy(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_frame_error_display_formatting() {
        assert_eq!(
            FrameError::InvalidLength(-4).to_string(),
            "Invalid frame length: -4"
        );
        assert_eq!(
            FrameError::TooLarge { len: 200, max: 100 }.to_string(),
            "Frame length 200 exceeds maximum of 100 bytes"
        );
        assert_eq!(
            FrameError::IncompleteFrame {
                expected: 10,
                received: 3
            }
            .to_string(),
            "Incomplete frame: expected 10 bytes, received 3"
        );
        assert_eq!(
            FrameError::UnknownMode(0x09).to_string(),
            "Unknown inference mode: 0x09"
        );
    }

    #[test]
    fn test_frame_error_variants_all_come_from_the_codec() {
        // No wildcard arm: read timeouts are reported by the session.
        fn codec_origin(err: &FrameError) -> &'static str {
            match err {
                FrameError::IoError(_) => "io",
                FrameError::InvalidLength(_) | FrameError::TooLarge { .. } => "prefix",
                FrameError::IncompleteFrame { .. } => "body",
                FrameError::UnknownMode(_) => "mode",
            }
        }

        assert_eq!(codec_origin(&FrameError::InvalidLength(0)), "prefix");
        assert_eq!(
            codec_origin(&FrameError::IncompleteFrame {
                expected: 4,
                received: 1
            }),
            "body"
        );
        assert_eq!(codec_origin(&FrameError::UnknownMode(0x7f)), "mode");
    }

    #[test]
    fn test_frame_error_conversion_from_io_error() {
        fn returns_io_error() -> Result<(), io::Error> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        }

        fn uses_question_mark() -> Result<(), FrameError> {
            returns_io_error()?;
            Ok(())
        }

        match uses_question_mark().unwrap_err() {
            FrameError::IoError(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("Expected IoError variant, got {other:?}"),
        }
    }

    #[test]
    fn test_bridge_error_keeps_cause() {
        let err = BridgeError::Connect {
            addr: "10.0.0.1:8009".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert_eq!(
            err.to_string(),
            "Failed to connect to inference peer 10.0.0.1:8009: refused"
        );
        assert!(err.source().is_some(), "Underlying cause should be attached");

        let err = BridgeError::Read(io::Error::other("eof"));
        assert_eq!(err.source().unwrap().to_string(), "eof");
    }

    #[test]
    fn test_bridge_error_timeout_display() {
        let err = BridgeError::Timeout(Duration::from_secs(2));
        assert_eq!(err.to_string(), "Inference peer did not answer within 2s");
    }
}
