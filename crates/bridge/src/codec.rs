//! Length-prefixed framing for both wire protocols.

use crate::errors::FrameError;
use crate::protocol::{LENGTH_PREFIX_LEN, Mode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads one capture frame: `[i32 big-endian length][payload]`.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly before sending
/// any byte of the next length prefix.
pub async fn read_capture_frame<R>(
    reader: &mut R,
    max_len: usize,
) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    match read_capture_length(reader, max_len).await? {
        Some(len) => read_frame_body(reader, len).await.map(Some),
        None => Ok(None),
    }
}

/// Reads and validates the length prefix of a capture frame.
///
/// The declared length is checked before any body buffer is allocated.
/// `Ok(None)` means a clean close between frames.
pub async fn read_capture_length<R>(
    reader: &mut R,
    max_len: usize,
) -> Result<Option<usize>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    let received = read_full(reader, &mut prefix).await?;
    if received == 0 {
        return Ok(None);
    }
    if received < LENGTH_PREFIX_LEN {
        return Err(FrameError::IncompleteFrame {
            expected: LENGTH_PREFIX_LEN,
            received,
        });
    }

    validate_length(i32::from_be_bytes(prefix).into(), max_len).map(Some)
}

/// Reads exactly `len` payload bytes or fails with `IncompleteFrame`.
pub async fn read_frame_body<R>(reader: &mut R, len: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut body = vec![0u8; len];
    let received = read_full(reader, &mut body).await?;
    if received < len {
        return Err(FrameError::IncompleteFrame {
            expected: len,
            received,
        });
    }
    Ok(body)
}

/// Writes one capture frame. Used by capture clients and tests.
pub async fn write_capture_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&capture_prefix(payload)?).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub fn encode_capture_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&capture_prefix(payload)?);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Writes an inference request: the mode byte, then each field as
/// `[u32 little-endian length][payload]`.
///
/// Fields are written straight from the caller's buffers, images are never copied.
pub async fn write_inference_request<W>(
    writer: &mut W,
    mode: Mode,
    fields: &[&[u8]],
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u8(mode as u8).await?;
    for field in fields {
        writer.write_all(&inference_prefix(field)?).await?;
        writer.write_all(field).await?;
    }
    writer.flush().await?;
    Ok(())
}

pub fn encode_inference_request(mode: Mode, fields: &[&[u8]]) -> Result<Vec<u8>, FrameError> {
    let total: usize = fields.iter().map(|f| LENGTH_PREFIX_LEN + f.len()).sum();
    let mut frame = Vec::with_capacity(1 + total);
    frame.push(mode as u8);
    for field in fields {
        frame.extend_from_slice(&inference_prefix(field)?);
        frame.extend_from_slice(field);
    }
    Ok(frame)
}

/// Reads an inference request as the peer sees it. Used by peer stubs.
pub async fn read_inference_request<R>(
    reader: &mut R,
    max_len: usize,
) -> Result<(Mode, Vec<Vec<u8>>), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut mode = [0u8; 1];
    if read_full(reader, &mut mode).await? == 0 {
        return Err(FrameError::IncompleteFrame {
            expected: 1,
            received: 0,
        });
    }
    let mode = Mode::from_u8(mode[0])?;

    let mut fields = Vec::with_capacity(mode.field_count());
    for _ in 0..mode.field_count() {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        let received = read_full(reader, &mut prefix).await?;
        if received < LENGTH_PREFIX_LEN {
            return Err(FrameError::IncompleteFrame {
                expected: LENGTH_PREFIX_LEN,
                received,
            });
        }
        let len = validate_length(u32::from_le_bytes(prefix).into(), max_len)?;
        fields.push(read_frame_body(reader, len).await?);
    }

    Ok((mode, fields))
}

/// Checks a declared length against `(0, max_len]`.
pub fn validate_length(declared: i64, max_len: usize) -> Result<usize, FrameError> {
    if declared <= 0 {
        return Err(FrameError::InvalidLength(declared));
    }
    let len = usize::try_from(declared).map_err(|_| FrameError::InvalidLength(declared))?;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }
    Ok(len)
}

fn capture_prefix(payload: &[u8]) -> Result<[u8; LENGTH_PREFIX_LEN], FrameError> {
    let len = i32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        len: payload.len(),
        max: i32::MAX as usize,
    })?;
    Ok(len.to_be_bytes())
}

fn inference_prefix(payload: &[u8]) -> Result<[u8; LENGTH_PREFIX_LEN], FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    Ok(len.to_le_bytes())
}

/// Fills `buf` unless the stream ends first; returns how many bytes arrived.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_MAX_FRAME_LEN;

    #[tokio::test]
    async fn test_capture_frame_round_trip() {
        let large = vec![7u8; 70_000];
        let payloads = [&b"x"[..], &b"\xff\xd8\xff\xe0jpeg-ish"[..], &large[..]];

        for payload in payloads {
            let frame = encode_capture_frame(payload).unwrap();
            let mut reader = frame.as_slice();
            let decoded = read_capture_frame(&mut reader, DEFAULT_MAX_FRAME_LEN)
                .await
                .unwrap()
                .expect("frame should decode");
            assert_eq!(decoded, payload);
            assert!(reader.is_empty(), "Decoder must consume exactly one frame");
        }
    }

    #[tokio::test]
    async fn test_capture_prefix_is_big_endian() {
        let frame = encode_capture_frame(&[0u8; 258]).unwrap();
        assert_eq!(&frame[..4], &[0, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_zero_and_negative_lengths_rejected() {
        for prefix in [0i32.to_be_bytes(), (-1i32).to_be_bytes(), i32::MIN.to_be_bytes()] {
            let mut input: Vec<u8> = prefix.to_vec();
            input.extend_from_slice(b"trailing body that must not be read");
            let mut reader = input.as_slice();

            let err = read_capture_frame(&mut reader, DEFAULT_MAX_FRAME_LEN)
                .await
                .unwrap_err();
            assert!(matches!(err, FrameError::InvalidLength(n) if n <= 0));
            assert_eq!(
                reader.len(),
                input.len() - 4,
                "Body must not be touched after a bad length"
            );
        }
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let input = 1_001i32.to_be_bytes();
        let mut reader = input.as_slice();
        let err = read_capture_frame(&mut reader, 1_000).await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::TooLarge {
                len: 1_001,
                max: 1_000
            }
        ));
    }

    #[tokio::test]
    async fn test_clean_close_is_not_an_error() {
        let mut reader: &[u8] = &[];
        assert!(
            read_capture_frame(&mut reader, DEFAULT_MAX_FRAME_LEN)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_truncated_prefix_and_body() {
        let mut reader: &[u8] = &[0, 0];
        assert!(matches!(
            read_capture_frame(&mut reader, DEFAULT_MAX_FRAME_LEN).await,
            Err(FrameError::IncompleteFrame {
                expected: 4,
                received: 2
            })
        ));

        let mut input = 10i32.to_be_bytes().to_vec();
        input.extend_from_slice(b"abc");
        let mut reader = input.as_slice();
        assert!(matches!(
            read_capture_frame(&mut reader, DEFAULT_MAX_FRAME_LEN).await,
            Err(FrameError::IncompleteFrame {
                expected: 10,
                received: 3
            })
        ));
    }

    #[test]
    fn test_inference_request_layout() {
        let top: &[u8] = b"top";
        let side: &[u8] = b"si";
        let frame = encode_inference_request(Mode::Dual, &[top, side]).unwrap();

        let mut expected = vec![0x02];
        expected.extend_from_slice(&3u32.to_le_bytes());
        expected.extend_from_slice(top);
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(side);
        assert_eq!(frame, expected);

        let health = encode_inference_request(Mode::Health, &[]).unwrap();
        assert_eq!(health, vec![0x01]);
    }

    #[tokio::test]
    async fn test_written_request_matches_encoded() {
        let label: &[u8] = b"side";
        let image: &[u8] = b"image";
        let mut written = Vec::new();
        write_inference_request(&mut written, Mode::Single, &[label, image])
            .await
            .unwrap();
        assert_eq!(
            written,
            encode_inference_request(Mode::Single, &[label, image]).unwrap()
        );
    }

    #[tokio::test]
    async fn test_read_inference_request() {
        let label: &[u8] = b"top";
        let image: &[u8] = b"pixels";
        let frame = encode_inference_request(Mode::Single, &[label, image]).unwrap();
        let mut reader = frame.as_slice();
        let (mode, fields) = read_inference_request(&mut reader, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        assert_eq!(mode, Mode::Single);
        assert_eq!(fields, vec![label.to_vec(), image.to_vec()]);
    }

    #[tokio::test]
    async fn test_read_inference_request_unknown_mode() {
        let mut reader: &[u8] = &[0x09, 0, 0, 0, 0];
        assert!(matches!(
            read_inference_request(&mut reader, DEFAULT_MAX_FRAME_LEN).await,
            Err(FrameError::UnknownMode(0x09))
        ));
    }

    #[test]
    fn test_validate_length_bounds() {
        assert_eq!(validate_length(1, 1).unwrap(), 1);
        assert!(matches!(validate_length(0, 1), Err(FrameError::InvalidLength(0))));
        assert!(matches!(
            validate_length(2, 1),
            Err(FrameError::TooLarge { len: 2, max: 1 })
        ));
    }
}
