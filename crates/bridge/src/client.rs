use crate::codec::write_inference_request;
use crate::errors::{BridgeError, FrameError};
use crate::protocol::{HEALTH_OK, Mode};
use schema::Camera;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::Instrument;

/// One-shot request/response client for the inference peer.
///
/// Every call opens a fresh connection, writes a single request and reads the
/// peer's answer until it closes the socket. There is no pooling and no retry.
#[derive(Debug, Clone)]
pub struct InferenceClient {
    addr: String,
    timeout: Duration,
}

impl InferenceClient {
    /// `timeout` bounds the whole exchange, connect included.
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends a TOP/SIDE pair and returns the raw response text.
    pub async fn analyze(&self, top: &[u8], side: &[u8]) -> Result<String, BridgeError> {
        let span = tracing::debug_span!(
            "inference_dual",
            peer = %self.addr,
            top_bytes = top.len(),
            side_bytes = side.len()
        );
        self.exchange(Mode::Dual, &[top, side])
            .instrument(span)
            .await
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
    }

    /// Sends a single image tagged with the camera that took it.
    pub async fn analyze_single(&self, camera: Camera, image: &[u8]) -> Result<String, BridgeError> {
        let span = tracing::debug_span!(
            "inference_single",
            peer = %self.addr,
            camera = %camera,
            bytes = image.len()
        );
        self.exchange(Mode::Single, &[camera.as_str().as_bytes(), image])
            .instrument(span)
            .await
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
    }

    /// Asks the peer whether it is serving. Succeeds only on an `OK` answer.
    pub async fn health_check(&self) -> Result<(), BridgeError> {
        let raw = self.exchange(Mode::Health, &[]).await?;
        let answer = String::from_utf8_lossy(&raw);
        if answer.trim() == HEALTH_OK {
            Ok(())
        } else {
            Err(BridgeError::Unhealthy(answer.into_owned()))
        }
    }

    async fn exchange(&self, mode: Mode, fields: &[&[u8]]) -> Result<Vec<u8>, BridgeError> {
        let started = Instant::now();
        let response = tokio::time::timeout(self.timeout, self.round_trip(mode, fields))
            .await
            .map_err(|_| BridgeError::Timeout(self.timeout))??;

        tracing::debug!(
            response_bytes = response.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Inference peer answered"
        );
        Ok(response)
    }

    async fn round_trip(&self, mode: Mode, fields: &[&[u8]]) -> Result<Vec<u8>, BridgeError> {
        let mut stream =
            TcpStream::connect(&self.addr)
                .await
                .map_err(|source| BridgeError::Connect {
                    addr: self.addr.clone(),
                    source,
                })?;
        stream.set_nodelay(true).ok();

        write_inference_request(&mut stream, mode, fields)
            .await
            .map_err(|e| match e {
                FrameError::IoError(io) => BridgeError::Write(io),
                other => BridgeError::Frame(other),
            })?;

        // The peer streams an unframed body and signals its end by closing.
        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .await
            .map_err(BridgeError::Read)?;
        Ok(response)
    }
}
