//! Per-connection protocol state machine.
//!
//! A session reads capture frames, pairs them through the line's coordinator,
//! brokers the inference exchange and answers the client. Every failure ends
//! only this session.

use crate::archive::CaptureArchive;
use crate::config::LineMode;
use crate::dispatch::OutcomeDispatcher;
use crate::metrics::InspectorMetrics;
use crate::pairing::{PairResult, PairingCoordinator};
use crate::status::ServiceStatus;
use crate::verdict::{Interpretation, REASON_INFERENCE_UNAVAILABLE, VerdictInterpreter};
use bridge::{BridgeError, FrameError, InferenceClient, read_capture_length, read_frame_body};
use chrono::{DateTime, Local};
use schema::{Camera, ClientReply, InspectionOutcome, InspectionResult};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_frame_bytes: usize,
    pub read_timeout: Duration,
}

/// Everything sessions of one line share.
#[derive(Clone)]
pub struct LineContext {
    pub line: String,
    pub mode: LineMode,
    pub pairing: Arc<PairingCoordinator>,
    pub client: InferenceClient,
    pub interpreter: VerdictInterpreter,
    pub archive: Option<CaptureArchive>,
    pub dispatcher: OutcomeDispatcher,
    pub status: ServiceStatus,
    pub metrics: InspectorMetrics,
    pub limits: SessionLimits,
}

/// Images ready for the inference peer.
#[derive(Debug)]
enum InspectionJob {
    Pair {
        top: Vec<u8>,
        top_captured_at: DateTime<Local>,
        side: Vec<u8>,
    },
    Single { camera: Camera, image: Vec<u8> },
}

#[derive(Debug, Default)]
struct ArchivedPaths {
    top: Option<PathBuf>,
    side: Option<PathBuf>,
}

enum SessionState {
    AwaitLength,
    AwaitBody { len: usize },
    Acknowledge,
    Bridging(InspectionJob),
    Interpreting {
        job: InspectionJob,
        response: Result<String, BridgeError>,
        paths: ArchivedPaths,
        started_at: DateTime<Local>,
    },
    Dispatching(InspectionOutcome),
    Replying(Arc<InspectionOutcome>),
    Closed(InspectionResult),
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::AwaitLength => "await_length",
            SessionState::AwaitBody { .. } => "await_body",
            SessionState::Acknowledge => "acknowledge",
            SessionState::Bridging(_) => "bridging",
            SessionState::Interpreting { .. } => "interpreting",
            SessionState::Dispatching(_) => "dispatching",
            SessionState::Replying(_) => "replying",
            SessionState::Closed(_) => "closed",
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the connection between frames.
    ClientClosed,
    /// A final reply carrying this result was written.
    Completed(InspectionResult),
    /// Malformed, oversize or truncated frame.
    FrameRejected,
    /// No frame data within the read timeout.
    TimedOut,
    /// The client went away before a reply could be written.
    ReplyFailed,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::ClientClosed => f.write_str("client closed"),
            SessionEnd::Completed(result) => write!(f, "completed ({result})"),
            SessionEnd::FrameRejected => f.write_str("frame rejected"),
            SessionEnd::TimedOut => f.write_str("read timed out"),
            SessionEnd::ReplyFailed => f.write_str("reply failed"),
        }
    }
}

/// Serves one client connection until it closes, fails or receives a final reply.
pub async fn serve<S>(ctx: &LineContext, mut stream: S) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut state = SessionState::AwaitLength;

    loop {
        tracing::trace!(state = state.name(), "Session step");
        state = match state {
            SessionState::AwaitLength => {
                let read = read_capture_length(&mut stream, ctx.limits.max_frame_bytes);
                match with_read_timeout(ctx, read).await {
                    Ok(Some(len)) => SessionState::AwaitBody { len },
                    Ok(None) => return SessionEnd::ClientClosed,
                    Err(end) => return end,
                }
            }

            SessionState::AwaitBody { len } => {
                let image = match with_read_timeout(ctx, read_frame_body(&mut stream, len)).await {
                    Ok(image) => image,
                    Err(end) => return end,
                };
                ctx.status.record_frame();
                tracing::debug!(line = %ctx.line, bytes = image.len(), "Frame received");

                match ctx.mode {
                    LineMode::Single(camera) => SessionState::Bridging(InspectionJob::Single {
                        camera,
                        image,
                    }),
                    LineMode::Dual => match ctx.pairing.offer(image) {
                        PairResult::Stored => SessionState::Acknowledge,
                        PairResult::Paired {
                            first,
                            first_captured_at,
                            second,
                        } => SessionState::Bridging(InspectionJob::Pair {
                            top: first,
                            top_captured_at: first_captured_at,
                            side: second,
                        }),
                    },
                }
            }

            SessionState::Acknowledge => {
                let reply = ClientReply::pending(&Local::now());
                if let Err(end) = write_reply(&mut stream, &reply).await {
                    return end;
                }
                tracing::debug!(line = %ctx.line, "First image stored, waiting for pair");
                SessionState::AwaitLength
            }

            SessionState::Bridging(job) => {
                let started_at = Local::now();
                let (response, paths) =
                    tokio::join!(call_inference(ctx, &job), archive(ctx, &job, &started_at));
                SessionState::Interpreting {
                    job,
                    response,
                    paths,
                    started_at,
                }
            }

            SessionState::Interpreting {
                job,
                response,
                paths,
                started_at,
            } => {
                let interpretation = match response {
                    Ok(raw) => match &job {
                        InspectionJob::Pair { .. } => ctx.interpreter.interpret(&raw),
                        InspectionJob::Single { camera, .. } => {
                            ctx.interpreter.interpret_single(&raw, *camera)
                        }
                    },
                    Err(e) => {
                        tracing::warn!(
                            line = %ctx.line,
                            peer = %ctx.client.addr(),
                            error = %e,
                            "Inference exchange failed"
                        );
                        ctx.status.record_bridge_error();
                        ctx.metrics.record_bridge_failure();
                        Interpretation::error(REASON_INFERENCE_UNAVAILABLE)
                    }
                };

                SessionState::Dispatching(InspectionOutcome {
                    line: ctx.line.clone(),
                    timestamp: started_at,
                    result: interpretation.result,
                    reason: interpretation.reason,
                    top_path: paths.top,
                    side_path: paths.side,
                    detections: interpretation.detections,
                })
            }

            SessionState::Dispatching(outcome) => {
                tracing::info!(
                    line = %outcome.line,
                    result = %outcome.result,
                    reason = %outcome.reason,
                    detections = outcome.detections.len(),
                    "Inspection complete"
                );
                SessionState::Replying(ctx.dispatcher.dispatch(outcome))
            }

            SessionState::Replying(outcome) => {
                let reply = ClientReply::from(outcome.as_ref());
                if let Err(end) = write_reply(&mut stream, &reply).await {
                    return end;
                }
                SessionState::Closed(outcome.result)
            }

            SessionState::Closed(result) => {
                // The client may already be gone; the reply is written either way.
                let _ = stream.shutdown().await;
                return SessionEnd::Completed(result);
            }
        };
    }
}

async fn with_read_timeout<T, F>(ctx: &LineContext, read: F) -> Result<T, SessionEnd>
where
    F: Future<Output = Result<T, FrameError>>,
{
    match tokio::time::timeout(ctx.limits.read_timeout, read).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            tracing::warn!(line = %ctx.line, error = %e, "Rejected frame, closing connection");
            ctx.status.record_frame_error();
            Err(SessionEnd::FrameRejected)
        }
        Err(_) => {
            tracing::warn!(
                line = %ctx.line,
                timeout_ms = ctx.limits.read_timeout.as_millis() as u64,
                "Timed out waiting for frame, closing connection"
            );
            ctx.status.record_frame_error();
            Err(SessionEnd::TimedOut)
        }
    }
}

async fn call_inference(ctx: &LineContext, job: &InspectionJob) -> Result<String, BridgeError> {
    let started = Instant::now();
    let response = match job {
        InspectionJob::Pair { top, side, .. } => ctx.client.analyze(top, side).await,
        InspectionJob::Single { camera, image } => ctx.client.analyze_single(*camera, image).await,
    };
    ctx.metrics.record_inference_duration(started.elapsed());
    response
}

async fn archive(ctx: &LineContext, job: &InspectionJob, at: &DateTime<Local>) -> ArchivedPaths {
    let Some(archive) = &ctx.archive else {
        return ArchivedPaths::default();
    };

    match job {
        InspectionJob::Pair {
            top,
            top_captured_at,
            side,
        } => {
            let (top, side) = tokio::join!(
                archive.save_or_log(&ctx.line, Camera::Top, top, top_captured_at),
                archive.save_or_log(&ctx.line, Camera::Side, side, at)
            );
            ArchivedPaths { top, side }
        }
        InspectionJob::Single { camera, image } => {
            let path = archive.save_or_log(&ctx.line, *camera, image, at).await;
            match camera {
                Camera::Top => ArchivedPaths {
                    top: path,
                    side: None,
                },
                Camera::Side => ArchivedPaths {
                    top: None,
                    side: path,
                },
            }
        }
    }
}

async fn write_reply<S>(stream: &mut S, reply: &ClientReply) -> Result<(), SessionEnd>
where
    S: AsyncWrite + Unpin,
{
    let bytes = match reply.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode client reply");
            return Err(SessionEnd::ReplyFailed);
        }
    };

    let written = async {
        stream.write_all(&bytes).await?;
        stream.flush().await
    };
    written.await.map_err(|e| {
        tracing::warn!(error = %e, "Failed to write reply to client");
        SessionEnd::ReplyFailed
    })
}
