use crate::session::{self, LineContext, SessionEnd};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Accepts capture clients for one line and serves each on its own task.
pub struct LineListener {
    listener: TcpListener,
    ctx: Arc<LineContext>,
    accept_backoff: Duration,
}

impl LineListener {
    pub async fn bind(
        addr: SocketAddr,
        ctx: LineContext,
        accept_backoff: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
            accept_backoff,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs until `shutdown` flips to `true`. Accept errors never end the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let line = self.ctx.line.clone();
        if let Ok(bound) = self.listener.local_addr() {
            self.ctx.status.mark_listening(&line, bound);
            tracing::info!(line = %line, addr = %bound, mode = %self.ctx.mode, "Listening for capture clients");
        }

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match accepted {
                Ok((stream, client)) => {
                    stream.set_nodelay(true).ok();
                    self.ctx.status.record_client(&line, client);
                    let ctx = Arc::clone(&self.ctx);
                    let span = tracing::info_span!("session", line = %line, peer = %client);
                    tokio::spawn(
                        async move {
                            tracing::debug!("Client connected");
                            let end = session::serve(&ctx, stream).await;
                            match end {
                                SessionEnd::Completed(_) | SessionEnd::ClientClosed => {
                                    tracing::debug!(end = %end, "Session finished")
                                }
                                _ => tracing::info!(end = %end, "Session aborted"),
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    tracing::error!(
                        line = %line,
                        error = %e,
                        backoff_ms = self.accept_backoff.as_millis() as u64,
                        "Accept failed"
                    );
                    self.ctx.status.mark_faulted(&line, e.to_string());
                    tokio::time::sleep(self.accept_backoff).await;
                }
            }
        }

        self.ctx.status.mark_stopped(&line);
        tracing::info!(line = %line, "Listener stopped");
    }
}
