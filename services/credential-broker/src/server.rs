//! Accept loop and per-connection frame processing
//!
//! Each connection is verified once, then framed with a 4-byte big-endian
//! length prefix. Requests are validated and rate limited inline on the read
//! loop, then handled on their own tasks so a slow provider call never blocks
//! the connection. Every response goes through a single writer task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use crate::dispatch::Broker;
use crate::limiter::{ConnectionRateLimiter, Decision};
use crate::metrics;
use crate::peer::{PeerIdentity, PeerVerifier, Verdict};
use crate::protocol::{Failure, Response, decode_frame};
use crate::validate::{Rejected, parse_request};

/// Responses queued for the writer before handlers wait.
const WRITE_QUEUE: usize = 64;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a connection task needs.
pub struct ConnectionContext {
    pub broker: Arc<Broker>,
    pub verifier: Arc<PeerVerifier>,
    pub max_requests_per_second: usize,
    pub max_frame_bytes: usize,
}

fn codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

/// Accept connections until `shutdown` fires. Returns the connection tasks
/// still running so the caller can drain them.
pub async fn run(
    listener: UnixListener,
    ctx: Arc<ConnectionContext>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinSet<()> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connections.spawn(serve_connection(stream, ctx.clone(), shutdown.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "connection task failed");
                }
            }
        }
    }

    info!(open_connections = connections.len(), "accept loop stopped");
    connections
}

/// Wait for connection tasks to finish, aborting whatever is left after
/// `timeout`. Returns how many had to be aborted.
pub async fn drain(mut connections: JoinSet<()>, timeout: Duration) -> usize {
    let finished = tokio::time::timeout(timeout, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    match finished {
        Ok(()) => 0,
        Err(_) => {
            let remaining = connections.len();
            connections.abort_all();
            remaining
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    ctx: Arc<ConnectionContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let conn = format!("conn_{}", uuid::Uuid::new_v4().as_simple());

    let peer = match ctx.verifier.verify(&stream) {
        Verdict::Allow(peer) => Arc::new(peer),
        Verdict::Reject { reason } => {
            warn!(conn = %conn, %reason, "peer rejected");
            metrics::record_peer_rejection();
            return;
        }
    };
    debug!(conn = %conn, peer_uid = ?peer.uid, peer_pid = ?peer.pid, "connection accepted");

    let (mut sink, mut frames) = Framed::new(stream, codec(ctx.max_frame_bytes)).split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(WRITE_QUEUE);

    let writer_conn = conn.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                debug!(conn = %writer_conn, error = %e, "write failed, dropping responses");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut limiter = ConnectionRateLimiter::new(ctx.max_requests_per_second);
    let mut handlers = JoinSet::new();

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = frames.next() => frame,
            Some(_) = handlers.join_next(), if !handlers.is_empty() => continue,
        };

        let body = match frame {
            None => break,
            Some(Ok(body)) => body,
            Some(Err(e)) => {
                warn!(conn = %conn, error = %e, "unreadable frame, closing connection");
                close_abruptly(writer, handlers);
                return;
            }
        };

        let object = match decode_frame(&body) {
            Ok(object) => object,
            Err(e) => {
                warn!(conn = %conn, error = %e, "undecodable frame, closing connection");
                close_abruptly(writer, handlers);
                return;
            }
        };

        let started = Instant::now();
        let (id, request) = match parse_request(object) {
            Ok(parsed) => parsed,
            Err(Rejected { id, failure }) => {
                debug!(conn = %conn, field = ?failure.field, "invalid request");
                respond(&tx, Response::failure(id, failure), "invalid", started).await;
                continue;
            }
        };

        if let Decision::Deny { retry_after_ms } = limiter.check_limit() {
            metrics::record_rate_limited();
            debug!(conn = %conn, op = request.op(), retry_after_ms, "rate limited");
            let response = Response::failure(id, Failure::rate_limited(retry_after_ms));
            respond(&tx, response, request.op(), started).await;
            continue;
        }

        let broker = ctx.broker.clone();
        let peer: Arc<PeerIdentity> = peer.clone();
        let tx = tx.clone();
        handlers.spawn(async move {
            let op = request.op();
            let result = broker.handle(request, &peer).await;
            respond(&tx, Response::from_result(id, result), op, started).await;
        });
    }

    // Peer closed or shutdown: let pending handlers answer, then flush.
    while handlers.join_next().await.is_some() {}
    drop(tx);
    if let Err(e) = writer.await {
        error!(conn = %conn, error = %e, "writer task failed");
    }
    debug!(conn = %conn, "connection closed");
}

/// Drop the connection without flushing. Handlers keep running detached so
/// session cleanup still happens; their responses go nowhere.
fn close_abruptly(writer: tokio::task::JoinHandle<()>, mut handlers: JoinSet<()>) {
    writer.abort();
    handlers.detach_all();
}

async fn respond(tx: &mpsc::Sender<Bytes>, response: Response, op: &'static str, started: Instant) {
    metrics::record_request(op, &response.outcome(), started.elapsed().as_secs_f64());
    match response.encode() {
        Ok(frame) => {
            // Only fails when the writer is gone; the peer has disconnected.
            let _ = tx.send(frame).await;
        }
        Err(e) => error!(op, error = %e, "failed to encode response"),
    }
}
