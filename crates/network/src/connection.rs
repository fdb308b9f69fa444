//! Established connections.
//!
//! A [`Connection`] owns a socket after the handshake and drives it with two
//! tasks: an inbound pump decoding frames into a bounded queue, and an
//! outbound pump draining a bounded queue onto the socket. Neither pump knows
//! about peers; they only see channels. The first transport error is reported
//! exactly once, and any error or an explicit close tears down both pumps.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::buffer_pool::BufferPool;
use crate::config::NetworkConfig;
use crate::error::{FrameError, SendError, TransportError};
use crate::frame::FrameCodec;
use crate::metrics::NetworkMetrics;

/// Shared settings and collaborators for every connection.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub max_frame_size: usize,
    pub pool: Arc<BufferPool>,
    pub metrics: Arc<NetworkMetrics>,
}

impl ConnectionParams {
    pub fn from_config(config: &NetworkConfig, metrics: Arc<NetworkMetrics>) -> Self {
        Self {
            inbound_capacity: config.inbound_queue_capacity,
            outbound_capacity: config.outbound_queue_capacity,
            max_frame_size: config.max_frame_size,
            pool: Arc::new(BufferPool::default()),
            metrics,
        }
    }
}

/// Receiving ends handed to whoever consumes a connection's traffic.
#[derive(Debug)]
pub struct ConnectionHandles {
    /// Raw frames in arrival order. Closes once the inbound pump stops.
    pub inbound: mpsc::Receiver<Bytes>,
    /// Resolves with the first transport error, or fails if the connection
    /// was closed locally.
    pub error: oneshot::Receiver<TransportError>,
}

/// Take-once error slot shared by both pumps.
struct ErrorReporter {
    tx: Mutex<Option<oneshot::Sender<TransportError>>>,
}

impl ErrorReporter {
    fn report(&self, error: TransportError) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(error);
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    remote: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    metrics: Arc<NetworkMetrics>,
}

impl Connection {
    /// Split `stream` and start both pumps. The connection is torn down when
    /// `parent` is cancelled, when [`Connection::close`] is called, or when
    /// the `Connection` is dropped.
    pub fn spawn(
        stream: TcpStream,
        params: &ConnectionParams,
        parent: &CancellationToken,
    ) -> std::io::Result<(Self, ConnectionHandles)> {
        let remote = stream.peer_addr()?;
        let (read, write) = stream.into_split();

        let cancel = parent.child_token();
        let (inbound_tx, inbound_rx) = mpsc::channel(params.inbound_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(params.outbound_capacity.max(1));
        let (error_tx, error_rx) = oneshot::channel();
        let reporter = Arc::new(ErrorReporter {
            tx: Mutex::new(Some(error_tx)),
        });

        tokio::spawn(inbound_pump(
            remote,
            read,
            FrameCodec::new(params.max_frame_size),
            inbound_tx,
            reporter.clone(),
            cancel.clone(),
            params.metrics.clone(),
        ));
        tokio::spawn(outbound_pump(
            remote,
            write,
            FrameCodec::new(params.max_frame_size),
            outbound_rx,
            reporter,
            cancel.clone(),
            params.pool.clone(),
            params.metrics.clone(),
        ));

        params.metrics.record_connection_opened();
        let connection = Self {
            remote,
            outbound: outbound_tx,
            cancel,
            metrics: params.metrics.clone(),
        };
        let handles = ConnectionHandles {
            inbound: inbound_rx,
            error: error_rx,
        };
        Ok((connection, handles))
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Queue a frame without waiting.
    pub fn send(&self, frame: Bytes) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.metrics.record_outbound_dropped();
                warn!(peer = %self.remote, "outbound queue full, dropping frame");
                Err(SendError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Idempotent.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(peer = %self.remote, "closing connection");
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection has been torn down.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn inbound_pump(
    remote: SocketAddr,
    read: OwnedReadHalf,
    codec: FrameCodec,
    queue: mpsc::Sender<Bytes>,
    reporter: Arc<ErrorReporter>,
    cancel: CancellationToken,
    metrics: Arc<NetworkMetrics>,
) {
    let mut frames = FramedRead::new(read, codec);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                metrics.record_frame_received(frame.len());
                match queue.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        metrics.record_inbound_dropped();
                        warn!(peer = %remote, "inbound queue full, dropping frame");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Some(Err(FrameError::TooLarge { size, max })) => {
                reporter.report(TransportError::Protocol {
                    addr: remote,
                    reason: format!("frame of {} bytes exceeds limit of {}", size, max),
                });
                break;
            }
            Some(Err(FrameError::Io(e))) => {
                reporter.report(TransportError::Read {
                    addr: remote,
                    reason: e.to_string(),
                });
                break;
            }
            None => {
                reporter.report(TransportError::Closed(remote));
                break;
            }
        }
    }
    trace!(peer = %remote, "inbound pump stopped");
    cancel.cancel();
}

#[allow(clippy::too_many_arguments)]
async fn outbound_pump(
    remote: SocketAddr,
    mut write: OwnedWriteHalf,
    mut codec: FrameCodec,
    mut queue: mpsc::Receiver<Bytes>,
    reporter: Arc<ErrorReporter>,
    cancel: CancellationToken,
    pool: Arc<BufferPool>,
    metrics: Arc<NetworkMetrics>,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let mut buf = pool.get();
        if let Err(e) = codec.encode(frame, &mut buf) {
            warn!(peer = %remote, error = %e, "dropping unencodable frame");
            pool.put(buf);
            continue;
        }

        let written = buf.len();
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = write.write_all(&buf) => result,
        };
        pool.put(buf);

        match result {
            Ok(()) => metrics.record_frame_sent(written),
            Err(e) => {
                reporter.report(TransportError::Write {
                    addr: remote,
                    reason: e.to_string(),
                });
                break;
            }
        }
    }
    let _ = write.shutdown().await;
    trace!(peer = %remote, "outbound pump stopped");
    cancel.cancel();
}
