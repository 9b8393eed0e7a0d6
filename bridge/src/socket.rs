//! Byte-stream transport over a TCP socket.
//!
//! [`SocketTransport`] is the outbound half handed to the link; it only queues
//! frames. [`SocketDriver`] owns the socket and runs three tasks: a reader that
//! forwards raw chunks to the router, a writer that drains the frame queue, and
//! (when liveness is on) a ticker. All three stop on the link's cancellation token.

use std::net::SocketAddr;

use arbor_core::{ArborError, LinkEvent, LinkId, LivenessConfig, Transport};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::driver::spawn_ticker;
use crate::router::RouterHandle;

const READ_CHUNK: usize = 16 * 1024;

/// Frames queued for the writer before further writes fail the link.
pub const DEFAULT_WRITE_QUEUE: usize = 1024;

pub struct SocketTransport {
    frames: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    peer: SocketAddr,
}

impl Transport for SocketTransport {
    fn write_bytes(&mut self, frame: Bytes) -> arbor_core::Result<()> {
        self.frames.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ArborError::Transport(format!("outbound queue for {} is full", self.peer))
            }
            mpsc::error::TrySendError::Closed(_) => {
                ArborError::Transport(format!("writer for {} has stopped", self.peer))
            }
        })
    }

    fn close(&mut self) {
        debug!(peer = %self.peer, "Closing socket");
        self.cancel.cancel();
    }
}

pub struct SocketDriver {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    frames: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    peer: SocketAddr,
}

/// Splits a connected stream into the link's transport and the driver that pumps it.
pub fn split(stream: TcpStream) -> std::io::Result<(SocketTransport, SocketDriver)> {
    split_with_queue(stream, DEFAULT_WRITE_QUEUE)
}

/// Like [`split`], with at most `queue` frames waiting for the writer.
pub fn split_with_queue(stream: TcpStream, queue: usize) -> std::io::Result<(SocketTransport, SocketDriver)> {
    let peer = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(queue.max(1));
    let cancel = CancellationToken::new();
    Ok((
        SocketTransport {
            frames: tx,
            cancel: cancel.clone(),
            peer,
        },
        SocketDriver {
            reader,
            writer,
            frames: rx,
            cancel,
            peer,
        },
    ))
}

impl SocketDriver {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Starts the reader, writer and ticker for `link`.
    pub fn spawn(self, router: RouterHandle, link: LinkId, liveness: &LivenessConfig) {
        let SocketDriver {
            reader,
            writer,
            frames,
            cancel,
            peer,
        } = self;
        tokio::spawn(read_loop(reader, router.clone(), link, cancel.clone(), peer));
        tokio::spawn(write_loop(writer, frames, router.clone(), link, cancel.clone(), peer));
        spawn_ticker(router, link, liveness, cancel);
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    router: RouterHandle,
    link: LinkId,
    cancel: CancellationToken,
    peer: SocketAddr,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.read_buf(&mut buf) => match result {
                Ok(0) => {
                    debug!(peer = %peer, link = %link, "Peer closed the socket");
                    let _ = router.deliver(link, LinkEvent::Closed).await;
                    break;
                }
                Ok(_) => {
                    let chunk = buf.split().freeze();
                    if router.deliver(link, LinkEvent::Bytes(chunk)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(peer = %peer, link = %link, error = %e, "Socket read failed");
                    let _ = router.deliver(link, LinkEvent::Error(e.to_string())).await;
                    break;
                }
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Bytes>,
    router: RouterHandle,
    link: LinkId,
    cancel: CancellationToken,
    peer: SocketAddr,
) {
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        warn!(peer = %peer, link = %link, error = %e, "Socket write failed");
                        let _ = router.deliver(link, LinkEvent::Error(e.to_string())).await;
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                // Frames queued before close (e.g. `terminate`) still go out.
                while let Ok(frame) = frames.try_recv() {
                    if writer.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    debug!(peer = %peer, link = %link, "Writer stopped");
}
