use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::endpoint::{EndpointEvent, EventBus};
use super::framing::{read_frame, write_frame};
use crate::{Error, Result};

type Incoming = std::result::Result<String, String>;

/// A connected, framed byte stream.
///
/// Writes go through an unbounded queue drained by one writer task, so
/// `send` never blocks and can be called from plain threads. Reads are
/// delivered by a reader task in arrival order.
pub struct Channel {
    peer: String,
    outgoing: mpsc::UnboundedSender<String>,
    incoming: Mutex<mpsc::UnboundedReceiver<Incoming>>,
    closed: CancellationToken,
}

impl Channel {
    pub(crate) fn spawn<S>(stream: S, peer: String, bus: EventBus, shutdown: &CancellationToken) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Incoming>();
        let closed = shutdown.child_token();

        let write_closed = closed.clone();
        let write_bus = bus.clone();
        let write_peer = peer.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    next = out_rx.recv() => match next {
                        Some(raw) => {
                            if let Err(e) = write_frame(&mut writer, &raw).await {
                                if !write_closed.is_cancelled() {
                                    tracing::warn!("Write to {} failed: {}", write_peer, e);
                                    write_bus.emit(EndpointEvent::Disconnected { error: Some(e.to_string()) });
                                    write_closed.cancel();
                                }
                                return;
                            }
                        }
                        None => break,
                    },
                    _ = write_closed.cancelled() => break,
                }
            }
            // Frames queued before close still go out.
            while let Ok(raw) = out_rx.try_recv() {
                if write_frame(&mut writer, &raw).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let read_closed = closed.clone();
        let read_peer = peer.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = read_closed.cancelled() => break,
                    frame = read_frame(&mut reader) => match frame {
                        Ok(Some(raw)) => {
                            tracing::trace!("Received {} bytes from {}", raw.len(), read_peer);
                            let _ = in_tx.send(Ok(raw));
                        }
                        Ok(None) => {
                            if !read_closed.is_cancelled() {
                                tracing::debug!("{} closed the connection", read_peer);
                                bus.emit(EndpointEvent::Disconnected { error: None });
                            }
                            break;
                        }
                        Err(e) => {
                            if !read_closed.is_cancelled() {
                                tracing::warn!("Read from {} failed: {}", read_peer, e);
                                let _ = in_tx.send(Err(e.to_string()));
                                bus.emit(EndpointEvent::Disconnected { error: Some(e.to_string()) });
                            }
                            break;
                        }
                    },
                }
            }
            read_closed.cancel();
        });

        Arc::new(Self {
            peer,
            outgoing: out_tx,
            incoming: Mutex::new(in_rx),
            closed,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Queue one frame for sending.
    pub fn send(&self, raw: String) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionClosed(format!("Channel to {} is closed.", self.peer)));
        }
        self.outgoing
            .send(raw)
            .map_err(|_| Error::ConnectionClosed(format!("Channel to {} is closed.", self.peer)))
    }

    /// Next frame; `Ok(None)` once the peer has closed cleanly.
    pub async fn receive(&self) -> Result<Option<String>> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(Ok(raw)) => Ok(Some(raw)),
            Some(Err(e)) => Err(Error::ConnectionClosed(e)),
            None => Ok(None),
        }
    }

    /// Flush queued frames and close both directions without raising
    /// `Disconnected`.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .finish()
    }
}
