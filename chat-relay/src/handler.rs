//! One client's session, from accept to close.
//!
//! The session owns the read half of the stream and processes frames strictly
//! in arrival order. The write half belongs to a writer task that drains the
//! session's outbox; the session's own replies and every other session's
//! routed or broadcast frames all go through that outbox, so writes to one
//! stream never interleave. When the writer can no longer reach the peer it
//! tells the session, which then closes as if the peer had hung up.
//!
//! ```text
//! UNREGISTERED --SOLICITUD_CONEXION--> REGISTERED --disconnect / EOF / error--> CLOSED
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    sync::{mpsc, oneshot},
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::{
    codec::{CodecError, Frame, FrameCodec},
    message::Message,
    registry::{ClientHandle, ConnectionId, Outbox},
    relay::{RelayEvent, Shared},
};

enum State {
    Unregistered,
    Registered(ClientHandle),
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Runs a session over `stream` until the peer leaves or the stream fails.
///
/// Returns an error only for transport or framing failures; either way the
/// client has been unregistered and its stream shut down by the time this
/// returns.
pub async fn run_session<S>(stream: S, peer: String, shared: Arc<Shared>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (outbox, inbox) = mpsc::unbounded_channel();
    let (write_failed_tx, mut write_failed) = oneshot::channel();
    let writer_task = tokio::spawn(write_frames(writer, inbox, write_failed_tx, peer.clone()));

    let mut session = Session {
        id: shared.registry.next_connection_id(),
        peer,
        shared,
        outbox,
        state: State::Unregistered,
    };
    let mut frames = FramedRead::new(reader, FrameCodec);
    let result = session.receive_loop(&mut frames, &mut write_failed).await;
    session.close().await;
    drop(session);

    // Every sender is gone now, so the writer flushes what is queued and exits.
    if let Err(err) = writer_task.await {
        warn!(error = ?err, "writer task failed");
    }

    result
}

struct Session {
    id: ConnectionId,
    peer: String,
    shared: Arc<Shared>,
    outbox: Outbox,
    state: State,
}

impl Session {
    async fn receive_loop<R>(
        &mut self,
        frames: &mut FramedRead<R, FrameCodec>,
        write_failed: &mut oneshot::Receiver<CodecError>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            select! {
                next = frames.next() => {
                    let Some(next) = next else {
                        return Ok(());
                    };
                    let frame = next.with_context(|| format!("failed to read frame from {}", self.peer))?;
                    if self.dispatch(frame).await == Flow::Close {
                        return Ok(());
                    }
                }
                Ok(err) = &mut *write_failed => {
                    return Err(err).with_context(|| format!("failed to write frame to {}", self.peer));
                }
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> Flow {
        let message = match Message::try_from(frame.clone()) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    peer = %self.peer,
                    tag = frame.tag().unwrap_or_default(),
                    error = %err,
                    "ignoring invalid message"
                );
                return Flow::Continue;
            }
        };

        match message {
            Message::ConnectionRequest { display_name } if self.is_unregistered() => {
                self.register(&display_name).await;
                Flow::Continue
            }
            Message::Direct { recipient, .. } if self.is_registered() => {
                self.route(&recipient, &frame).await;
                Flow::Continue
            }
            Message::DisconnectRequest if self.is_registered() => Flow::Close,
            other => {
                warn!(
                    peer = %self.peer,
                    registered = self.is_registered(),
                    tag = other.tag(),
                    "ignoring unexpected message"
                );
                Flow::Continue
            }
        }
    }

    fn is_unregistered(&self) -> bool {
        matches!(self.state, State::Unregistered)
    }

    fn is_registered(&self) -> bool {
        matches!(self.state, State::Registered(_))
    }

    async fn register(&mut self, display_name: &str) {
        let joined = self
            .shared
            .registry
            .join(self.id, display_name, self.outbox.clone())
            .await;
        let client = match joined {
            Ok(client) => client,
            Err(err) => {
                warn!(peer = %self.peer, error = %err, "ignoring connection request");
                return;
            }
        };

        info!(peer = %self.peer, identifier = %client.identifier(), "client joined");
        self.shared.emit(RelayEvent::ClientJoined {
            identifier: client.identifier().to_string(),
        });
        self.state = State::Registered(client);
    }

    async fn route(&self, recipient: &str, frame: &Frame) {
        let delivered = self.shared.registry.route(recipient, frame).await;
        if delivered == 0 {
            debug!(peer = %self.peer, recipient, "no client registered under recipient, dropping message");
        }
    }

    /// Moves to `Closed`, unregistering first if needed. Safe to call twice.
    async fn close(&mut self) {
        let State::Registered(client) = std::mem::replace(&mut self.state, State::Closed) else {
            return;
        };

        if let Some(departed) = self.shared.registry.leave(client.id()).await {
            info!(peer = %self.peer, identifier = %departed.identifier(), "client disconnected");
            self.shared.emit(RelayEvent::ClientLeft {
                identifier: departed.identifier().to_string(),
            });
        }
    }
}

/// Drains the outbox into the stream. An i/o error ends the task and is
/// reported on `failed`; a frame that cannot be encoded is skipped.
async fn write_frames<W>(
    writer: W,
    mut inbox: mpsc::UnboundedReceiver<Frame>,
    failed: oneshot::Sender<CodecError>,
    peer: String,
) where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, FrameCodec);
    while let Some(frame) = inbox.recv().await {
        match sink.send(frame).await {
            Ok(()) => {}
            Err(err @ CodecError::Io(_)) => {
                debug!(%peer, error = ?err, "failed to deliver frame to client");
                let _ = failed.send(err);
                return;
            }
            Err(err) => warn!(%peer, error = %err, "dropping frame that cannot be encoded"),
        }
    }

    if let Err(err) = sink.close().await {
        debug!(%peer, error = ?err, "failed to shut down client stream");
    }
}
