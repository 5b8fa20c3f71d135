//! Shared registry of connected clients.
//!
//! The registry is the single source of truth for routing and for the roster
//! handed to new joiners. Every mutation and every read used for routing runs
//! under one async mutex, and the composite operations ([`Registry::join`],
//! [`Registry::leave`], [`Registry::route`]) perform their sends while still
//! holding it, so no session ever observes a half-applied join or leave.
//!
//! Outgoing frames are pushed onto each client's unbounded outbox; the owning
//! session drains it from a dedicated writer task, which keeps writes to one
//! stream serialized without the registry ever awaiting I/O.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::{codec::Frame, message::Message};

/// Process-unique handle for one accepted stream.
pub type ConnectionId = u64;

pub type Outbox = mpsc::UnboundedSender<Frame>;

/// A registered client: its assigned identifier plus the write path to it.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ConnectionId,
    identifier: String,
    outbox: Outbox,
}

impl ClientHandle {
    pub fn new(id: ConnectionId, identifier: String, outbox: Outbox) -> Self {
        Self {
            id,
            identifier,
            outbox,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Queues a frame for this client. Returns `false` when the client's
    /// writer has already gone away; that is logged, never propagated.
    pub fn send(&self, frame: Frame) -> bool {
        match self.outbox.send(frame) {
            Ok(()) => true,
            Err(_) => {
                debug!(identifier = %self.identifier, "client outbox closed, dropping frame");
                false
            }
        }
    }
}

/// Why a connection request was turned down.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("display name of {len} bytes does not fit in a frame")]
    NameTooLong { len: usize },
    #[error("roster of {clients} clients does not fit in an acceptance frame")]
    RosterTooLarge { clients: usize },
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Registration order.
    clients: Vec<ClientHandle>,
    /// Last sequence number handed out; the first registration gets 1.
    sequence: u64,
}

impl RegistryState {
    fn broadcast(&self, frame: &Frame) {
        for client in &self.clients {
            client.send(frame.clone());
        }
    }
}

#[derive(Debug)]
pub struct Registry {
    state: Mutex<RegistryState>,
    next_connection: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Allocates the id used to tell connections apart inside the registry.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a new client under `"<seq> - <display_name>"`.
    ///
    /// In order, and atomically with respect to every other registry call:
    /// the joiner is sent `CONEXION_ACEPTADA` with its identifier and the
    /// roster of everyone registered before it, every previously registered
    /// client is sent `NUEVO_USUARIO_CONECTADO`, and only then is the joiner
    /// added.
    ///
    /// Nothing is sent and no sequence number is used up when either frame
    /// would exceed [`MAX_FRAME_LEN`](crate::codec::MAX_FRAME_LEN).
    pub async fn join(
        &self,
        id: ConnectionId,
        display_name: &str,
        outbox: Outbox,
    ) -> Result<ClientHandle, JoinError> {
        let mut state = self.state.lock().await;

        let identifier = format!("{} - {}", state.sequence + 1, display_name);
        let announcement = Frame::from(Message::UserJoined {
            identifier: identifier.clone(),
        });
        if !announcement.fits() {
            return Err(JoinError::NameTooLong {
                len: display_name.len(),
            });
        }

        let roster = state
            .clients
            .iter()
            .map(|client| client.identifier.clone())
            .collect();
        let accepted = Frame::from(Message::ConnectionAccepted {
            identifier: identifier.clone(),
            roster,
        });
        if !accepted.fits() {
            return Err(JoinError::RosterTooLarge {
                clients: state.clients.len(),
            });
        }

        state.sequence += 1;
        let handle = ClientHandle::new(id, identifier, outbox);
        handle.send(accepted);
        state.broadcast(&announcement);
        state.clients.push(handle.clone());

        Ok(handle)
    }

    /// Removes the client and tells everyone left behind.
    ///
    /// The departing client's stream is still open when the notice goes out;
    /// its session closes it once this returns. No frame can reach that
    /// stream in between, since the client is no longer routable.
    ///
    /// Returns the removed handle, or `None` when the connection was not
    /// registered (or was already removed), in which case nothing is sent.
    pub async fn leave(&self, id: ConnectionId) -> Option<ClientHandle> {
        let mut state = self.state.lock().await;
        let index = state.clients.iter().position(|client| client.id == id)?;
        let departed = state.clients.remove(index);

        state.broadcast(
            &Message::UserLeft {
                identifier: departed.identifier.clone(),
            }
            .into(),
        );

        Some(departed)
    }

    /// Forwards `frame` unchanged to every client registered as `recipient`.
    ///
    /// Returns how many clients it was queued for; zero is a routing miss.
    pub async fn route(&self, recipient: &str, frame: &Frame) -> usize {
        let state = self.state.lock().await;
        state
            .clients
            .iter()
            .filter(|client| client.identifier == recipient)
            .filter(|client| client.send(frame.clone()))
            .count()
    }

    /// Adds a handle unless its connection is already present.
    pub async fn add(&self, handle: ClientHandle) -> bool {
        let mut state = self.state.lock().await;
        if state.clients.iter().any(|client| client.id == handle.id) {
            return false;
        }
        state.clients.push(handle);
        true
    }

    /// Removes a connection's entry. Removing an absent entry is a no-op.
    pub async fn remove(&self, id: ConnectionId) -> Option<ClientHandle> {
        let mut state = self.state.lock().await;
        let index = state.clients.iter().position(|client| client.id == id)?;
        Some(state.clients.remove(index))
    }

    /// Snapshot of registered identifiers in registration order.
    pub async fn list_identifiers(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .clients
            .iter()
            .map(|client| client.identifier.clone())
            .collect()
    }

    pub async fn find(&self, identifier: &str) -> Option<ClientHandle> {
        let state = self.state.lock().await;
        state
            .clients
            .iter()
            .find(|client| client.identifier == identifier)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
