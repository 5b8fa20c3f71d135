use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::broadcast,
};
use tracing::{info, warn};

use crate::{handler::run_session, registry::Registry};

/// Lifecycle notifications for whatever is watching the relay (a status view,
/// tests). Nobody listening is fine; events are simply dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Started { addr: SocketAddr },
    ClientJoined { identifier: String },
    ClientLeft { identifier: String },
}

/// State shared by the accept loop and every session.
pub struct Shared {
    pub registry: Arc<Registry>,
    events: broadcast::Sender<RelayEvent>,
}

impl Shared {
    pub fn new() -> Self {
        // Slow watchers lag and skip events rather than holding up sessions.
        let (events, _) = broadcast::channel(256);
        Self {
            registry: Arc::new(Registry::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: RelayEvent) {
        let _ = self.events.send(event);
    }
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Relay {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Relay {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            shared: Arc::new(Shared::new()),
        }
    }

    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind relay on {addr}"))?;
        Ok(Self::new(listener))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.shared.registry)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.shared.subscribe()
    }

    /// Accepts connections until `shutdown` resolves. Sessions already
    /// running are left to finish on their own.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, shared } = self;
        tokio::pin!(shutdown);

        let addr = listener.local_addr()?;
        shared.emit(RelayEvent::Started { addr });

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &shared);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, shared: &Arc<Shared>) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, shared),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, shared: &Arc<Shared>) {
    info!(%peer, "incoming connection");
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        if let Err(err) = run_session(stream, peer.to_string(), shared).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = taken.local_addr().expect("addr");

        let err = Relay::bind(addr).await.err().expect("port already in use");
        assert!(err.to_string().contains("failed to bind relay"));
    }

    #[tokio::test]
    async fn started_event_carries_bound_address() {
        let relay = Relay::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");
        let addr = relay.local_addr().expect("addr");
        let mut events = relay.subscribe();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(relay.run_until(async move {
            let _ = stop_rx.await;
        }));

        assert_eq!(
            events.recv().await.expect("event"),
            RelayEvent::Started { addr }
        );

        let _ = stop_tx.send(());
        server.await.expect("join").expect("clean shutdown");
    }

    #[test]
    fn emit_without_watchers_is_harmless() {
        let shared = Shared::new();
        shared.emit(RelayEvent::ClientLeft {
            identifier: "1 - Ana".into(),
        });
    }
}
