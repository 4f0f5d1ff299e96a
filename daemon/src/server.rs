//! Subscriber transport
//!
//! WebSocket endpoint over TCP. Every accepted connection becomes a
//! registered `Subscriber`; its task forwards queued messages as text
//! frames and deregisters the subscriber when the connection ends.

use crate::error::ServerError;
use crate::registry::{Subscriber, SubscriberId, SubscriberRegistry};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
    Router,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// State shared by every connection task
#[derive(Clone)]
struct ServerState {
    registry: Arc<SubscriberRegistry>,
    queue_capacity: usize,
    shutdown: CancellationToken,
}

/// Bound, not yet serving, subscriber endpoint
pub struct TransportServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<SubscriberRegistry>,
    queue_capacity: usize,
}

impl TransportServer {
    /// Bind the listening socket
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<SubscriberRegistry>,
        queue_capacity: usize,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            registry,
            queue_capacity,
        })
    }

    /// Address actually bound, useful when binding port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept subscribers until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let state = ServerState {
            registry: self.registry,
            queue_capacity: self.queue_capacity,
            shutdown: shutdown.clone(),
        };

        // Any path upgrades
        let app = Router::new()
            .fallback(upgrade)
            .with_state(state)
            .into_make_service_with_connect_info::<SocketAddr>();

        info!("Listening for subscribers on ws://{}", self.local_addr);

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Subscriber endpoint stopped");
        Ok(())
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<ServerState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, peer, state))
}

async fn handle_socket(socket: WebSocket, peer: SocketAddr, state: ServerState) {
    let (subscriber, mut queue) = Subscriber::new(Some(peer), state.queue_capacity);
    let id = state.registry.register(subscriber);
    info!(
        "Subscriber {} connected from {} ({} active)",
        id,
        peer,
        state.registry.len()
    );

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            queued = queue.recv() => match queued {
                Some(message) => {
                    if let Err(e) = sink.send(Message::Text(message)).await {
                        debug!("Write to subscriber {} failed: {}", id, e);
                        break;
                    }
                }
                // Evicted by the broadcaster
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Read from subscriber {} failed: {}", id, e);
                    break;
                }
            },
        }
    }

    close(&state.registry, id, peer);
}

fn close(registry: &SubscriberRegistry, id: SubscriberId, peer: SocketAddr) {
    debug!("Connection from {} closed", peer);
    registry.connection_closed(id);
}
