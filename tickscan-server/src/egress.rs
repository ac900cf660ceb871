//! Subscriber WebSocket server.
//!
//! Every accepted connection is registered with the [`Broadcaster`] through a [`WsTransport`].
//! Clients choose what they receive with `subscribe` / `unsubscribe` requests; detection events
//! then arrive as batched `events` frames.

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc};
use tickscan_data::{
    broadcast::{Broadcaster, EventTransport},
    error::ScanError,
    event::DetectionEvent,
    subscription::SubscriberId,
    wire::{ClientRequest, ServerMessage, interests},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Frames buffered between the broadcaster and a client's socket writer.
const FRAME_BUFFER: usize = 64;

#[derive(Debug)]
enum Outbound {
    Frame(ServerMessage),
    Close,
}

/// [`EventTransport`] that queues `events` frames for a client's socket writer task.
///
/// Queueing waits while the buffer is full, so a slow socket surfaces as a write timeout in
/// the broadcaster rather than unbounded memory.
#[derive(Debug)]
struct WsTransport {
    peer_addr: SocketAddr,
    frames: mpsc::Sender<Outbound>,
}

#[async_trait]
impl EventTransport for WsTransport {
    async fn send(&self, events: &[Arc<DetectionEvent>]) -> Result<(), ScanError> {
        let frame = ServerMessage::Events {
            events: events.to_vec(),
        };
        self.frames
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| ScanError::Transport(format!("writer for {} closed", self.peer_addr)))
    }

    async fn close(&self) {
        let _ = self.frames.send(Outbound::Close).await;
    }
}

/// Accept subscriber connections until the listener fails.
pub async fn start_websocket_server(listener: TcpListener, broadcaster: Broadcaster) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!("New WebSocket connection from {}", peer_addr);
                tokio::spawn(handle_client(stream, peer_addr, broadcaster.clone()));
            }
            Err(error) => {
                warn!(%error, "failed to accept WebSocket connection");
            }
        }
    }
}

/// Handle individual WebSocket client connection
async fn handle_client(stream: TcpStream, peer_addr: SocketAddr, broadcaster: Broadcaster) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    info!("WebSocket handshake completed for {}", peer_addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (frames, mut frames_rx) = mpsc::channel(FRAME_BUFFER);

    let subscriber = broadcaster.connect(Arc::new(WsTransport {
        peer_addr,
        frames: frames.clone(),
    }));

    let welcome = ServerMessage::Welcome {
        subscriber,
        timestamp: Utc::now(),
    };
    let _ = frames.send(Outbound::Frame(welcome)).await;

    // Spawn task writing queued frames to this client
    let mut send_task = tokio::spawn(async move {
        while let Some(outbound) = frames_rx.recv().await {
            let frame = match outbound {
                Outbound::Frame(frame) => frame,
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            };

            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(error) => warn!(%error, "failed to serialise frame for {}", peer_addr),
            }
        }
    });

    // Handle requests from the client
    let requests = broadcaster.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let reply = match serde_json::from_str::<ClientRequest>(&text) {
                        Ok(request) => handle_request(&requests, subscriber, request),
                        Err(error) => ServerMessage::Error {
                            message: format!("invalid request: {error}"),
                        },
                    };
                    if frames.send(Outbound::Frame(reply)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => {
                    // Tungstenite answers pings itself
                    debug!("Received ping from {}", peer_addr);
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", peer_addr, e);
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => {
            info!("Send task completed for {}", peer_addr);
            recv_task.abort();
        }
        _ = &mut recv_task => {
            info!("Receive task completed for {}", peer_addr);
        }
    }

    // Closing the connection queues a Close frame that ends the send task
    broadcaster.disconnect(subscriber);
    if !send_task.is_finished() {
        let _ = send_task.await;
    }

    info!("WebSocket connection closed for {}", peer_addr);
}

/// Apply a client request to the broadcaster and build the reply.
fn handle_request(
    broadcaster: &Broadcaster,
    subscriber: SubscriberId,
    request: ClientRequest,
) -> ServerMessage {
    match request {
        ClientRequest::Subscribe { symbols, events } => match interests(&symbols, &events) {
            Ok(interests) => {
                if broadcaster.subscribe(subscriber, interests.clone()) {
                    ServerMessage::Subscribed { interests }
                } else {
                    ServerMessage::Error {
                        message: format!("subscriber {subscriber} is no longer connected"),
                    }
                }
            }
            Err(message) => ServerMessage::Error { message },
        },
        ClientRequest::Unsubscribe => {
            broadcaster.unsubscribe(subscriber);
            ServerMessage::Unsubscribed
        }
        ClientRequest::Ping => ServerMessage::Pong {
            timestamp: Utc::now(),
        },
    }
}
