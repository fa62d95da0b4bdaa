use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::broadcast::{Subscription, Update};
use crate::error::ServerError;
use crate::models::dto::{ClientMessage, ErrorKind, ServerMessage};
use crate::session::{SessionId, SessionManager};

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(upgrade))
        .with_state(state)
}

/// Binds `addr` and serves until `shutdown` resolves. Returns the bound
/// address, which differs from `addr` when port 0 was requested.
pub fn spawn<F>(
    addr: SocketAddr,
    state: AppState,
    shutdown: F,
) -> Result<(SocketAddr, JoinHandle<Result<(), ServerError>>), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let server = axum::Server::try_bind(&addr)
        .map_err(|err| ServerError::Bind {
            addr,
            reason: err.to_string(),
        })?
        .serve(router(state).into_make_service());
    let local = server.local_addr();
    info!(%local, "viewer endpoint listening");
    let handle = tokio::spawn(async move {
        server
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|err| ServerError::Serve(err.to_string()))
    });
    Ok((local, handle))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_viewer(socket, state))
}

enum Event {
    Inbound(Option<Result<Message, axum::Error>>),
    Update(Option<Update>),
}

async fn serve_viewer(socket: WebSocket, state: AppState) {
    let session = state.sessions.open_session();
    info!(session, "viewer connected");
    let (mut sink, mut stream) = socket.split();
    let mut subscription: Option<Subscription> = None;

    'session: loop {
        let event = tokio::select! {
            inbound = stream.next() => Event::Inbound(inbound),
            update = next_update(&mut subscription) => Event::Update(update),
        };
        let replies = match event {
            Event::Inbound(Some(Ok(Message::Text(text)))) => {
                handle_control(&state, session, &text, &mut subscription).await
            }
            Event::Inbound(Some(Ok(Message::Close(_)))) | Event::Inbound(None) => break,
            Event::Inbound(Some(Err(err))) => {
                debug!(session, %err, "viewer socket error");
                break;
            }
            Event::Inbound(Some(Ok(_))) => continue,
            Event::Update(Some(Update::Snapshot(snapshot))) => {
                vec![ServerMessage::NetworkUpdate { data: snapshot }]
            }
            Event::Update(Some(Update::Status(status))) => vec![status.into()],
            Event::Update(None) => {
                subscription = None;
                continue;
            }
        };
        for reply in &replies {
            if !send(&mut sink, reply).await {
                break 'session;
            }
        }
    }

    drop(subscription);
    let _ = sink.close().await;
    let sessions = state.sessions.clone();
    if let Err(err) = task::spawn_blocking(move || sessions.close_session(session)).await {
        error!(session, %err, "failed to release session");
    }
    info!(session, "viewer disconnected");
}

async fn next_update(subscription: &mut Option<Subscription>) -> Option<Update> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => futures::future::pending().await,
    }
}

async fn handle_control(
    state: &AppState,
    session: SessionId,
    text: &str,
    subscription: &mut Option<Subscription>,
) -> Vec<ServerMessage> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            debug!(session, %err, "unrecognised control message");
            return vec![ServerMessage::error(
                ErrorKind::InvalidRequest,
                format!("Unrecognised message: {err}"),
            )];
        }
    };

    let sessions = state.sessions.clone();
    match message {
        ClientMessage::StartCapture { interface } => {
            let request = interface.unwrap_or_default();
            info!(session, interface = %request, "capture requested");
            match task::spawn_blocking(move || sessions.start_capture(session, &request)).await {
                Ok(Ok(started)) => {
                    *subscription = Some(started);
                    Vec::new()
                }
                Ok(Err(err)) => {
                    warn!(session, %err, "capture request failed");
                    vec![ServerMessage::from(&err)]
                }
                Err(err) => vec![ServerMessage::error(ErrorKind::Internal, err.to_string())],
            }
        }
        ClientMessage::StopTestTraffic => {
            if let Err(err) = task::spawn_blocking(move || sessions.stop_synthetic()).await {
                return vec![ServerMessage::error(ErrorKind::Internal, err.to_string())];
            }
            Vec::new()
        }
        ClientMessage::RequestPacketDetails {
            source_id,
            target_id,
            protocol,
        } => {
            // the session lock can be held across a capture start or join
            let lookup = task::spawn_blocking(move || {
                sessions.packet_details(session, source_id, target_id, protocol)
            });
            match lookup.await {
                Ok(packets) => {
                    debug!(session, %source_id, %target_id, %protocol, count = packets.len(), "packet details");
                    vec![ServerMessage::PacketDetails { packets }]
                }
                Err(err) => vec![ServerMessage::error(ErrorKind::Internal, err.to_string())],
            }
        }
    }
}

async fn send(sink: &mut SplitSink<WebSocket, Message>, message: &ServerMessage) -> bool {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(err) => {
            error!(%err, "failed to encode viewer message");
            return true;
        }
    };
    sink.send(Message::Text(text)).await.is_ok()
}
