//! WebSocket transport: one host controller per connection.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use playground_core::SandboxConfig;
use playground_host::{HostController, HostError};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::protocol::{ClientMessage, ServerMessage};

/// WebSocket handler state.
#[derive(Clone)]
pub struct WsState {
    /// Settings for every context spawned by this server.
    pub config: Arc<SandboxConfig>,
}

impl WsState {
    #[must_use]
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn health() -> &'static str {
    "ok"
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending messages to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let events = tx.clone();
    let mut controller = match HostController::new(state.config.as_ref().clone(), move |event| {
        let _ = events.send(ServerMessage::Event { event });
    }) {
        Ok(controller) => controller,
        Err(e) => {
            tracing::error!("Failed to create host controller: {e}");
            let _ = tx.send(ServerMessage::error(e));
            drop(tx);
            let _ = send_task.await;
            return;
        }
    };
    tracing::info!(context = %controller.context_id(), "client connected");

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s.into(),
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid client message: {e}");
                let _ = tx.send(ServerMessage::error(format!("Invalid message: {e}")));
                continue;
            }
        };

        if let Err(e) = dispatch(&mut controller, client_msg, &tx) {
            tracing::warn!(context = %controller.context_id(), "request failed: {e}");
            let _ = tx.send(ServerMessage::error(e));
        }
    }

    tracing::info!(context = %controller.context_id(), "client disconnected");
    drop(controller);
    send_task.abort();
}

fn dispatch(
    controller: &mut HostController,
    msg: ClientMessage,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) -> Result<(), HostError> {
    match msg {
        ClientMessage::Start {
            user_code,
            module_code,
        } => controller.start_execution(&user_code, &module_code),
        ClientMessage::Module { contents } => controller.send_module_message(contents),
        ClientMessage::Reset => controller.reset(),
        ClientMessage::Ping => {
            let _ = tx.send(ServerMessage::Pong);
            Ok(())
        }
    }
}

/// Create the WebSocket router.
///
/// # Example
/// ```ignore
/// let app = create_ws_router(SandboxConfig::default());
/// axum::serve(listener, app).await?;
/// ```
#[must_use]
pub fn create_ws_router(config: SandboxConfig) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(WsState::new(config))
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn test_health() {
        let app = create_ws_router(SandboxConfig::default());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let app = create_ws_router(SandboxConfig::default());
        let response = app
            .oneshot(Request::get("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
