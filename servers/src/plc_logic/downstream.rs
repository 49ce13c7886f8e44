use crate::plc_logic::config::Config;
use crate::plc_logic::model::{ClientMessage, ServerMessage};
use crate::plc_logic::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

pub async fn run(config: Config, app_state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    log::info!("Downstream server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        })
        .await
        .unwrap();
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    log::info!("Client {} connected", client_id);

    let mut data_rx = state.subscribe_data();
    let mut status_rx = state.subscribe_status();
    let mut notice_rx = state.subscribe_notices();

    // New clients immediately learn the current connection state, the way
    // the status callback fires on registration.
    if send_json(&mut socket, &ServerMessage::status(state.is_connected()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            // Handle incoming commands from the client
            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_msg) => handle_client_message(&state, client_msg).await,
                            Err(e) => ServerMessage::response_err(None, format!("bad request: {}", e)),
                        };
                        if send_json(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            // Relay live telemetry
            Ok(sample) = data_rx.recv() => {
                if send_json(&mut socket, &ServerMessage::telemetry(&sample)).await.is_err() {
                    break;
                }
            }
            // Relay connection status transitions
            Ok(connected) = status_rx.recv() => {
                if send_json(&mut socket, &ServerMessage::status(connected)).await.is_err() {
                    break;
                }
            }
            // Relay non-fatal notices
            Ok(notice) = notice_rx.recv() => {
                if send_json(&mut socket, &ServerMessage::notice(&notice)).await.is_err() {
                    break;
                }
            }
        }
    }

    log::info!("Client {} disconnected", client_id);
}

async fn send_json(socket: &mut WebSocket, msg: &ServerMessage) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await,
        Err(e) => {
            log::error!("Failed to encode server message: {}", e);
            Ok(())
        }
    }
}

async fn handle_client_message(state: &AppState, msg: ClientMessage) -> ServerMessage {
    match msg.action.as_str() {
        "read_plc" => {
            let register = msg.register.unwrap_or(state.config.base_register);
            match state.read_request(register, msg.count).await {
                Ok(data) => ServerMessage::response_ok(
                    msg.message_id,
                    serde_json::json!({ "register": register, "data": data }),
                ),
                Err(e) => ServerMessage::response_err(msg.message_id, e.to_string()),
            }
        }
        "write_plc" => {
            let register = msg.register.unwrap_or(state.config.base_register);
            let Some(value) = msg.value else {
                return ServerMessage::response_err(
                    msg.message_id,
                    "write_plc requires a value".to_string(),
                );
            };
            match state.write_request(register, value).await {
                Ok(()) => ServerMessage::response_ok(
                    msg.message_id,
                    serde_json::json!({ "register": register }),
                ),
                Err(e) => ServerMessage::response_err(msg.message_id, e.to_string()),
            }
        }
        "history" => ServerMessage::history(&state.history()),
        other => {
            ServerMessage::response_err(msg.message_id, format!("unknown action: {}", other))
        }
    }
}
