use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};

use crate::state::AppState;
use crate::ws::actor;
use crate::ws::handshake::{self, Handshake};

/// GET /ws
/// WebSocket upgrade endpoint. The upgrade is unauthenticated; the first
/// frame must be the in-band auth handshake. Only after the credential
/// verifies is a stream constructed and registered.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let user_id = match handshake::authenticate(&mut socket, &state.jwt_secret).await {
        Handshake::Authenticated(user_id) => user_id,
        // The close frame is already on the wire; nothing was registered.
        Handshake::Rejected(_) => return,
    };

    let stream = state.registry.register(user_id);
    actor::run_stream(socket, state, stream).await;
}
