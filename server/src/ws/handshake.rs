//! In-band authentication handshake for freshly upgraded sockets.
//!
//! The upgrade itself is unauthenticated; the first application frame must
//! be `{"type":"auth","token":"<jwt>"}`. A wrong shape, a wrong type string,
//! an unverifiable token, or silence past the deadline closes the connection
//! with a policy-violation frame. No stream is constructed or registered
//! until the handshake succeeds.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use serde::Deserialize;
use tokio::time::timeout;

use crate::auth::jwt;

/// RFC 6455 close code sent on any handshake violation.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// The client must present its auth frame within this window.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

/// Acknowledgement sent once the credential verifies, before any
/// notification traffic.
const AUTH_SUCCESS_ACK: &str = r#"{"type":"auth_success"}"#;

/// Expected shape of the first frame.
#[derive(Debug, Deserialize)]
struct AuthFrame {
    #[serde(rename = "type")]
    kind: String,
    token: String,
}

/// Terminal states of the handshake.
pub enum Handshake {
    /// Credential verified; carries the embedded user id. The ack frame has
    /// already been sent.
    Authenticated(i64),
    /// Connection rejected and closed; carries the diagnostic sent to the
    /// client.
    Rejected(&'static str),
}

/// Drive the handshake on a freshly upgraded socket.
pub async fn authenticate(socket: &mut WebSocket, jwt_secret: &[u8]) -> Handshake {
    let frame = match first_application_frame(socket).await {
        Some(frame) => frame,
        None => return reject(socket, "Failed to read auth message").await,
    };

    let auth: AuthFrame = match serde_json::from_str(&frame) {
        Ok(auth) => auth,
        Err(_) => return reject(socket, "Invalid auth message").await,
    };

    if auth.kind != "auth" {
        return reject(socket, "Invalid message type").await;
    }

    let claims = match jwt::validate_access_token(jwt_secret, &auth.token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::debug!(error = %e, "handshake token rejected");
            return reject(socket, "Unauthorized").await;
        }
    };

    if socket
        .send(Message::Text(AUTH_SUCCESS_ACK.into()))
        .await
        .is_err()
    {
        return Handshake::Rejected("Connection closed before ack");
    }

    tracing::info!(user_id = claims.sub, "websocket handshake authenticated");
    Handshake::Authenticated(claims.sub)
}

/// Wait for the first Text or Binary frame, answering interleaved pings.
/// Returns None on deadline, close, or transport error.
async fn first_application_frame(socket: &mut WebSocket) -> Option<String> {
    let wait = timeout(HANDSHAKE_DEADLINE, async {
        loop {
            match socket.recv().await {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes.to_vec()).ok();
                }
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        return None;
                    }
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            }
        }
    });

    wait.await.ok().flatten()
}

/// Send a policy-violation close frame with a short diagnostic and settle in
/// the rejected state.
async fn reject(socket: &mut WebSocket, reason: &'static str) -> Handshake {
    tracing::warn!(reason, "websocket handshake rejected");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: reason.into(),
        })))
        .await;
    Handshake::Rejected(reason)
}
