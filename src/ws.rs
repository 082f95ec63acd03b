//! WebSocket transport adapter (spec §9: "Polymorphism over the
//! transport" — the WebSocket binding is a thin adapter, not part of
//! the core).
//!
//! Grounded on `zrc-admin-console::api::ws::ws_handler`/`handle_socket`
//! (`WebSocketUpgrade` extraction, `on_upgrade` closure shape),
//! generalized here from a one-way stats push loop to a full
//! bidirectional, record-framed `RecordTransport` implementation.

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use async_trait::async_trait;

use crate::collab::ConnectRequest;
use crate::gateway::{self, GatewayState};
use crate::session::RecordTransport;

/// Binds a device-facing `axum::extract::ws::WebSocket` to the
/// transport-agnostic `RecordTransport` trait `session`/`gateway`
/// depend on. One record per WebSocket binary message (spec §4.2
/// ordering contract); text/ping/pong frames are not part of this
/// protocol and are ignored.
pub struct WsTransport {
    socket: WebSocket,
    selector: String,
}

impl WsTransport {
    fn new(socket: WebSocket, selector: String) -> Self {
        WsTransport { socket, selector }
    }
}

#[async_trait]
impl RecordTransport for WsTransport {
    async fn recv(&mut self) -> Result<Vec<u8>, String> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Binary(bytes))) => return Ok(bytes),
                Some(Ok(Message::Close(_))) => return Err("connection closed".to_string()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.to_string()),
                None => return Err("connection closed".to_string()),
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), String> {
        self.socket
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| e.to_string())
    }

    fn selector(&self) -> &str {
        &self.selector
    }

    async fn close(&mut self, reason: &str) {
        let frame = CloseFrame { code: 1000, reason: Cow::Owned(reason.to_string()) };
        let _ = self.socket.send(Message::Close(Some(frame))).await;
    }
}

/// Axum handler for `/wssk/:partition_key/:row_key` (spec §6 transport
/// URL). The device-chosen selector (`devs-key-<hex>` or
/// `jacdac-key-<hex>`) travels as the WebSocket subprotocol; it is read
/// from the upgrade request and echoed back so the handshake completes,
/// then handed to `session::perform_handshake` unchanged.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path((partition_key, row_key)): Path<(String, String)>,
    headers: HeaderMap,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    let selector = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let req = ConnectRequest { partition_key, row_key };

    ws.protocols([selector.clone()]).on_upgrade(move |socket| async move {
        let transport = WsTransport::new(socket, selector);
        gateway::serve_connection(transport, req, state).await;
    })
}
