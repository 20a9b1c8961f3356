//! WebSocket transport for producer connections.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt, future};
use tracing::debug;

use super::AppState;
use crate::session::{
    CloseReason, ConnectionCloser, InboundConnection, InboundEvents, TransportError,
};

/// Close frame reasons are limited to 123 bytes.
const MAX_CLOSE_REASON: usize = 123;

/// `GET /ws/{session_id}`: upgrade and hand the socket to the manager.
pub async fn ingest(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| async move {
            let conn = WebSocketConnection::new(socket);
            if let Err(e) = state.manager.accept_connection(&session_id, conn).await {
                debug!(session_id = %session_id, error = %e, "Connection not accepted");
            }
        })
}

/// An upgraded producer socket.
pub struct WebSocketConnection {
    socket: WebSocket,
}

impl WebSocketConnection {
    pub const fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl InboundConnection for WebSocketConnection {
    fn split(self) -> (InboundEvents, Box<dyn ConnectionCloser>) {
        let (sink, stream) = self.socket.split();
        let events = stream
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Binary(data)) => Some(Ok(data)),
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError(e.to_string()))),
                })
            })
            .boxed();
        (events, Box::new(WebSocketCloser { sink }))
    }
}

struct WebSocketCloser {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl ConnectionCloser for WebSocketCloser {
    async fn close(&mut self, reason: CloseReason) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: close_code_for(&reason),
            reason: truncate_reason(reason.description()).to_string().into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        self.sink
            .close()
            .await
            .map_err(|e| TransportError(e.to_string()))
    }
}

/// WebSocket close code sent for each close reason.
pub const fn close_code_for(reason: &CloseReason) -> u16 {
    match reason {
        CloseReason::Normal => close_code::NORMAL,
        CloseReason::GoingAway => close_code::AWAY,
        CloseReason::Rejected(_) => close_code::POLICY,
        CloseReason::Unavailable(_) => close_code::ERROR,
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes() {
        assert_eq!(close_code_for(&CloseReason::Normal), 1000);
        assert_eq!(close_code_for(&CloseReason::GoingAway), 1001);
        assert_eq!(close_code_for(&CloseReason::Rejected("dup".into())), 1008);
        assert_eq!(close_code_for(&CloseReason::Unavailable("x".into())), 1011);
    }

    #[test]
    fn long_reasons_truncated_on_char_boundary() {
        assert_eq!(truncate_reason("short"), "short");
        let long = "é".repeat(100);
        let cut = truncate_reason(&long);
        assert!(cut.len() <= MAX_CLOSE_REASON);
        assert_eq!(cut.chars().count(), MAX_CLOSE_REASON / 2);
    }
}
