//! Browser-facing websocket endpoint.
//!
//! Each upgraded socket becomes one text-frame envelope connection
//! served by [`Relay`].

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use vmcast_core::{Relay, RelayError};

/// Path browsers connect to.
pub const WS_PATH: &str = "/ws";

#[derive(Clone)]
struct WsState {
    relay: Arc<Relay>,
    shutdown: CancellationToken,
}

pub fn router(relay: Arc<Relay>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route(WS_PATH, get(ws_upgrade))
        .with_state(WsState { relay, shutdown })
}

async fn ws_upgrade(State(state): State<WsState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (sink, frames) = socket_transport(socket);
        state.relay.serve(sink, frames, state.shutdown).await;
    })
}

/// Split a websocket into envelope text frames.
///
/// Binary frames are accepted when they hold UTF-8. A close frame ends
/// the stream with [`RelayError::ConnectionClosed`].
pub fn socket_transport(
    socket: WebSocket,
) -> (
    impl Sink<String, Error = RelayError> + Send,
    impl Stream<Item = Result<String, RelayError>> + Send + Unpin,
) {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| RelayError::Transport(e.to_string()))
        .with(|text: String| future::ready(Ok::<_, RelayError>(Message::Text(text))));
    let frames = stream.filter_map(|message| {
        future::ready(match message {
            Ok(Message::Text(text)) => Some(Ok(text)),
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => Some(Ok(text)),
                Err(_) => {
                    debug!("ignoring non-text binary frame");
                    None
                }
            },
            Ok(Message::Close(_)) => Some(Err(RelayError::ConnectionClosed)),
            Ok(_) => None,
            Err(e) => Some(Err(RelayError::Transport(e.to_string()))),
        })
    });
    (sink, frames)
}
