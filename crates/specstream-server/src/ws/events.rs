use crate::state::AppState;
use axum::{
    extract::connect_info::ConnectInfo,
    extract::{ws, State, WebSocketUpgrade},
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use specstream_core::protocol::json_string;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    source: &'a str,
    #[serde(flatten)]
    event: &'a T,
}

pub async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| handle(socket, state, addr))
}

async fn handle(socket: ws::WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let mut analyzer_events = state.analyzer.subscribe();
    let mut stream_events = state.broadcaster.subscribe();
    tracing::info!(peer = %addr, "events ws connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let initial = json_string(&Envelope {
        source: "server",
        event: &state.status(),
    });
    if ws_sender.send(ws::Message::Text(initial)).await.is_err() {
        return;
    }

    let send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                ev = analyzer_events.recv() => match ev {
                    Ok(ev) => json_string(&Envelope { source: "analyzer", event: &ev }),
                    Err(RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "events client lagging behind analyzer");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
                ev = stream_events.recv() => match ev {
                    Ok(ev) => json_string(&Envelope { source: "stream", event: &ev }),
                    Err(RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "events client lagging behind stream");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            if ws_sender.send(ws::Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        if matches!(msg, ws::Message::Close(_)) {
            break;
        }
    }

    tracing::info!(peer = %addr, "events ws disconnected");
    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use specstream_core::analyzer::AnalyzerEvent;

    #[test]
    fn envelope_flattens_the_event() {
        let ev = AnalyzerEvent::BufferCleared { previous_size: 3 };
        let v: serde_json::Value = serde_json::from_str(&json_string(&Envelope {
            source: "analyzer",
            event: &ev,
        }))
        .unwrap();
        assert_eq!(v["source"], "analyzer");
        assert_eq!(v["event"], "buffer_cleared");
        assert_eq!(v["previous_size"], 3);
    }
}
