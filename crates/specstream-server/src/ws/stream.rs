use crate::state::AppState;
use axum::{
    extract::connect_info::ConnectInfo,
    extract::{ws, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use specstream_core::broadcaster::{ChannelTransport, ClientTransport, Outgoing};
use specstream_core::config::{AnalyzerConfigPatch, StreamerConfigPatch};
use specstream_core::error::BroadcasterError;
use specstream_core::frame::now_ms;
use specstream_core::protocol::{ClientCommand, ServerMessage};
use specstream_core::util::generate_unique_id;
use std::net::SocketAddr;
use std::sync::Arc;

const MAX_COMMAND_BYTES: usize = 4096;

pub async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> axum::response::Response {
    let max = state.broadcaster.streamer_config().max_clients;
    if state.broadcaster.client_count() >= max {
        return (StatusCode::SERVICE_UNAVAILABLE, "too many stream clients").into_response();
    }
    ws.on_upgrade(move |socket| handle(socket, state, addr))
}

async fn handle(socket: ws::WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let client_id = generate_unique_id();
    let (transport, mut outgoing) = ChannelTransport::new();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    if let Err(e) = state.broadcaster.add_client(&client_id, transport.clone()) {
        tracing::warn!(client_id = %client_id, peer = %addr, error = %e, "stream client rejected");
        let _ = ws_sender
            .send(ws::Message::Text(ServerMessage::error(&e).to_json()))
            .await;
        let _ = ws_sender.close().await;
        return;
    }
    tracing::info!(client_id = %client_id, peer = %addr, "stream ws connected");

    // Each write is acknowledged only after the socket took it, so the
    // broadcaster never has more than one message queued here.
    let send_task = tokio::spawn(async move {
        while let Some((msg, ack)) = outgoing.recv_pending().await {
            let msg = match msg {
                Outgoing::Binary(b) => ws::Message::Binary(b),
                Outgoing::Text(t) => ws::Message::Text(t),
            };
            if ws_sender.send(msg).await.is_err() {
                break;
            }
            ack.written();
        }
        let _ = ws_sender.close().await;
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            ws::Message::Text(txt) => {
                if txt.len() > MAX_COMMAND_BYTES {
                    tracing::debug!(client_id = %client_id, bytes = txt.len(), "oversized command ignored");
                    continue;
                }
                let Some(reply) = handle_command(&state, &client_id, &txt).await else {
                    continue;
                };
                if transport.send(Outgoing::Text(reply.to_json())).await.is_err() {
                    break;
                }
            }
            ws::Message::Close(_) => break,
            _ => {}
        }
    }

    state.broadcaster.remove_client(&client_id);
    send_task.abort();
    tracing::info!(client_id = %client_id, "stream ws disconnected");
}

/// Returns the reply for one client command, if it has one.
pub async fn handle_command(state: &AppState, client_id: &str, txt: &str) -> Option<ServerMessage> {
    let cmd = match serde_json::from_str::<ClientCommand>(txt) {
        Ok(cmd) => cmd,
        Err(e) => return Some(ServerMessage::error(format!("invalid command: {e}"))),
    };

    let reply = match cmd {
        ClientCommand::Status => {
            let snapshot = state.status();
            ServerMessage::Status {
                analyzer: snapshot.analyzer,
                stream: snapshot.stream,
            }
        }
        ClientCommand::Config { config } => match AnalyzerConfigPatch::from_json(config)
            .and_then(|patch| state.analyzer.update_config(&patch))
        {
            Ok(config) => ServerMessage::Config { config },
            Err(e) => ServerMessage::error(e),
        },
        ClientCommand::Streamer { config } => {
            let result = StreamerConfigPatch::from_json(config)
                .map_err(BroadcasterError::from)
                .and_then(|patch| state.broadcaster.update_streamer_config(&patch));
            match result {
                Ok(config) => ServerMessage::Streamer { config },
                Err(e) => ServerMessage::error(e),
            }
        }
        ClientCommand::Signals { threshold } => {
            let threshold = threshold.unwrap_or_else(|| state.analyzer.config().signal_threshold);
            match state.analyzer.detect_signals(Some(threshold)) {
                Ok(signals) => ServerMessage::Signals {
                    count: signals.len(),
                    signals,
                    threshold,
                    timestamp_ms: now_ms(),
                },
                Err(e) => ServerMessage::error(e),
            }
        }
        ClientCommand::SignalStats => ServerMessage::SignalStats {
            stats: state.analyzer.signal_stats(),
        },
        ClientCommand::Performance { mode } => {
            // The broadcaster answers with a stream_config notice.
            match state.broadcaster.set_client_performance(client_id, mode) {
                Ok(()) => return None,
                Err(e) => ServerMessage::error(e),
            }
        }
    };
    Some(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use specstream_core::analyzer::SpectrumAnalyzer;
    use specstream_core::broadcaster::StreamingBroadcaster;
    use specstream_core::config::{AnalyzerConfig, PerformanceMode, StreamerConfig};

    fn state() -> AppState {
        let analyzer = Arc::new(SpectrumAnalyzer::new(AnalyzerConfig::default(), 4).unwrap());
        let broadcaster = Arc::new(
            StreamingBroadcaster::new(analyzer.clone(), StreamerConfig::default()).unwrap(),
        );
        AppState::new(analyzer, broadcaster, None)
    }

    fn json(msg: Option<ServerMessage>) -> serde_json::Value {
        serde_json::from_str(&msg.expect("reply").to_json()).unwrap()
    }

    #[tokio::test]
    async fn garbage_commands_get_an_error_reply() {
        let s = state();
        let reply = json(handle_command(&s, "c1", "not json").await);
        assert_eq!(reply["type"], "error");
        let reply = json(handle_command(&s, "c1", r#"{"cmd":"launch"}"#).await);
        assert_eq!(reply["type"], "error");
    }

    #[tokio::test]
    async fn config_command_updates_the_analyzer() {
        let s = state();
        let reply = json(
            handle_command(&s, "c1", r#"{"cmd":"config","config":{"signalThreshold":-75}}"#).await,
        );
        assert_eq!(reply["type"], "config");
        assert_eq!(reply["config"]["signal_threshold"], -75.0);
        assert_eq!(s.analyzer.config().signal_threshold, -75.0);
    }

    #[tokio::test]
    async fn streamer_command_rejects_bad_rates() {
        let s = state();
        let reply = json(
            handle_command(&s, "c1", r#"{"cmd":"streamer","config":{"streamingRate":500}}"#).await,
        );
        assert_eq!(reply["type"], "error");
        assert_eq!(s.broadcaster.streamer_config(), StreamerConfig::default());
    }

    #[tokio::test]
    async fn performance_command_targets_the_calling_client() {
        let s = state();
        let (t, _rx) = ChannelTransport::new();
        s.broadcaster.add_client("c1", t).unwrap();
        let reply = handle_command(&s, "c1", r#"{"cmd":"performance","mode":"quality"}"#).await;
        assert!(reply.is_none());
        assert_eq!(
            s.broadcaster.client_performance("c1"),
            Some(Some(PerformanceMode::Quality))
        );

        let reply = json(handle_command(&s, "ghost", r#"{"cmd":"performance","mode":null}"#).await);
        assert_eq!(reply["type"], "error");
    }

    #[tokio::test]
    async fn status_and_stats_commands_reply() {
        let s = state();
        let reply = json(handle_command(&s, "c1", r#"{"cmd":"status"}"#).await);
        assert_eq!(reply["type"], "status");
        assert_eq!(reply["analyzer"]["connected"], false);
        let reply = json(handle_command(&s, "c1", r#"{"cmd":"signal_stats"}"#).await);
        assert_eq!(reply["type"], "signal_stats");
        assert_eq!(reply["stats"]["total_detections"], 0);
    }
}
