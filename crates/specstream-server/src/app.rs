use crate::{api, state::AppState, ws};
use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tower_http::compression::CompressionLayer;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(api::status))
        .route("/api/config", get(api::get_config).post(api::update_config))
        .route("/api/signals", get(api::signals))
        .route("/api/signals/stats", get(api::signal_stats))
        .route("/api/connect", post(api::connect))
        .route("/api/disconnect", post(api::disconnect))
        .route("/api/fft/latest", get(api::latest_frame))
        .route("/api/fft/history", get(api::history))
        .route("/api/buffer/clear", post(api::clear_buffer))
        .route("/api/stream/stats", get(api::stream_stats))
        .route(
            "/api/stream/config",
            get(api::stream_config).post(api::update_stream_config),
        )
        .route("/api/info", get(api::info))
        .route("/stream", get(ws::stream::upgrade))
        .route("/events", get(ws::events::upgrade))
        .layer(CompressionLayer::new())
        .with_state(state)
}

pub fn bind_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    format!("{host}:{port}")
        .parse()
        .with_context(|| format!("parse bind address {host}:{port}"))
}

pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(bind = %addr, "server listening");
    serve_until(listener, state, shutdown_signal()).await
}

/// Serves until `signal` resolves, then lets open requests drain.
pub async fn serve_until(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal)
    .await
    .context("serve")
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = ?e, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown requested");
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use specstream_core::analyzer::SpectrumAnalyzer;
    use specstream_core::broadcaster::StreamingBroadcaster;
    use specstream_core::config::{AnalyzerConfig, StreamerConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn serve_answers_until_the_signal_fires() {
        let analyzer = Arc::new(SpectrumAnalyzer::new(AnalyzerConfig::default(), 4).unwrap());
        let broadcaster = Arc::new(
            StreamingBroadcaster::new(analyzer.clone(), StreamerConfig::default()).unwrap(),
        );
        let state = Arc::new(AppState::new(analyzer, broadcaster, None));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve_until(listener, state, async {
            let _ = stop_rx.await;
        }));

        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"GET /api/info HTTP/1.1\r\nhost: test\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        conn.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }

    #[test]
    fn bind_addr_brackets_ipv6_hosts() {
        assert_eq!(
            bind_addr("::1", 8092).unwrap(),
            "[::1]:8092".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(bind_addr("0.0.0.0", 80).unwrap().port(), 80);
        assert!(bind_addr("not a host", 80).is_err());
    }
}
