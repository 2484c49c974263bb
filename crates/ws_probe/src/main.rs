use anyhow::Context;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use specstream_core::protocol::PacketDecoder;
use std::io::IsTerminal;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Parser)]
#[command(
    name = "ws_probe",
    version,
    about = "Connect to a specstream WebSocket and print a short message summary."
)]
struct Args {
    /// WebSocket URL (example: ws://127.0.0.1:8092/stream)
    url: String,

    /// Number of messages to print before exiting
    #[arg(long, default_value_t = 5)]
    count: usize,

    /// Per-message read timeout (milliseconds)
    #[arg(long, default_value_t = 4000)]
    timeout_ms: u64,

    /// JSON command to send after connecting (example: '{"cmd":"status"}')
    #[arg(long)]
    command: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .with_writer(std::io::stdout)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .map_err(|e| anyhow::anyhow!("init tracing: {e}"))?;

    let args = Args::parse();
    let (mut ws, _) = tokio_tungstenite::connect_async(args.url.as_str())
        .await
        .context("connect")?;
    if let Some(cmd) = args.command {
        ws.send(Message::Text(cmd)).await.context("send command")?;
    }

    let mut decoder = PacketDecoder::new();
    for idx in 0..args.count {
        let msg = tokio::time::timeout(Duration::from_millis(args.timeout_ms), ws.next())
            .await
            .context("timeout")?
            .context("websocket ended")?
            .context("read message")?;

        match msg {
            Message::Text(s) => {
                let kind = serde_json::from_str::<serde_json::Value>(&s)
                    .ok()
                    .and_then(|v| {
                        v.get("type")
                            .or_else(|| v.get("event"))
                            .and_then(|t| t.as_str().map(str::to_string))
                    })
                    .unwrap_or_else(|| "?".to_string());
                tracing::info!(idx, bytes = s.len(), kind = %kind, "text");
            }
            Message::Binary(b) => match decoder.decode(&b) {
                Ok(pkt) => {
                    tracing::info!(
                        idx,
                        bytes = b.len(),
                        compressed = b.first() == Some(&specstream_core::protocol::PACKET_ZSTD),
                        seq = pkt.seq,
                        bins = pkt.powers().len(),
                        fft_size = pkt.fft_size,
                        decimation = pkt.decimation,
                        source = pkt.source.as_str(),
                        peak_db = pkt.stats.max,
                        "frame"
                    );
                }
                Err(e) => {
                    tracing::warn!(idx, bytes = b.len(), error = ?e, "undecodable binary message");
                }
            },
            Message::Ping(b) => {
                tracing::info!(idx, bytes = b.len(), "ping");
            }
            Message::Pong(b) => {
                tracing::info!(idx, bytes = b.len(), "pong");
            }
            Message::Close(frame) => {
                tracing::info!(idx, frame = ?frame, "close");
                break;
            }
            Message::Frame(_) => {}
        }
    }

    let _ = ws.close(None).await;
    Ok(())
}
