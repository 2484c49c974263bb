use futures::{SinkExt, StreamExt};
use specstream_core::analyzer::{AnalyzerEvent, ConnectionState, SpectrumAnalyzer};
use specstream_core::config::{AnalyzerConfig, AnalyzerConfigPatch};
use specstream_core::error::ConnectionError;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

fn magnitudes(db: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(db.len() * 4);
    for v in db {
        out.extend_from_slice(&10f32.powf(v / 20.0).to_le_bytes());
    }
    out
}

fn spectrum(peak_bin: usize) -> Vec<u8> {
    let mut db = vec![-90.0f32; 1024];
    db[peak_bin] = -50.0;
    magnitudes(&db)
}

/// Accepts one websocket client, sends `messages`, then either holds the
/// connection open until the client leaves or closes it.
async fn upstream(messages: Vec<Message>, hold_open: bool) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        for m in messages {
            ws.send(m).await.unwrap();
        }
        if hold_open {
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        } else {
            let _ = ws.close(None).await;
        }
    });
    (format!("ws://{addr}"), task)
}

fn analyzer() -> Arc<SpectrumAnalyzer> {
    Arc::new(SpectrumAnalyzer::new(AnalyzerConfig::default(), 100).unwrap())
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<AnalyzerEvent>, mut want: F) -> AnalyzerEvent
where
    F: FnMut(&AnalyzerEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(ev) if want(&ev) => return ev,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for analyzer event")
}

#[tokio::test]
async fn ingests_frames_from_upstream() {
    let frames = vec![
        Message::Binary(spectrum(100)),
        Message::Binary(spectrum(200)),
        Message::Binary(spectrum(300)),
    ];
    let (url, server) = upstream(frames, true).await;
    let a = analyzer();
    let mut events = a.subscribe();

    a.connect(&url).await.unwrap();
    assert!(a.is_connected());
    wait_for(&mut events, |e| matches!(e, AnalyzerEvent::FrameAvailable { seq: 3, .. })).await;

    let status = a.status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.buffer_size, 3);
    assert_eq!(status.frames_received, 3);
    assert_eq!(status.upstream_url.as_deref(), Some(url.as_str()));

    let signals = a.detect_signals(None).unwrap();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].bin_index, 300);

    a.disconnect().await;
    assert_eq!(a.connection_state(), ConnectionState::Disconnected);
    assert_eq!(a.status().buffer_size, 3);
    tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn connect_is_idempotent_for_the_same_url() {
    let (url, _server) = upstream(Vec::new(), true).await;
    let a = analyzer();
    a.connect(&url).await.unwrap();
    // The fake upstream accepts a single client; a second dial would hang.
    a.connect(&url).await.unwrap();
    assert!(a.is_connected());
    a.disconnect().await;
}

#[tokio::test]
async fn malformed_frames_do_not_break_the_stream() {
    let frames = vec![
        Message::Binary(vec![1, 2, 3]),
        Message::Text("hello".into()),
        Message::Binary(Vec::new()),
        Message::Binary(spectrum(10)),
    ];
    let (url, _server) = upstream(frames, true).await;
    let a = analyzer();
    let mut events = a.subscribe();

    a.connect(&url).await.unwrap();
    wait_for(&mut events, |e| matches!(e, AnalyzerEvent::FrameAvailable { .. })).await;

    let status = a.status();
    assert_eq!(status.decode_errors, 2);
    assert_eq!(status.buffer_size, 1);
    assert!(status.connected);
    a.disconnect().await;
}

#[tokio::test]
async fn upstream_close_moves_to_disconnected() {
    let (url, _server) = upstream(vec![Message::Binary(spectrum(5))], false).await;
    let a = analyzer();
    let mut events = a.subscribe();

    a.connect(&url).await.unwrap();
    wait_for(&mut events, |e| matches!(e, AnalyzerEvent::Disconnected { .. })).await;
    assert_eq!(a.connection_state(), ConnectionState::Disconnected);
    assert_eq!(a.status().buffer_size, 1);
}

#[tokio::test]
async fn a_new_url_replaces_the_connection() {
    let (first, _s1) = upstream(Vec::new(), true).await;
    let (second, _s2) = upstream(Vec::new(), true).await;
    let a = analyzer();

    a.connect(&first).await.unwrap();
    let mut events = a.subscribe();
    a.connect(&second).await.unwrap();

    wait_for(&mut events, |e| matches!(e, AnalyzerEvent::Disconnected { .. })).await;
    let connected = wait_for(&mut events, |e| matches!(e, AnalyzerEvent::Connected { .. })).await;
    assert!(matches!(connected, AnalyzerEvent::Connected { url } if url == second));
    assert_eq!(a.status().upstream_url.as_deref(), Some(second.as_str()));
    a.disconnect().await;
}

#[tokio::test]
async fn unreachable_upstream_reports_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let a = analyzer();
    let err = a.connect(&format!("ws://{addr}")).await.unwrap_err();
    assert!(matches!(err, ConnectionError::Unreachable { .. }));
    assert_eq!(a.connection_state(), ConnectionState::Disconnected);

    assert_eq!(a.connect("  ").await, Err(ConnectionError::EmptyUrl));
}

#[tokio::test]
async fn disconnect_when_idle_is_a_no_op() {
    let a = analyzer();
    let mut events = a.subscribe();
    a.disconnect().await;
    a.disconnect().await;
    assert_eq!(a.connection_state(), ConnectionState::Disconnected);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn config_updates_merge_and_notify() {
    let a = analyzer();
    let mut events = a.subscribe();
    let next = a
        .update_config(&AnalyzerConfigPatch::new().with_signal_threshold(-80.0))
        .unwrap();
    assert_eq!(next.signal_threshold, -80.0);
    assert_eq!(next.fft_size, 1024);
    assert!(matches!(
        events.try_recv(),
        Ok(AnalyzerEvent::ConfigUpdated { config }) if config.signal_threshold == -80.0
    ));

    assert!(a
        .update_config(&AnalyzerConfigPatch::new().with_fft_size(0))
        .is_err());
    assert_eq!(a.config().signal_threshold, -80.0);
}
