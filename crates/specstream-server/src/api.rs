use crate::build_info;
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use specstream_core::config::{AnalyzerConfigPatch, StreamerConfigPatch};
use specstream_core::detect::Signal;
use specstream_core::dsp::{power_stats, PowerStats};
use specstream_core::error::{BroadcasterError, ConnectionError, ValidationError};
use specstream_core::frame::{now_ms, Frame};
use std::sync::Arc;

const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    Unavailable(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (ApiError::BadRequest(message)
        | ApiError::NotFound(message)
        | ApiError::Conflict(message)
        | ApiError::BadGateway(message)
        | ApiError::Unavailable(message)) = self;
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<ConnectionError> for ApiError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::EmptyUrl => ApiError::BadRequest(e.to_string()),
            ConnectionError::Unreachable { .. } | ConnectionError::Timeout { .. } => {
                ApiError::BadGateway(e.to_string())
            }
        }
    }
}

impl From<BroadcasterError> for ApiError {
    fn from(e: BroadcasterError) -> Self {
        match e {
            BroadcasterError::Validation(v) => v.into(),
            BroadcasterError::Conflict { .. } => ApiError::Conflict(e.to_string()),
            BroadcasterError::UnknownClient { .. } => ApiError::NotFound(e.to_string()),
            BroadcasterError::CapacityExceeded { .. } | BroadcasterError::Closed => {
                ApiError::Unavailable(e.to_string())
            }
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.status())
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(*state.analyzer.config())
}

pub async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> ApiResult<Value> {
    let patch = AnalyzerConfigPatch::from_json(body)?;
    let config = state.analyzer.update_config(&patch)?;
    Ok(Json(json!({ "success": true, "config": config })))
}

#[derive(Debug, Deserialize)]
pub struct SignalsQuery {
    pub threshold: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct SignalsResponse {
    pub signals: Vec<Signal>,
    pub count: usize,
    pub threshold: f64,
    pub timestamp_ms: u64,
}

pub async fn signals(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SignalsQuery>,
) -> ApiResult<SignalsResponse> {
    let threshold = q
        .threshold
        .unwrap_or_else(|| state.analyzer.config().signal_threshold);
    let signals = state.analyzer.detect_signals(Some(threshold))?;
    Ok(Json(SignalsResponse {
        count: signals.len(),
        signals,
        threshold,
        timestamp_ms: now_ms(),
    }))
}

pub async fn signal_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.analyzer.signal_stats())
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectRequest {
    #[serde(default)]
    pub url: Option<String>,
}

pub async fn connect(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ConnectRequest>>,
) -> ApiResult<Value> {
    let requested = body.and_then(|Json(b)| b.url);
    let url = requested
        .or_else(|| state.default_upstream.clone())
        .ok_or_else(|| ApiError::BadRequest("no upstream url given or configured".into()))?;
    state.analyzer.connect(&url).await?;
    Ok(Json(json!({ "success": true, "connected": true, "url": url })))
}

pub async fn disconnect(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.analyzer.disconnect().await;
    Json(json!({ "success": true, "connected": false }))
}

#[derive(Debug, Serialize)]
pub struct FrameView {
    pub seq: u64,
    pub captured_at_ms: u64,
    pub center_frequency: f64,
    pub sample_rate: f64,
    pub fft_size: usize,
    pub bin_width_hz: f64,
    pub stats: PowerStats,
    pub powers: Vec<f32>,
}

impl From<&Frame> for FrameView {
    fn from(f: &Frame) -> Self {
        Self {
            seq: f.seq,
            captured_at_ms: f.captured_at_ms,
            center_frequency: f.center_frequency,
            sample_rate: f.sample_rate,
            fft_size: f.fft_size,
            bin_width_hz: f.bin_width_hz(),
            stats: power_stats(&f.powers),
            powers: f.powers.clone(),
        }
    }
}

pub async fn latest_frame(State(state): State<Arc<AppState>>) -> ApiResult<FrameView> {
    let frame = state
        .analyzer
        .latest_frame()
        .ok_or_else(|| ApiError::NotFound("no frame received yet".into()))?;
    Ok(Json(FrameView::from(frame.as_ref())))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub count: usize,
    pub frames: Vec<FrameView>,
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let frames: Vec<FrameView> = state
        .analyzer
        .recent_frames(limit)
        .iter()
        .map(|f| FrameView::from(f.as_ref()))
        .collect();
    Json(HistoryResponse {
        count: frames.len(),
        frames,
    })
}

pub async fn clear_buffer(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cleared = state.analyzer.clear_buffer();
    Json(json!({ "success": true, "cleared": cleared }))
}

pub async fn stream_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.broadcaster.stats())
}

pub async fn stream_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.broadcaster.streamer_config())
}

pub async fn update_stream_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> ApiResult<Value> {
    let patch = StreamerConfigPatch::from_json(body)?;
    let config = state.broadcaster.update_streamer_config(&patch)?;
    Ok(Json(json!({ "success": true, "config": config })))
}

pub async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "build": build_info::info(),
        "uptime_secs": state.uptime_secs(),
        "clients": state.broadcaster.client_count(),
    }))
}
