use crate::error::ValidationError;
use crate::frame::Acquisition;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

pub const MAX_FFT_SIZE: usize = 1 << 20;
pub const MAX_STREAMING_RATE_HZ: f64 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
    #[serde(default = "default_center_frequency")]
    pub center_frequency: f64,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    #[serde(default = "default_signal_threshold")]
    pub signal_threshold: f64,
}

fn default_fft_size() -> usize {
    1024
}
fn default_center_frequency() -> f64 {
    145_000_000.0
}
fn default_sample_rate() -> f64 {
    2_400_000.0
}
fn default_signal_threshold() -> f64 {
    -70.0
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            fft_size: default_fft_size(),
            center_frequency: default_center_frequency(),
            sample_rate: default_sample_rate(),
            signal_threshold: default_signal_threshold(),
        }
    }
}

impl AnalyzerConfig {
    pub fn acquisition(&self) -> Acquisition {
        Acquisition {
            center_frequency: self.center_frequency,
            sample_rate: self.sample_rate,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_fft_size(self.fft_size)?;
        validate_positive_hz("center_frequency", self.center_frequency)?;
        validate_positive_hz("sample_rate", self.sample_rate)?;
        validate_finite("signal_threshold", self.signal_threshold)
    }

    /// Validates every field of `patch` and returns the merged config.
    /// Nothing is applied if any field is invalid.
    pub fn merged(&self, patch: &AnalyzerConfigPatch) -> Result<Self, ValidationError> {
        patch.validate()?;
        Ok(Self {
            fft_size: patch.fft_size.unwrap_or(self.fft_size),
            center_frequency: patch.center_frequency.unwrap_or(self.center_frequency),
            sample_rate: patch.sample_rate.unwrap_or(self.sample_rate),
            signal_threshold: patch.signal_threshold.unwrap_or(self.signal_threshold),
        })
    }
}

/// Partial update for [`AnalyzerConfig`]; unset fields keep their value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AnalyzerConfigPatch {
    pub fft_size: Option<usize>,
    pub center_frequency: Option<f64>,
    pub sample_rate: Option<f64>,
    pub signal_threshold: Option<f64>,
}

impl AnalyzerConfigPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fft_size(mut self, v: usize) -> Self {
        self.fft_size = Some(v);
        self
    }

    pub fn with_center_frequency(mut self, v: f64) -> Self {
        self.center_frequency = Some(v);
        self
    }

    pub fn with_sample_rate(mut self, v: f64) -> Self {
        self.sample_rate = Some(v);
        self
    }

    pub fn with_signal_threshold(mut self, v: f64) -> Self {
        self.signal_threshold = Some(v);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(v) = self.fft_size {
            validate_fft_size(v)?;
        }
        if let Some(v) = self.center_frequency {
            validate_positive_hz("center_frequency", v)?;
        }
        if let Some(v) = self.sample_rate {
            validate_positive_hz("sample_rate", v)?;
        }
        if let Some(v) = self.signal_threshold {
            validate_finite("signal_threshold", v)?;
        }
        Ok(())
    }

    /// Parses a JSON object of optional fields. Accepts snake_case keys, their
    /// camelCase forms and the legacy `center_freq` / `samp_rate` names.
    pub fn from_json(value: Value) -> Result<Self, ValidationError> {
        let mut patch = Self::default();
        for (key, v) in into_object(value)? {
            match key.as_str() {
                "fft_size" | "fftSize" => patch.fft_size = field(&key, v)?,
                "center_frequency" | "centerFrequency" | "center_freq" => {
                    patch.center_frequency = field(&key, v)?
                }
                "sample_rate" | "sampleRate" | "samp_rate" => patch.sample_rate = field(&key, v)?,
                "signal_threshold" | "signalThreshold" => {
                    patch.signal_threshold = field(&key, v)?
                }
                _ => return Err(ValidationError::new(key, "unknown field")),
            }
        }
        patch.validate()?;
        Ok(patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceMode {
    Performance,
    #[default]
    Balanced,
    Quality,
}

/// Preset values a performance mode stands for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceProfile {
    /// Peak-hold decimation factor applied before sending.
    pub decimation: usize,
    pub streaming_rate_hz: f64,
    pub compression: bool,
}

impl PerformanceMode {
    pub const ALL: [PerformanceMode; 3] = [
        PerformanceMode::Performance,
        PerformanceMode::Balanced,
        PerformanceMode::Quality,
    ];

    pub fn profile(self) -> PerformanceProfile {
        match self {
            PerformanceMode::Performance => PerformanceProfile {
                decimation: 4,
                streaming_rate_hz: 15.0,
                compression: true,
            },
            PerformanceMode::Balanced => PerformanceProfile {
                decimation: 2,
                streaming_rate_hz: 30.0,
                compression: true,
            },
            PerformanceMode::Quality => PerformanceProfile {
                decimation: 1,
                streaming_rate_hz: 60.0,
                compression: false,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PerformanceMode::Performance => "performance",
            PerformanceMode::Balanced => "balanced",
            PerformanceMode::Quality => "quality",
        }
    }
}

impl std::str::FromStr for PerformanceMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "performance" => Ok(PerformanceMode::Performance),
            "balanced" => Ok(PerformanceMode::Balanced),
            "quality" => Ok(PerformanceMode::Quality),
            other => Err(ValidationError::new(
                "performance_mode",
                format!("unknown mode {other:?} (expected performance, balanced or quality)"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    #[default]
    Live,
    /// Deterministic generated frames instead of analyzer output.
    Synthetic,
}

impl SourceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceMode::Live => "live",
            SourceMode::Synthetic => "synthetic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamerConfig {
    pub performance_mode: PerformanceMode,
    pub streaming_rate_hz: f64,
    pub compression_enabled: bool,
    pub source_mode: SourceMode,
    pub max_clients: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self::for_mode(PerformanceMode::default())
    }
}

impl StreamerConfig {
    pub const DEFAULT_MAX_CLIENTS: usize = 100;

    pub fn for_mode(mode: PerformanceMode) -> Self {
        let p = mode.profile();
        Self {
            performance_mode: mode,
            streaming_rate_hz: p.streaming_rate_hz,
            compression_enabled: p.compression,
            source_mode: SourceMode::Live,
            max_clients: Self::DEFAULT_MAX_CLIENTS,
        }
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.streaming_rate_hz)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_rate(self.streaming_rate_hz)?;
        validate_max_clients(self.max_clients)
    }

    /// Applies `patch` on top of `self`. Switching mode resets rate and
    /// compression to the new preset unless the same patch sets them.
    pub fn merged(&self, patch: &StreamerConfigPatch) -> Result<Self, ValidationError> {
        patch.validate()?;
        let mut next = *self;
        if let Some(mode) = patch.performance_mode {
            if mode != self.performance_mode {
                let p = mode.profile();
                next.streaming_rate_hz = p.streaming_rate_hz;
                next.compression_enabled = p.compression;
            }
            next.performance_mode = mode;
        }
        if let Some(v) = patch.streaming_rate_hz {
            next.streaming_rate_hz = v;
        }
        if let Some(v) = patch.compression_enabled {
            next.compression_enabled = v;
        }
        if let Some(v) = patch.source_mode {
            next.source_mode = v;
        }
        if let Some(v) = patch.max_clients {
            next.max_clients = v;
        }
        Ok(next)
    }

    /// Decimation for a client, honouring its own mode if it set one.
    pub fn decimation_for(&self, client_mode: Option<PerformanceMode>) -> usize {
        client_mode
            .unwrap_or(self.performance_mode)
            .profile()
            .decimation
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamerConfigPatch {
    pub performance_mode: Option<PerformanceMode>,
    pub streaming_rate_hz: Option<f64>,
    pub compression_enabled: Option<bool>,
    pub source_mode: Option<SourceMode>,
    pub max_clients: Option<usize>,
}

impl StreamerConfigPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_performance_mode(mut self, v: PerformanceMode) -> Self {
        self.performance_mode = Some(v);
        self
    }

    pub fn with_streaming_rate_hz(mut self, v: f64) -> Self {
        self.streaming_rate_hz = Some(v);
        self
    }

    pub fn with_compression(mut self, v: bool) -> Self {
        self.compression_enabled = Some(v);
        self
    }

    pub fn with_source_mode(mut self, v: SourceMode) -> Self {
        self.source_mode = Some(v);
        self
    }

    pub fn with_max_clients(mut self, v: usize) -> Self {
        self.max_clients = Some(v);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(v) = self.streaming_rate_hz {
            validate_rate(v)?;
        }
        if let Some(v) = self.max_clients {
            validate_max_clients(v)?;
        }
        Ok(())
    }

    /// Same key conventions as [`AnalyzerConfigPatch::from_json`]; the legacy
    /// boolean `demoMode` maps onto `source_mode`.
    pub fn from_json(value: Value) -> Result<Self, ValidationError> {
        let mut patch = Self::default();
        for (key, v) in into_object(value)? {
            match key.as_str() {
                "performance_mode" | "performanceMode" => {
                    patch.performance_mode = field::<String>(&key, v)?
                        .map(|s| s.parse::<PerformanceMode>())
                        .transpose()?
                }
                "streaming_rate_hz" | "streamingRateHz" | "streamingRate" => {
                    patch.streaming_rate_hz = field(&key, v)?
                }
                "compression_enabled" | "compressionEnabled" | "compression" => {
                    patch.compression_enabled = field(&key, v)?
                }
                "source_mode" | "sourceMode" => patch.source_mode = field(&key, v)?,
                "demoMode" | "demo_mode" => {
                    patch.source_mode = field::<bool>(&key, v)?.map(|demo| {
                        if demo {
                            SourceMode::Synthetic
                        } else {
                            SourceMode::Live
                        }
                    })
                }
                "max_clients" | "maxClients" => patch.max_clients = field(&key, v)?,
                _ => return Err(ValidationError::new(key, "unknown field")),
            }
        }
        patch.validate()?;
        Ok(patch)
    }
}

fn into_object(value: Value) -> Result<serde_json::Map<String, Value>, ValidationError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ValidationError::new(
            "config",
            format!("expected a JSON object, got {}", json_kind(&other)),
        )),
    }
}

fn field<T: DeserializeOwned>(key: &str, v: Value) -> Result<Option<T>, ValidationError> {
    if v.is_null() {
        return Ok(None);
    }
    serde_json::from_value(v)
        .map(Some)
        .map_err(|e| ValidationError::new(key, e.to_string()))
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn validate_fft_size(v: usize) -> Result<(), ValidationError> {
    if v == 0 {
        return Err(ValidationError::new("fft_size", "must be > 0"));
    }
    if v > MAX_FFT_SIZE {
        return Err(ValidationError::new(
            "fft_size",
            format!("must be <= {MAX_FFT_SIZE}"),
        ));
    }
    Ok(())
}

fn validate_positive_hz(field: &str, v: f64) -> Result<(), ValidationError> {
    if !v.is_finite() || v <= 0.0 {
        return Err(ValidationError::new(field, "must be a finite frequency > 0 Hz"));
    }
    Ok(())
}

fn validate_finite(field: &str, v: f64) -> Result<(), ValidationError> {
    if !v.is_finite() {
        return Err(ValidationError::new(field, "must be a finite number"));
    }
    Ok(())
}

fn validate_rate(v: f64) -> Result<(), ValidationError> {
    if !v.is_finite() || v <= 0.0 || v > MAX_STREAMING_RATE_HZ {
        return Err(ValidationError::new(
            "streaming_rate_hz",
            format!("must be in (0, {MAX_STREAMING_RATE_HZ}] Hz"),
        ));
    }
    Ok(())
}

fn validate_max_clients(v: usize) -> Result<(), ValidationError> {
    if v == 0 {
        return Err(ValidationError::new("max_clients", "must be >= 1"));
    }
    Ok(())
}
