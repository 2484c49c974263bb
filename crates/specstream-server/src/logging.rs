use anyhow::Context;
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing::{field::Visit, Subscriber};
use tracing_subscriber::{filter::FilterFn, Layer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const BANNER_TARGET: &str = "specstream_banner";

pub struct LoggingGuards {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub debug: bool,
    pub log_dir: Option<PathBuf>,
    pub log_file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug: false,
            log_dir: None,
            log_file_prefix: "specstream".to_string(),
        }
    }
}

fn env_filter(debug: bool) -> EnvFilter {
    if let Ok(v) = std::env::var("RUST_LOG") {
        EnvFilter::new(v)
    } else if debug {
        EnvFilter::new("info,specstream_server=debug,specstream_core=debug")
    } else {
        EnvFilter::new("info")
    }
}

pub fn init(cfg: &LoggingConfig) -> anyhow::Result<LoggingGuards> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .with_filter(FilterFn::new(|meta| meta.target() != BANNER_TARGET));

    let (file_layer, file_guard) = match &cfg.log_dir {
        None => (None, None),
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, &cfg.log_file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(FilterFn::new(|meta| meta.target() != BANNER_TARGET));
            (Some(layer), Some(guard))
        }
    };

    tracing_subscriber::registry()
        .with(env_filter(cfg.debug))
        .with(BannerLayer)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;

    std::panic::set_hook(Box::new(|panic_info| {
        tracing::error!(panic = %panic_info, "panic");
    }));

    Ok(LoggingGuards {
        _file_guard: file_guard,
    })
}

/// Prints the startup event as one plain line instead of a log record.
struct BannerLayer;

impl<S> Layer<S> for BannerLayer
where
    S: Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if event.metadata().target() != BANNER_TARGET {
            return;
        }
        let mut v = BannerVisitor::default();
        event.record(&mut v);
        write_stderr(v.line().as_bytes());
    }
}

fn write_stderr(bytes: &[u8]) {
    let mut stderr = std::io::stderr().lock();
    if std::io::Write::flush(&mut stderr).is_err() {
        return;
    }
    let _ = std::io::Write::write_all(&mut stderr, bytes);
}

#[derive(Default)]
struct BannerVisitor {
    version: Option<String>,
    os: Option<String>,
    arch: Option<String>,
    timestamp: Option<String>,
    build: Option<String>,
    bind: Option<String>,
    upstream: Option<String>,
}

impl BannerVisitor {
    fn slot(&mut self, name: &str) -> Option<&mut Option<String>> {
        match name {
            "version" => Some(&mut self.version),
            "os" => Some(&mut self.os),
            "arch" => Some(&mut self.arch),
            "timestamp" => Some(&mut self.timestamp),
            "build" => Some(&mut self.build),
            "bind" => Some(&mut self.bind),
            "upstream" => Some(&mut self.upstream),
            _ => None,
        }
    }

    fn line(&self) -> String {
        let version = self.version.as_deref().unwrap_or("unknown");
        let os = self.os.as_deref().unwrap_or(std::env::consts::OS);
        let arch = self.arch.as_deref().unwrap_or(std::env::consts::ARCH);
        let timestamp = self.timestamp.as_deref().unwrap_or("unknown timestamp");

        let mut line = format!("specstream v{version} ({os}/{arch}) {timestamp}");
        for (key, value) in [
            ("build", &self.build),
            ("bind", &self.bind),
            ("upstream", &self.upstream),
        ] {
            let value = value.as_deref().unwrap_or("").trim();
            if !value.is_empty() {
                line.push_str(&format!(" {key}={value}"));
            }
        }
        line.push('\n');
        line
    }
}

impl Visit for BannerVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if let Some(slot) = self.slot(field.name()) {
            *slot = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if let Some(slot) = self.slot(field.name()) {
            if slot.is_none() {
                *slot = Some(format!("{value:?}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_line_skips_empty_fields() {
        let v = BannerVisitor {
            version: Some("0.1.0".into()),
            os: Some("linux".into()),
            arch: Some("x86_64".into()),
            timestamp: Some("2024-01-01T00:00:00Z".into()),
            build: Some(String::new()),
            bind: Some("0.0.0.0:8092".into()),
            upstream: None,
        };
        assert_eq!(
            v.line(),
            "specstream v0.1.0 (linux/x86_64) 2024-01-01T00:00:00Z bind=0.0.0.0:8092\n"
        );
    }
}
