pub fn log_startup_banner(bind: &str, upstream: Option<&str>) {
    let version = crate::build_info::version();
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;
    let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let build = crate::build_info::build_label();
    let upstream = upstream.unwrap_or("");

    tracing::info!(
        target: "specstream_banner",
        version,
        os,
        arch,
        timestamp = %timestamp,
        build = build.as_str(),
        bind,
        upstream,
        "startup"
    );
}
