use serde::Serialize;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn build_source() -> &'static str {
    option_env!("SPECSTREAM_BUILD_SOURCE").unwrap_or("unknown")
}

pub fn profile() -> &'static str {
    option_env!("SPECSTREAM_PROFILE").unwrap_or("release")
}

pub fn target() -> &'static str {
    option_env!("SPECSTREAM_TARGET").unwrap_or("")
}

pub fn git_commit() -> Option<&'static str> {
    option_env!("SPECSTREAM_GIT_COMMIT")
}

pub fn git_dirty() -> Option<bool> {
    option_env!("SPECSTREAM_GIT_DIRTY").and_then(|s| match s {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    })
}

/// Short build label for the banner, e.g. `3f2a9c1d0b7e-dirty`.
pub fn build_label() -> String {
    if let Some(label) = option_env!("SPECSTREAM_BUILD") {
        return label.to_string();
    }
    match (git_commit(), git_dirty()) {
        (Some(c), Some(true)) => format!("{c}-dirty"),
        (Some(c), _) => c.to_string(),
        (None, _) => String::new(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub build_source: &'static str,
    pub profile: &'static str,
    pub target: &'static str,
    pub git_commit: Option<&'static str>,
    pub git_dirty: Option<bool>,
    pub os: &'static str,
    pub arch: &'static str,
}

pub fn info() -> BuildInfo {
    BuildInfo {
        name: env!("CARGO_PKG_NAME"),
        version: version(),
        build_source: build_source(),
        profile: profile(),
        target: target(),
        git_commit: git_commit(),
        git_dirty: git_dirty(),
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
    }
}
