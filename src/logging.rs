//! Logging setup.
//!
//! The only process-wide state this crate keeps is the certificate pointer
//! ([`crate::cert_store::CertificateStore`]) and the service state itself
//! (Design Notes, spec §9) — the logger is initialized once in `main` and
//! every subsystem then logs through `tracing`'s module-path targets rather
//! than being handed a logger object.

use tracing_subscriber::{fmt, EnvFilter};

/// Parsed form of `logging.level` (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "fatal" => Some(Self::Fatal),
            _ => None,
        }
    }

    fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            // tracing has no "fatal" level; map onto error, the nearest tier.
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }
}

/// Install the global `tracing` subscriber. Call once from `main`.
pub fn init(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter_str()));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .ok();
}
