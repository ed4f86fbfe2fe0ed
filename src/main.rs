//! Binary entry point: load configuration, initialize logging, build and
//! run the service until a shutdown signal arrives.
//!
//! Exit codes (spec §6): 0 on a clean stop, 1 on a config/startup failure,
//! 2 on a runtime-fatal error after the service reached Running.

use std::path::PathBuf;
use std::process::ExitCode;
use tunneld::config::Config;
use tunneld::logging::{self, LogLevel};
use tunneld::service::Service;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::from(1);
        }
    };

    let level = LogLevel::parse(level_name(&config)).unwrap_or(LogLevel::Info);
    logging::init(level);

    let service = match Service::build(config).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = service.start().await {
        tracing::error!(error = %e, "service failed to reach running state");
        return ExitCode::from(1);
    }

    tracing::info!("tunnel service running");
    let shutdown = wait_for_shutdown_signal();
    shutdown.await;

    match service.stop().await {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            tracing::error!(error = %e, "shutdown encountered an error");
            ExitCode::from(2)
        }
    }
}

fn level_name(config: &Config) -> &'static str {
    match config.logging_level {
        tunneld::config::LogLevelField::Debug => "debug",
        tunneld::config::LogLevelField::Info => "info",
        tunneld::config::LogLevelField::Warn => "warn",
        tunneld::config::LogLevelField::Error => "error",
        tunneld::config::LogLevelField::Fatal => "fatal",
    }
}

/// Load configuration from the path given as the first CLI argument, or
/// fall back to defaults if none was given. The file format (JSON here) is
/// an external collaborator per spec §1 — only the typed schema and
/// validation live in this crate.
fn load_config() -> tunneld::Result<Config> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(Config::default());
    };
    let path = PathBuf::from(path);
    let bytes = std::fs::read(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            tunneld::TunnelError::ConfigNotFound(path.display().to_string())
        }
        _ => tunneld::TunnelError::Io(e),
    })?;
    let config: Config = serde_json::from_slice(&bytes)
        .map_err(|e| tunneld::TunnelError::ConfigParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
