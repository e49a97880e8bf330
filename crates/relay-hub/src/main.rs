//! # relay-hub
//!
//! Relay hub server binary. Wires settings, logging and the server together.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_server::config::ServerConfig;
use relay_server::http::firmware::{DirectoryStore, FirmwareLocator};
use relay_server::server::RelayServer;
use relay_settings::{FirmwareSettings, RelaySettings};

/// WebSocket relay hub for devices and products.
#[derive(Parser, Debug)]
#[command(name = "relay-hub", about = "WebSocket relay hub")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.relay-hub/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter directive, e.g. `debug` or `relay_server=trace`.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Load settings from file and environment, then apply flags on top.
    fn resolve_settings(&self) -> Result<RelaySettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(relay_settings::settings_path);
        let mut settings = relay_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;

        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(ref level) = self.log_level {
            settings.logging.level.clone_from(level);
        }
        Ok(settings)
    }
}

/// Build the firmware locator when a directory is configured.
fn firmware_locator(settings: &FirmwareSettings) -> Option<FirmwareLocator> {
    let directory = settings.directory.as_deref()?;
    Some(FirmwareLocator::new(
        Arc::new(DirectoryStore::new(directory)),
        settings.public_base_url.clone(),
        settings.prefix.clone(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.resolve_settings()?;

    relay_core::logging::init_subscriber(&settings.logging.level, settings.logging.format);

    let metrics_handle =
        relay_server::metrics::install_recorder().context("Failed to install metrics recorder")?;

    let mut server = RelayServer::new(ServerConfig::from(&settings)).with_metrics(metrics_handle);
    if let Some(locator) = firmware_locator(&settings.firmware) {
        tracing::info!(
            directory = settings.firmware.directory.as_deref().unwrap_or_default(),
            "firmware lookup enabled"
        );
        server = server.with_firmware(locator);
    } else {
        tracing::info!("firmware directory not configured, /firmware/latest disabled");
    }

    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;

    tracing::info!("Relay hub listening on http://{addr}");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server
        .shutdown()
        .graceful_shutdown(vec![handle], None)
        .await;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("relay-hub").chain(args.iter().copied()))
    }

    #[test]
    fn cli_defaults_are_unset() {
        let cli = cli(&[]);
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
        assert!(cli.settings.is_none());
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn cli_custom_port() {
        let cli = cli(&["--port", "9000"]);
        assert_eq!(cli.port, Some(9000));
    }

    #[test]
    fn cli_settings_path() {
        let cli = cli(&["--settings", "/tmp/relay.json"]);
        assert_eq!(cli.settings, Some(PathBuf::from("/tmp/relay.json")));
    }

    #[test]
    fn flags_override_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server":{"host":"10.0.0.5","port":7000},"logging":{"level":"warn"}}"#,
        )
        .unwrap();

        let path_str = path.to_str().unwrap();
        let from_file = cli(&["--settings", path_str]).resolve_settings().unwrap();
        assert_eq!(from_file.server.host, "10.0.0.5");
        assert_eq!(from_file.logging.level, "warn");

        let overridden = cli(&[
            "--settings",
            path_str,
            "--host",
            "127.0.0.1",
            "--log-level",
            "debug",
        ])
        .resolve_settings()
        .unwrap();
        assert_eq!(overridden.server.host, "127.0.0.1");
        assert_eq!(overridden.logging.level, "debug");
    }

    #[test]
    fn invalid_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ nope").unwrap();
        let err = cli(&["--settings", path.to_str().unwrap()])
            .resolve_settings()
            .unwrap_err();
        assert!(err.to_string().contains("Failed to load settings"));
    }

    #[test]
    fn firmware_disabled_without_directory() {
        assert!(firmware_locator(&FirmwareSettings::default()).is_none());
        let configured = FirmwareSettings {
            directory: Some("/srv/firmware".into()),
            ..FirmwareSettings::default()
        };
        assert!(firmware_locator(&configured).is_some());
    }
}
