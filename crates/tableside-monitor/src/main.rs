//! # tableside-monitor
//!
//! Headless realtime monitor: connects as one restaurant and prints every
//! state change and notification as a JSON line on stdout. Logs go to
//! stderr, so stdout stays machine-readable.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tracing::{info, warn};

use tableside_core::TenantId;
use tableside_core::logging::{init_json_subscriber, init_subscriber};
use tableside_realtime::{ConnectionConfig, ConnectionManager, RealtimeError, StateChange};
use tableside_settings::{TablesideSettings, load_settings_from_path, settings_path};

/// Watch a restaurant's realtime notifications.
#[derive(Parser, Debug)]
#[command(name = "tableside-monitor", about = "Watch a restaurant's realtime notifications")]
struct Cli {
    /// Restaurant (tenant) to connect as.
    #[arg(long)]
    tenant: String,

    /// Backend URL (overrides settings).
    #[arg(long)]
    server: Option<String>,

    /// Bearer token (overrides settings).
    #[arg(long)]
    token: Option<String>,

    /// Settings file (default `~/.tableside/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter directive (overrides settings; `RUST_LOG` wins over both).
    #[arg(long)]
    log_level: Option<String>,

    /// Log newline-delimited JSON to stderr.
    #[arg(long)]
    json_logs: bool,

    /// Print a diagnostics snapshot every N seconds (0 disables).
    #[arg(long, default_value = "0")]
    diagnostics_every: u64,
}

/// Load the settings file and layer the command-line overrides on top.
fn resolve_settings(cli: &Cli) -> Result<TablesideSettings> {
    let path = cli.settings.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;

    if let Some(server) = &cli.server {
        settings.realtime.server_url.clone_from(server);
    }
    if let Some(token) = &cli.token {
        settings.realtime.auth_token = Some(token.clone());
    }
    if let Some(level) = &cli.log_level {
        settings.logging.level.clone_from(level);
    }
    if cli.json_logs {
        settings.logging.json = true;
    }
    settings
        .realtime
        .validate()
        .context("invalid realtime settings")?;
    Ok(settings)
}

fn state_line(change: &StateChange) -> Value {
    json!({
        "type": "state",
        "from": change.from,
        "to": change.to,
        "trigger": change.trigger.to_string(),
    })
}

fn emit_line(value: &Value) {
    println!("{value}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = resolve_settings(&cli)?;

    if settings.logging.json {
        init_json_subscriber(&settings.logging.level);
    } else {
        init_subscriber(&settings.logging.level);
    }

    let tenant = TenantId::parse(&cli.tenant).context("--tenant must not be blank")?;
    let manager = ConnectionManager::new(ConnectionConfig::from(&settings.realtime))
        .context("failed to build connection manager")?;

    let _ = manager.add_status_callback(|change| emit_line(&state_line(change)));
    let _ = manager.subscribe(tenant.clone(), |notification| {
        emit_line(&json!({ "type": "notification", "notification": notification }));
    });

    info!(tenant = %tenant, server = %settings.realtime.server_url, "starting monitor");
    match manager.connect(tenant.as_str()).await {
        Ok(()) => {}
        Err(e @ RealtimeError::NegotiationFailed { .. }) => {
            warn!(error = %e, "initial connect failed, retrying in the background");
        }
        Err(e) => return Err(e).context("failed to connect"),
    }

    let mut snapshots = (cli.diagnostics_every > 0)
        .then(|| tokio::time::interval(Duration::from_secs(cli.diagnostics_every)));

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for ctrl-c")?;
                break;
            }
            () = async {
                match snapshots.as_mut() {
                    Some(interval) => {
                        let _ = interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                let snapshot = serde_json::to_value(manager.diagnostics())?;
                emit_line(&json!({ "type": "diagnostics", "snapshot": snapshot }));
            }
        }
    }

    info!("shutting down");
    let stats = serde_json::to_value(manager.stats())?;
    manager.disconnect();
    emit_line(&json!({ "type": "stats", "stats": stats }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tableside_core::ConnectionState;
    use tableside_realtime::Trigger;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("tableside-monitor").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn tenant_is_required() {
        assert!(Cli::try_parse_from(["tableside-monitor"]).is_err());
    }

    #[test]
    fn cli_overrides_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"realtime": {"serverUrl": "http://file.local:3000"}, "logging": {"level": "debug"}}"#,
        )
        .unwrap();

        let cli = parse(&[
            "--tenant",
            "R-1",
            "--settings",
            path.to_str().unwrap(),
            "--server",
            "https://pos.example.com",
            "--token",
            "abc",
            "--json-logs",
        ]);
        let settings = resolve_settings(&cli).unwrap();
        assert_eq!(settings.realtime.server_url, "https://pos.example.com");
        assert_eq!(settings.realtime.auth_token.as_deref(), Some("abc"));
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[test]
    fn missing_settings_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let cli = parse(&["--tenant", "R-1", "--settings", path.to_str().unwrap()]);
        let settings = resolve_settings(&cli).unwrap();
        assert_eq!(settings.realtime.path, "/realtime");
    }

    #[test]
    fn bad_server_override_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let cli = parse(&[
            "--tenant",
            "R-1",
            "--settings",
            path.to_str().unwrap(),
            "--server",
            "ftp://pos",
        ]);
        assert!(resolve_settings(&cli).is_err());
    }

    #[test]
    fn state_lines_use_wire_names() {
        let line = state_line(&StateChange {
            from: ConnectionState::Reconnecting,
            to: ConnectionState::ServerDown,
            trigger: Trigger::HealthProbeFailed,
        });
        assert_eq!(line["from"], "RECONNECTING");
        assert_eq!(line["to"], "SERVER_DOWN");
        assert_eq!(line["trigger"], "health_probe_failed");
    }
}
