use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ar_domain::config::{ConfigSeverity, GatewayConfig};
use ar_domain::TraceEvent;

use ar_gateway::state::AppState;
use ar_gateway::surface::LoggingSurface;
use ar_gateway::ws;

#[derive(Parser)]
#[command(name = "agentrelay-gateway", about = "Bridge chat users to AgentRelay runners")]
struct Cli {
    /// Path to the gateway config file.
    #[arg(long, default_value = "agentrelay-gateway.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Accept runner connections (default).
    Serve,
    /// Validate the config file.
    Doctor,
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = if cli.config.exists() {
        GatewayConfig::load(&cli.config)?
    } else {
        GatewayConfig::default()
    };

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            serve(Arc::new(config)).await
        }
        Some(Command::Doctor) => {
            let issues = config.validate();
            for issue in &issues {
                let tag = match issue.severity {
                    ConfigSeverity::Warning => "warning",
                    ConfigSeverity::Error => "error",
                };
                println!("{tag}: {issue}");
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(1);
            }
            println!("config ok");
            Ok(())
        }
        Some(Command::Version) => {
            println!("agentrelay-gateway {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON logs: the gateway usually runs supervised.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ar_gateway=debug")),
        )
        .json()
        .init();
}

async fn serve(config: Arc<GatewayConfig>) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "agentrelay-gateway starting");

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!("config validation failed");
    }

    let state = AppState::new(config.clone(), Arc::new(LoggingSurface));

    // ── Sweeper: heartbeat silence and permission TTLs ───────────────
    let sweeper_state = state.clone();
    let sweep_every = std::time::Duration::from_secs(config.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(sweep_every);
        loop {
            tick.tick().await;

            let max_silence = chrono::Duration::milliseconds(
                (sweeper_state.config.heartbeat_interval_ms * 2) as i64,
            );
            for runner_id in sweeper_state.runners.sweep_silent(max_silence) {
                let orphaned = sweeper_state.sessions.mark_runner_offline(&runner_id);
                TraceEvent::RunnerOffline {
                    runner_id: runner_id.clone(),
                    missed_heartbeats: true,
                }
                .emit();
                tracing::warn!(runner_id = %runner_id, orphaned, "runner missed heartbeats");
            }

            for entry in sweeper_state.permissions.sweep() {
                TraceEvent::PermissionExpired {
                    request_id: entry.request.request_id.clone(),
                }
                .emit();
                sweeper_state
                    .surface
                    .on_permission_update(&entry.request.request_id, "expired", "")
                    .await;
            }
        }
    });

    // ── HTTP surface: runner WS + health ─────────────────────────────
    let app = Router::new()
        .route("/ws", get(ws::runner_ws))
        .route("/healthz", get(healthz))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let addr: std::net::SocketAddr = config.listen_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    tracing::info!("agentrelay-gateway stopped");
    Ok(())
}

async fn healthz(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.started.elapsed().as_secs(),
        "runners_online": state.runners.online_count(),
        "sessions": state.sessions.len(),
        "pending_permissions": state.permissions.pending_count(),
        "synced_sessions": state.sessions.synced_count(),
    }))
}
