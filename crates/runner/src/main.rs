use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ar_domain::config::{ConfigSeverity, RunnerConfig};
use ar_protocol::runner_id;
use ar_transcripts::claude::ClaudeStore;
use ar_transcripts::codex::{CodexApi, CodexCliApi};
use ar_transcripts::gemini::GeminiStore;

use ar_runner::dispatch::{self, RunnerCtx};
use ar_runner::sync::{codex_poll, watcher, SyncService};
use ar_runner::{doctor, health, link, session, PermissionBroker, SessionRegistry};

#[derive(Parser)]
#[command(name = "agentrelay-runner", about = "Host CLI coding agents for an AgentRelay gateway")]
struct Cli {
    /// Path to the runner config file.
    #[arg(long, default_value = "agentrelay-runner.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the gateway and host sessions (default).
    Run,
    /// Probe config, CLI binaries, and transcript stores.
    Doctor,
    /// Config helpers.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Validate the config file and exit non-zero on errors.
    Validate,
    /// Print the effective config (secrets redacted).
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        None | Some(Command::Run) => {
            init_tracing();
            run(Arc::new(config)).await
        }
        Some(Command::Doctor) => {
            if !doctor::run(&config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config { command }) => {
            match command {
                ConfigCommand::Validate => {
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
                }
                ConfigCommand::Show => {
                    let mut shown = config.clone();
                    if !shown.token.is_empty() {
                        shown.token = "<redacted>".into();
                    }
                    println!("{}", toml::to_string_pretty(&shown)?);
                }
            }
            Ok(())
        }
        Some(Command::Version) => {
            println!("agentrelay-runner {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(path: &PathBuf) -> anyhow::Result<RunnerConfig> {
    if path.exists() {
        Ok(RunnerConfig::load(path)?)
    } else {
        // No file: defaults plus environment. `doctor` will say what's
        // missing; `run` fails validation below if the token is absent.
        let mut config = RunnerConfig::default();
        config.apply_env();
        Ok(config)
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ar_runner=debug")),
        )
        .init();
}

async fn run(config: Arc<RunnerConfig>) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "agentrelay-runner starting");

    // ── Config validation ────────────────────────────────────────────
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

    let shutdown = CancellationToken::new();
    let derived_runner_id = runner_id(&config.runner_name, &config.token);

    // ── Components ───────────────────────────────────────────────────
    let registry = Arc::new(SessionRegistry::new());
    let broker = Arc::new(PermissionBroker::new(config.approval_timeout()));

    let claude_root = ClaudeStore::default_root()
        .unwrap_or_else(|| PathBuf::from(".claude").join("projects"));
    let codex_api: Option<Arc<dyn CodexApi>> = if config
        .cli_kinds
        .contains(&ar_protocol::CliKind::Codex)
    {
        Some(Arc::new(CodexCliApi::new(ar_cli_client::resolve_binary(
            ar_protocol::CliKind::Codex,
            &config.cli_search_paths,
        ))))
    } else {
        None
    };

    let mut watched: Vec<PathBuf> = config.watch_projects.clone();
    if !watched.contains(&config.default_workspace) {
        watched.push(config.default_workspace.clone());
    }

    let sync = Arc::new(SyncService::new(
        ClaudeStore::new(claude_root),
        GeminiStore::new(),
        codex_api,
        registry.clone(),
        watched.clone(),
        config.max_sync_chunk_bytes,
    ));

    let (link_handle, link_runner) = link::channel(link::LinkConfig {
        ws_url: config.bot_ws_url.clone(),
        token: config.token.clone(),
        runner_name: config.runner_name.clone(),
        cli_kinds: config.cli_kinds.clone(),
        default_workspace: Some(config.default_workspace.to_string_lossy().into_owned()),
        heartbeat_interval: config.heartbeat_interval(),
    });

    let ctx = RunnerCtx {
        config: config.clone(),
        link: link_handle,
        registry: registry.clone(),
        broker,
        sync,
        runner_id: derived_runner_id,
    };

    // ── Background services ──────────────────────────────────────────
    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let link_task = tokio::spawn(link_runner.run(inbound_tx, shutdown.clone()));

    let dispatch_task = tokio::spawn(dispatch::run(ctx.clone(), inbound_rx, shutdown.clone()));

    for project in &watched {
        watcher::spawn(
            ctx.clone(),
            project.to_string_lossy().into_owned(),
            shutdown.clone(),
        );
    }
    codex_poll::spawn(
        ctx.clone(),
        std::time::Duration::from_millis(config.codex_poll_interval_ms),
        shutdown.clone(),
    );

    if config.http_port != 0 {
        tokio::spawn(health::serve(ctx.clone(), config.http_port));
    }

    // ── Run until ctrl-c or a fatal gateway rejection ────────────────
    let exit = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            Ok(())
        }
        result = link_task => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::anyhow!(e)),
            Err(e) => Err(anyhow::anyhow!("link task panicked: {e}")),
        },
    };

    // ── Teardown: end sessions, give the CLIs a moment, then go ──────
    shutdown.cancel();
    for entry in registry.live_entries() {
        session::end(&ctx, &entry.session_id, "runner shutdown").await;
    }
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), dispatch_task).await;

    tracing::info!("agentrelay-runner stopped");
    exit
}
