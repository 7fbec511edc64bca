//! `agentrelay-runner doctor` — probe the environment before first run.

use std::path::PathBuf;

use ar_cli_client::resolve_binary;
use ar_domain::config::{ConfigSeverity, RunnerConfig};
use ar_transcripts::claude::ClaudeStore;

/// Run all checks; returns whether everything hard-required passed.
pub fn run(config: &RunnerConfig) -> bool {
    let mut ok = true;

    println!("agentrelay-runner doctor\n");

    // ── Config ───────────────────────────────────────────────────────
    let issues = config.validate();
    if issues.is_empty() {
        println!("  ✓ config valid");
    }
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => println!("  ! config: {issue}"),
            ConfigSeverity::Error => {
                println!("  ✗ config: {issue}");
                ok = false;
            }
        }
    }

    // ── Gateway URL ──────────────────────────────────────────────────
    if config.bot_ws_url.starts_with("ws://") || config.bot_ws_url.starts_with("wss://") {
        println!("  ✓ gateway url {}", config.bot_ws_url);
    } else {
        println!("  ✗ gateway url {} is not a WebSocket URL", config.bot_ws_url);
        ok = false;
    }

    // ── CLI binaries ─────────────────────────────────────────────────
    for kind in &config.cli_kinds {
        let resolved = resolve_binary(*kind, &config.cli_search_paths);
        if resolved.is_absolute() {
            println!("  ✓ {kind} at {}", resolved.display());
        } else if on_path(&resolved) {
            println!("  ✓ {kind} on $PATH");
        } else {
            println!("  ! {kind} not found (searched cli_search_paths and $PATH)");
        }
    }

    // ── Transcript stores ────────────────────────────────────────────
    match ClaudeStore::default_root() {
        Some(root) if root.is_dir() => println!("  ✓ claude store at {}", root.display()),
        Some(root) => println!("  ! claude store {} not present yet", root.display()),
        None => println!("  ! cannot determine home directory"),
    }

    println!();
    if ok {
        println!("all checks passed");
    } else {
        println!("some checks failed");
    }
    ok
}

fn on_path(program: &PathBuf) -> bool {
    let Ok(path) = std::env::var("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(program).is_file())
}
