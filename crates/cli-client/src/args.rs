//! CLI argument vector construction.
//!
//! Each vendor has a fixed flag catalog: the stream-JSON transport flags
//! come first, options in catalog order next, vendor-specific extras last.
//! Keeping this data-driven (one function per vendor, each a plain list of
//! pushes) makes the vector reproducible for a given `SessionOptions`.

use std::path::{Path, PathBuf};

use ar_protocol::session::{CliKind, PermissionMode, PluginVariant, SessionOptions, ThinkingLevel};

use crate::process::CommandSpec;

/// Resolve the CLI binary for a vendor: explicit search paths win over a
/// bare program name left to `$PATH`.
pub fn resolve_binary(kind: CliKind, search_paths: &[PathBuf]) -> PathBuf {
    let name = kind.as_str();
    for dir in search_paths {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return candidate;
        }
    }
    PathBuf::from(name)
}

/// Build the full command for a session.
pub fn command_spec(
    kind: CliKind,
    variant: PluginVariant,
    options: &SessionOptions,
    cwd: &Path,
    search_paths: &[PathBuf],
) -> CommandSpec {
    CommandSpec {
        program: resolve_binary(kind, search_paths),
        args: build_args(kind, variant, options),
        cwd: cwd.to_path_buf(),
        env: vec![("NO_COLOR".into(), "1".into())],
    }
}

/// The vendor-specific argument vector. Stream-JSON flags always first.
pub fn build_args(kind: CliKind, variant: PluginVariant, options: &SessionOptions) -> Vec<String> {
    match kind {
        CliKind::Claude => claude_args(variant, options),
        CliKind::Codex => codex_args(variant, options),
        CliKind::Gemini => gemini_args(variant, options),
    }
}

fn claude_args(variant: PluginVariant, o: &SessionOptions) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--input-format".into(),
        "stream-json".into(),
        "--output-format".into(),
        "stream-json".into(),
        "--verbose".into(),
    ];
    if matches!(variant, PluginVariant::Print) {
        args.push("--print".into());
    }
    if o.include_partial_messages {
        args.push("--include-partial-messages".into());
    }

    if let Some(model) = &o.model {
        push_pair(&mut args, "--model", model);
    }
    if let Some(model) = &o.fallback_model {
        push_pair(&mut args, "--fallback-model", model);
    }
    if let Some(n) = o.max_turns {
        push_pair(&mut args, "--max-turns", n);
    }
    if let Some(budget) = o.max_budget_usd {
        push_pair(&mut args, "--max-budget-usd", budget);
    }
    if let Some(id) = &o.resume_session_id {
        push_pair(&mut args, "--resume", id);
        if let Some(at) = &o.resume_session_at {
            push_pair(&mut args, "--resume-session-at", at);
        }
        if o.fork_session {
            args.push("--fork-session".into());
        }
    }
    if o.continue_conversation {
        args.push("--continue".into());
    }
    match o.permission_mode {
        PermissionMode::Default => {}
        PermissionMode::AcceptEdits => push_pair(&mut args, "--permission-mode", "acceptEdits"),
    }
    if o.allow_dangerously_skip_permissions {
        args.push("--dangerously-skip-permissions".into());
    }
    if !o.allowed_tools.is_empty() {
        push_pair(&mut args, "--allowed-tools", o.allowed_tools.join(","));
    }
    if !o.disallowed_tools.is_empty() {
        push_pair(&mut args, "--disallowed-tools", o.disallowed_tools.join(","));
    }
    if let Some(tools) = &o.tools {
        push_pair(&mut args, "--tools", tools.join(","));
    }
    if let Some(servers) = &o.mcp_servers {
        push_pair(&mut args, "--mcp-config", servers.to_string());
        if o.strict_mcp_config {
            args.push("--strict-mcp-config".into());
        }
    }
    if !o.setting_sources.is_empty() {
        push_pair(&mut args, "--setting-sources", o.setting_sources.join(","));
    }
    for dir in &o.additional_directories {
        push_pair(&mut args, "--add-dir", dir);
    }
    for plugin in &o.plugins {
        push_pair(&mut args, "--plugin", plugin);
    }
    if let Some(agent) = &o.agent {
        push_pair(&mut args, "--agent", agent);
    }
    if !o.betas.is_empty() {
        push_pair(&mut args, "--betas", o.betas.join(","));
    }
    if let Some(schema) = &o.json_schema {
        push_pair(&mut args, "--json-schema", schema.to_string());
    }
    if let Some(n) = o.max_thinking_tokens {
        push_pair(&mut args, "--max-thinking-tokens", n);
    }
    if let Some(level) = o.thinking_level {
        push_pair(&mut args, "--thinking-level", thinking_level_flag(level));
    }
    if o.sandbox.as_ref().is_some_and(truthy) {
        args.push("--sandbox".into());
    }
    args
}

fn codex_args(_variant: PluginVariant, o: &SessionOptions) -> Vec<String> {
    // `proto` is Codex's bidirectional stream-JSON mode.
    let mut args: Vec<String> = vec!["proto".into()];
    if let Some(model) = &o.model {
        push_pair(&mut args, "--model", model);
    }
    if o.allow_dangerously_skip_permissions {
        push_pair(&mut args, "--ask-for-approval", "never");
        args.push("--full-auto".into());
    }
    if let Some(id) = &o.resume_session_id {
        push_pair(&mut args, "--resume", id);
    }
    args
}

fn gemini_args(_variant: PluginVariant, o: &SessionOptions) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--input-format".into(),
        "stream-json".into(),
        "--output-format".into(),
        "stream-json".into(),
    ];
    if let Some(model) = &o.model {
        push_pair(&mut args, "--model", model);
    }
    if o.allow_dangerously_skip_permissions {
        args.push("--yolo".into());
    }
    if let Some(id) = &o.resume_session_id {
        push_pair(&mut args, "--resume", id);
    }
    args
}

fn thinking_level_flag(level: ThinkingLevel) -> &'static str {
    match level {
        ThinkingLevel::Off => "off",
        ThinkingLevel::Low => "low",
        ThinkingLevel::Medium => "medium",
        ThinkingLevel::High => "high",
        ThinkingLevel::DefaultOn => "default_on",
    }
}

fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Null => false,
        _ => true,
    }
}

fn push_pair(args: &mut Vec<String>, flag: &str, value: impl ToString) {
    args.push(flag.into());
    args.push(value.to_string());
}
