use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use cadence_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value, env_key) in effective_values(&config) {
        let source = field_source(key, env_key, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key, &value, source));
    }

    lines.join("\n")
}

fn effective_values(config: &AppConfig) -> Vec<(&'static str, String, Option<&'static str>)> {
    let dialogue = &config.dialogue;
    let auth_token = config
        .executor
        .auth_token
        .as_ref()
        .map(|token| redact_token(token.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());

    vec![
        ("database.url", config.database.url.clone(), Some("CADENCE_DATABASE_URL")),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            Some("CADENCE_DATABASE_MAX_CONNECTIONS"),
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            Some("CADENCE_DATABASE_TIMEOUT_SECS"),
        ),
        ("server.bind_address", config.server.bind_address.clone(), Some("CADENCE_SERVER_BIND_ADDRESS")),
        ("server.port", config.server.port.to_string(), Some("CADENCE_SERVER_PORT")),
        (
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            Some("CADENCE_SERVER_GRACEFUL_SHUTDOWN_SECS"),
        ),
        (
            "executor.endpoint",
            config.executor.endpoint.clone().unwrap_or_else(|| "<unset>".to_string()),
            Some("CADENCE_EXECUTOR_ENDPOINT"),
        ),
        ("executor.auth_token", auth_token, Some("CADENCE_EXECUTOR_AUTH_TOKEN")),
        (
            "executor.timeout_secs",
            config.executor.timeout_secs.to_string(),
            Some("CADENCE_EXECUTOR_TIMEOUT_SECS"),
        ),
        (
            "dialogue.task_timeout_minutes",
            dialogue.task_timeout_minutes.to_string(),
            Some("CADENCE_DIALOGUE_TASK_TIMEOUT_MINUTES"),
        ),
        (
            "dialogue.conflict_strategy",
            dialogue.conflict_strategy.as_str().to_string(),
            Some("CADENCE_DIALOGUE_CONFLICT_STRATEGY"),
        ),
        (
            "dialogue.pending_capacity",
            dialogue.pending_capacity.to_string(),
            Some("CADENCE_DIALOGUE_PENDING_CAPACITY"),
        ),
        (
            "dialogue.pending_ttl_secs",
            dialogue.pending_ttl_secs.to_string(),
            Some("CADENCE_DIALOGUE_PENDING_TTL_SECS"),
        ),
        (
            "dialogue.sweep_interval_secs",
            dialogue.sweep_interval_secs.to_string(),
            Some("CADENCE_DIALOGUE_SWEEP_INTERVAL_SECS"),
        ),
        (
            "dialogue.max_history_entries",
            dialogue.max_history_entries.to_string(),
            Some("CADENCE_DIALOGUE_MAX_HISTORY_ENTRIES"),
        ),
        (
            "dialogue.execution_history_limit",
            dialogue.execution_history_limit.to_string(),
            Some("CADENCE_DIALOGUE_EXECUTION_HISTORY_LIMIT"),
        ),
        (
            "dialogue.restate_threshold",
            dialogue.restate_threshold.to_string(),
            Some("CADENCE_DIALOGUE_RESTATE_THRESHOLD"),
        ),
        (
            "dialogue.max_execution_retries",
            dialogue.max_execution_retries.to_string(),
            Some("CADENCE_DIALOGUE_MAX_EXECUTION_RETRIES"),
        ),
        (
            "dialogue.default_utc_offset_minutes",
            dialogue.default_utc_offset_minutes.to_string(),
            Some("CADENCE_DIALOGUE_DEFAULT_UTC_OFFSET_MINUTES"),
        ),
        (
            "templates.path",
            config
                .templates
                .path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<builtin>".to_string()),
            Some("CADENCE_TEMPLATES_PATH"),
        ),
        ("logging.level", config.logging.level.clone(), Some("CADENCE_LOGGING_LEVEL")),
        ("logging.format", format!("{:?}", config.logging.format), Some("CADENCE_LOGGING_FORMAT")),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("cadence.toml"), PathBuf::from("config/cadence.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}

#[cfg(test)]
mod tests {
    use super::{contains_path, redact_token};

    #[test]
    fn tokens_keep_only_their_prefix() {
        assert_eq!(redact_token("live-abc123"), "live-***");
        assert_eq!(redact_token("opaque"), "<redacted>");
        assert_eq!(redact_token("  "), "<empty>");
    }

    #[test]
    fn dotted_paths_are_found_in_nested_tables() {
        let doc: toml::Value = "[dialogue]\ntask_timeout_minutes = 45\n".parse().expect("toml");
        assert!(contains_path(&doc, "dialogue.task_timeout_minutes"));
        assert!(!contains_path(&doc, "dialogue.pending_ttl_secs"));
    }
}
