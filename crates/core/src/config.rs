use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dialogue::merger::MergerConfig;
use crate::dialogue::questions::QuestionGeneratorConfig;
use crate::dialogue::validator::ValidatorConfig;
use crate::domain::dialogue::ConflictStrategy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub executor: ExecutorConfig,
    pub dialogue: DialogueConfig,
    pub templates: TemplatesConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

/// Downstream action endpoint. With no endpoint configured the server
/// acknowledges every action locally.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub endpoint: Option<String>,
    pub auth_token: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DialogueConfig {
    pub task_timeout_minutes: u64,
    pub conflict_strategy: ConflictStrategy,
    pub pending_capacity: usize,
    pub pending_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_history_entries: usize,
    pub execution_history_limit: usize,
    pub restate_threshold: usize,
    pub max_execution_retries: u32,
    pub default_utc_offset_minutes: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TemplatesConfig {
    /// Directory of `*.toml` templates; the builtin set is used when unset.
    pub path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub templates_path: Option<PathBuf>,
    pub executor_endpoint: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://cadence.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            executor: ExecutorConfig { endpoint: None, auth_token: None, timeout_secs: 10 },
            dialogue: DialogueConfig::default(),
            templates: TemplatesConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            task_timeout_minutes: 30,
            conflict_strategy: ConflictStrategy::Overwrite,
            pending_capacity: 1024,
            pending_ttl_secs: 300,
            sweep_interval_secs: 60,
            max_history_entries: 50,
            execution_history_limit: 20,
            restate_threshold: 1,
            max_execution_retries: 3,
            default_utc_offset_minutes: 0,
        }
    }
}

impl DialogueConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::minutes(i64::try_from(self.task_timeout_minutes).unwrap_or(i64::MAX / 60_000))
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::seconds(i64::try_from(self.pending_ttl_secs).unwrap_or(i64::MAX / 1_000))
    }

    pub fn merger_config(&self) -> MergerConfig {
        MergerConfig {
            task_timeout: self.task_timeout(),
            default_strategy: self.conflict_strategy,
            max_history_entries: self.max_history_entries,
            ..MergerConfig::default()
        }
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig { default_utc_offset_minutes: self.default_utc_offset_minutes }
    }

    pub fn question_config(&self) -> QuestionGeneratorConfig {
        QuestionGeneratorConfig {
            restate_threshold: self.restate_threshold,
            ..QuestionGeneratorConfig::default()
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("cadence.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(executor) = patch.executor {
            if let Some(endpoint) = executor.endpoint {
                self.executor.endpoint = Some(endpoint);
            }
            if let Some(auth_token_value) = executor.auth_token {
                self.executor.auth_token = Some(secret_value(auth_token_value));
            }
            if let Some(timeout_secs) = executor.timeout_secs {
                self.executor.timeout_secs = timeout_secs;
            }
        }

        if let Some(dialogue) = patch.dialogue {
            let target = &mut self.dialogue;
            if let Some(value) = dialogue.task_timeout_minutes {
                target.task_timeout_minutes = value;
            }
            if let Some(value) = dialogue.conflict_strategy {
                target.conflict_strategy = value;
            }
            if let Some(value) = dialogue.pending_capacity {
                target.pending_capacity = value;
            }
            if let Some(value) = dialogue.pending_ttl_secs {
                target.pending_ttl_secs = value;
            }
            if let Some(value) = dialogue.sweep_interval_secs {
                target.sweep_interval_secs = value;
            }
            if let Some(value) = dialogue.max_history_entries {
                target.max_history_entries = value;
            }
            if let Some(value) = dialogue.execution_history_limit {
                target.execution_history_limit = value;
            }
            if let Some(value) = dialogue.restate_threshold {
                target.restate_threshold = value;
            }
            if let Some(value) = dialogue.max_execution_retries {
                target.max_execution_retries = value;
            }
            if let Some(value) = dialogue.default_utc_offset_minutes {
                target.default_utc_offset_minutes = value;
            }
        }

        if let Some(templates) = patch.templates {
            if let Some(path) = templates.path {
                self.templates.path = Some(path);
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CADENCE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CADENCE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("CADENCE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CADENCE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("CADENCE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CADENCE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CADENCE_SERVER_PORT") {
            self.server.port = parse_u16("CADENCE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("CADENCE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("CADENCE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("CADENCE_EXECUTOR_ENDPOINT") {
            self.executor.endpoint = Some(value);
        }
        if let Some(value) = read_env("CADENCE_EXECUTOR_AUTH_TOKEN") {
            self.executor.auth_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("CADENCE_EXECUTOR_TIMEOUT_SECS") {
            self.executor.timeout_secs = parse_u64("CADENCE_EXECUTOR_TIMEOUT_SECS", &value)?;
        }

        let dialogue = &mut self.dialogue;
        if let Some(value) = read_env("CADENCE_DIALOGUE_TASK_TIMEOUT_MINUTES") {
            dialogue.task_timeout_minutes = parse_u64("CADENCE_DIALOGUE_TASK_TIMEOUT_MINUTES", &value)?;
        }
        if let Some(value) = read_env("CADENCE_DIALOGUE_CONFLICT_STRATEGY") {
            dialogue.conflict_strategy = ConflictStrategy::parse(&value).ok_or_else(|| {
                ConfigError::InvalidEnvOverride {
                    key: "CADENCE_DIALOGUE_CONFLICT_STRATEGY".to_string(),
                    value: value.clone(),
                }
            })?;
        }
        if let Some(value) = read_env("CADENCE_DIALOGUE_PENDING_CAPACITY") {
            dialogue.pending_capacity = parse_usize("CADENCE_DIALOGUE_PENDING_CAPACITY", &value)?;
        }
        if let Some(value) = read_env("CADENCE_DIALOGUE_PENDING_TTL_SECS") {
            dialogue.pending_ttl_secs = parse_u64("CADENCE_DIALOGUE_PENDING_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("CADENCE_DIALOGUE_SWEEP_INTERVAL_SECS") {
            dialogue.sweep_interval_secs = parse_u64("CADENCE_DIALOGUE_SWEEP_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("CADENCE_DIALOGUE_MAX_HISTORY_ENTRIES") {
            dialogue.max_history_entries = parse_usize("CADENCE_DIALOGUE_MAX_HISTORY_ENTRIES", &value)?;
        }
        if let Some(value) = read_env("CADENCE_DIALOGUE_EXECUTION_HISTORY_LIMIT") {
            dialogue.execution_history_limit =
                parse_usize("CADENCE_DIALOGUE_EXECUTION_HISTORY_LIMIT", &value)?;
        }
        if let Some(value) = read_env("CADENCE_DIALOGUE_RESTATE_THRESHOLD") {
            dialogue.restate_threshold = parse_usize("CADENCE_DIALOGUE_RESTATE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("CADENCE_DIALOGUE_MAX_EXECUTION_RETRIES") {
            dialogue.max_execution_retries = parse_u32("CADENCE_DIALOGUE_MAX_EXECUTION_RETRIES", &value)?;
        }
        if let Some(value) = read_env("CADENCE_DIALOGUE_DEFAULT_UTC_OFFSET_MINUTES") {
            dialogue.default_utc_offset_minutes =
                parse_i32("CADENCE_DIALOGUE_DEFAULT_UTC_OFFSET_MINUTES", &value)?;
        }

        if let Some(value) = read_env("CADENCE_TEMPLATES_PATH") {
            self.templates.path = Some(PathBuf::from(value));
        }

        let log_level = read_env("CADENCE_LOGGING_LEVEL").or_else(|| read_env("CADENCE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CADENCE_LOGGING_FORMAT").or_else(|| read_env("CADENCE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(templates_path) = overrides.templates_path {
            self.templates.path = Some(templates_path);
        }
        if let Some(endpoint) = overrides.executor_endpoint {
            self.executor.endpoint = Some(endpoint);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_executor(&self.executor)?;
        validate_dialogue(&self.dialogue)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("cadence.toml"), PathBuf::from("config/cadence.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_executor(executor: &ExecutorConfig) -> Result<(), ConfigError> {
    if executor.timeout_secs == 0 || executor.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "executor.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if let Some(endpoint) = &executor.endpoint {
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ConfigError::Validation(
                "executor.endpoint must start with http:// or https://".to_string(),
            ));
        }
    }

    let blank_token = executor
        .auth_token
        .as_ref()
        .map(|token| token.expose_secret().trim().is_empty())
        .unwrap_or(false);
    if blank_token {
        return Err(ConfigError::Validation(
            "executor.auth_token must not be blank when set".to_string(),
        ));
    }

    Ok(())
}

fn validate_dialogue(dialogue: &DialogueConfig) -> Result<(), ConfigError> {
    let positive = [
        ("dialogue.task_timeout_minutes", dialogue.task_timeout_minutes),
        ("dialogue.pending_capacity", dialogue.pending_capacity as u64),
        ("dialogue.pending_ttl_secs", dialogue.pending_ttl_secs),
        ("dialogue.sweep_interval_secs", dialogue.sweep_interval_secs),
        ("dialogue.max_history_entries", dialogue.max_history_entries as u64),
        ("dialogue.execution_history_limit", dialogue.execution_history_limit as u64),
    ];
    for (key, value) in positive {
        if value == 0 {
            return Err(ConfigError::Validation(format!("{key} must be greater than zero")));
        }
    }

    if dialogue.task_timeout_minutes > 7 * 24 * 60 {
        return Err(ConfigError::Validation(
            "dialogue.task_timeout_minutes must not exceed one week".to_string(),
        ));
    }

    if !(-14 * 60..=14 * 60).contains(&dialogue.default_utc_offset_minutes) {
        return Err(ConfigError::Validation(
            "dialogue.default_utc_offset_minutes must be in range -840..=840".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_i32(key: &str, value: &str) -> Result<i32, ConfigError> {
    value.parse::<i32>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    executor: Option<ExecutorPatch>,
    dialogue: Option<DialoguePatch>,
    templates: Option<TemplatesPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ExecutorPatch {
    endpoint: Option<String>,
    auth_token: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct DialoguePatch {
    task_timeout_minutes: Option<u64>,
    conflict_strategy: Option<ConflictStrategy>,
    pending_capacity: Option<usize>,
    pending_ttl_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    max_history_entries: Option<usize>,
    execution_history_limit: Option<usize>,
    restate_threshold: Option<usize>,
    max_execution_retries: Option<u32>,
    default_utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
struct TemplatesPatch {
    path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
    use crate::domain::dialogue::ConflictStrategy;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_match_documented_dialogue_settings() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;
        let dialogue = &config.dialogue;

        ensure(dialogue.task_timeout_minutes == 30, "task timeout defaults to 30 minutes")?;
        ensure(dialogue.pending_ttl_secs == 300, "pending ttl defaults to 300 seconds")?;
        ensure(dialogue.restate_threshold == 1, "restate threshold defaults to 1")?;
        ensure(dialogue.max_execution_retries == 3, "retries default to 3")?;
        ensure(dialogue.conflict_strategy == ConflictStrategy::Overwrite, "overwrite by default")?;
        ensure(config.executor.endpoint.is_none(), "no executor endpoint by default")?;
        ensure(config.templates.path.is_none(), "builtin templates by default")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CADENCE_EXECUTOR_HOST", "actions.internal:9000");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("cadence.toml");
            fs::write(
                &path,
                r#"
[executor]
endpoint = "http://${TEST_CADENCE_EXECUTOR_HOST}/v1/actions"

[dialogue]
conflict_strategy = "keep_existing"
task_timeout_minutes = 45
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.executor.endpoint.as_deref()
                    == Some("http://actions.internal:9000/v1/actions"),
                "executor endpoint should be interpolated from environment",
            )?;
            ensure(
                config.dialogue.conflict_strategy == ConflictStrategy::KeepExisting,
                "conflict strategy should be read from file",
            )?;
            ensure(
                config.dialogue.task_timeout().num_minutes() == 45,
                "task timeout should be read from file",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_CADENCE_EXECUTOR_HOST"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("cadence.toml");
        fs::write(&path, "[database]\nurl = \"${CADENCE_TEST_UNSET_VAR}\"\n")
            .map_err(|err| err.to_string())?;

        let error = match AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() }) {
            Ok(_) => return Err("expected interpolation failure".to_string()),
            Err(error) => error,
        };
        ensure(
            matches!(error, ConfigError::MissingEnvInterpolation { ref var } if var == "CADENCE_TEST_UNSET_VAR"),
            "missing variable should be named in the error",
        )
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CADENCE_LOG_LEVEL", "warn");
        env::set_var("CADENCE_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["CADENCE_LOG_LEVEL", "CADENCE_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CADENCE_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("CADENCE_DIALOGUE_PENDING_TTL_SECS", "120");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("cadence.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[dialogue]
pending_ttl_secs = 600
restate_threshold = 2

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.dialogue.pending_ttl_secs == 120,
                "env pending ttl should win over file and defaults",
            )?;
            ensure(config.dialogue.restate_threshold == 2, "file value should win over default")?;
            Ok(())
        })();

        clear_vars(&["CADENCE_DATABASE_URL", "CADENCE_DIALOGUE_PENDING_TTL_SECS"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CADENCE_DIALOGUE_PENDING_CAPACITY", "0");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("dialogue.pending_capacity")
            );
            ensure(has_message, "validation failure should mention dialogue.pending_capacity")
        })();

        clear_vars(&["CADENCE_DIALOGUE_PENDING_CAPACITY"]);
        result
    }

    #[test]
    fn malformed_env_override_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CADENCE_SERVER_PORT", "eighty");
        env::set_var("CADENCE_DIALOGUE_CONFLICT_STRATEGY", "newest");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected env override failure".to_string()),
                Err(error) => error,
            };
            ensure(
                matches!(error, ConfigError::InvalidEnvOverride { ref key, .. } if key == "CADENCE_SERVER_PORT"),
                "first malformed override should be reported",
            )
        })();

        clear_vars(&["CADENCE_SERVER_PORT", "CADENCE_DIALOGUE_CONFLICT_STRATEGY"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CADENCE_EXECUTOR_AUTH_TOKEN", "bearer-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("bearer-secret-value"),
                "debug output should not contain the executor token",
            )?;
            ensure(
                config.executor.auth_token.as_ref().map(|token| token.expose_secret().to_string())
                    == Some("bearer-secret-value".to_string()),
                "token should still be readable through expose_secret",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["CADENCE_EXECUTOR_AUTH_TOKEN"]);
        result
    }
}
