use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use credeval_core::config::{AppConfig, LoadOptions};
use toml::Value;

/// `(key path, rendered value, environment variables that can set it)`
type ConfigLine = (&'static str, String, &'static [&'static str]);

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value, env_keys) in effective_values(&config) {
        let source =
            field_source(key, env_keys, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key, &value, source));
    }
    lines.join("\n")
}

fn effective_values(config: &AppConfig) -> Vec<ConfigLine> {
    let llm = &config.llm;
    let orchestrator = &config.orchestrator;
    let api_key = if llm.api_key.is_some() { "<redacted>" } else { "<unset>" };

    vec![
        line("database.url", config.database.url.clone(), &["CREDEVAL_DATABASE_URL"]),
        line(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["CREDEVAL_DATABASE_MAX_CONNECTIONS"],
        ),
        line(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["CREDEVAL_DATABASE_TIMEOUT_SECS"],
        ),
        line("llm.provider", llm.provider.as_str().to_string(), &["CREDEVAL_LLM_PROVIDER"]),
        line("llm.model", llm.model_name().to_string(), &["CREDEVAL_LLM_MODEL"]),
        line("llm.base_url", llm.endpoint().to_string(), &["CREDEVAL_LLM_BASE_URL"]),
        line(
            "llm.api_key",
            api_key.to_string(),
            &["CREDEVAL_LLM_API_KEY", "GEMINI_API_KEY", "ANTHROPIC_API_KEY"],
        ),
        line("llm.timeout_secs", llm.timeout_secs.to_string(), &["CREDEVAL_LLM_TIMEOUT_SECS"]),
        line("llm.max_retries", llm.max_retries.to_string(), &["CREDEVAL_LLM_MAX_RETRIES"]),
        line(
            "llm.max_output_tokens",
            llm.max_output_tokens.to_string(),
            &["CREDEVAL_LLM_MAX_OUTPUT_TOKENS"],
        ),
        line("llm.temperature", llm.temperature.to_string(), &[]),
        line(
            "orchestrator.max_turns",
            orchestrator.max_turns.to_string(),
            &["CREDEVAL_ORCHESTRATOR_MAX_TURNS"],
        ),
        line(
            "orchestrator.deadline_secs",
            orchestrator.deadline_secs.to_string(),
            &["CREDEVAL_ORCHESTRATOR_DEADLINE_SECS"],
        ),
        line("orchestrator.max_reprompts", orchestrator.max_reprompts.to_string(), &[]),
        line("orchestrator.retry_backoff_ms", orchestrator.retry_backoff_ms.to_string(), &[]),
        line(
            "orchestrator.parallel_tools",
            orchestrator.parallel_tools.to_string(),
            &["CREDEVAL_ORCHESTRATOR_PARALLEL_TOOLS"],
        ),
        line(
            "logging.level",
            config.logging.level.clone(),
            &["CREDEVAL_LOGGING_LEVEL", "CREDEVAL_LOG_LEVEL"],
        ),
        line(
            "logging.format",
            format!("{:?}", config.logging.format).to_ascii_lowercase(),
            &["CREDEVAL_LOGGING_FORMAT", "CREDEVAL_LOG_FORMAT"],
        ),
    ]
}

fn line(key: &'static str, value: String, env_keys: &'static [&'static str]) -> ConfigLine {
    (key, value, env_keys)
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("credeval.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/credeval.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
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
