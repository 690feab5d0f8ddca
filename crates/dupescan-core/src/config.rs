use anyhow::Result;
use std::collections::HashMap;

/// Full application configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    pub vector_store_url: String,
    pub code_collection: String,
    pub intent_collection: String,

    // Source host (GitHub-compatible)
    pub source_host_base_url: String,
    pub source_host_token: String,

    // Embedding provider
    pub embedding_base_url: String,
    pub embedding_api_key: String,
    pub embedding_model: String,
    pub embedding_context_window: u32,

    // Chat / LLM provider
    pub chat_base_url: String,
    pub chat_api_key: String,
    pub chat_model: String,

    // Rate limiter, shared across provider clients
    pub rate_limit_max_concurrent: u32,
    pub rate_limit_max_retries: u32,
    pub rate_limit_base_backoff_ms: u64,

    // Job queue
    pub job_max_retries: i32,
    pub job_base_backoff_ms: u64,
    pub worker_idle_sleep_ms: u64,

    // Phase tuning
    pub phase_concurrency: u32,
    pub embed_batch_size: u32,
    pub code_similarity_threshold: f64,
    pub intent_similarity_threshold: f64,
    pub intent_summary_via_llm: bool,
    pub cluster_search_limit: u64,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_i32(key: &str, dotenv: &HashMap<String, String>, default: i32) -> i32 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_f64(key: &str, dotenv: &HashMap<String, String>, default: f64) -> f64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        Ok(Config {
            database_url: get_str(
                "DATABASE_URL",
                &dotenv,
                "postgres://localhost/dupescan",
            ),
            vector_store_url: get_str("VECTOR_STORE_URL", &dotenv, "http://localhost:6334"),
            code_collection: get_str("CODE_COLLECTION", &dotenv, "code"),
            intent_collection: get_str("INTENT_COLLECTION", &dotenv, "intent"),

            source_host_base_url: get_str(
                "SOURCE_HOST_BASE_URL",
                &dotenv,
                "https://api.github.com",
            ),
            source_host_token: get_str("SOURCE_HOST_TOKEN", &dotenv, ""),

            embedding_base_url: get_str("EMBEDDING_BASE_URL", &dotenv, ""),
            embedding_api_key: get_str("EMBEDDING_API_KEY", &dotenv, ""),
            embedding_model: get_str("EMBEDDING_MODEL", &dotenv, "text-embedding-3-small"),
            embedding_context_window: get_u32("EMBEDDING_CONTEXT_WINDOW", &dotenv, 8191),

            chat_base_url: get_str("CHAT_BASE_URL", &dotenv, ""),
            chat_api_key: get_str("CHAT_API_KEY", &dotenv, ""),
            chat_model: get_str("CHAT_MODEL", &dotenv, "gpt-4o-mini"),

            rate_limit_max_concurrent: get_u32("RATE_LIMIT_MAX_CONCURRENT", &dotenv, 8),
            rate_limit_max_retries: get_u32("RATE_LIMIT_MAX_RETRIES", &dotenv, 3),
            rate_limit_base_backoff_ms: get_u64("RATE_LIMIT_BASE_BACKOFF_MS", &dotenv, 1000),

            job_max_retries: get_i32("JOB_MAX_RETRIES", &dotenv, 3),
            job_base_backoff_ms: get_u64("JOB_BASE_BACKOFF_MS", &dotenv, 1000),
            worker_idle_sleep_ms: get_u64("WORKER_IDLE_SLEEP_MS", &dotenv, 500),

            phase_concurrency: get_u32("PHASE_CONCURRENCY", &dotenv, 4),
            embed_batch_size: get_u32("EMBED_BATCH_SIZE", &dotenv, 64),
            code_similarity_threshold: get_f64("CODE_SIMILARITY_THRESHOLD", &dotenv, 0.85),
            intent_similarity_threshold: get_f64(
                "INTENT_SIMILARITY_THRESHOLD",
                &dotenv,
                0.80,
            ),
            intent_summary_via_llm: get_bool("INTENT_SUMMARY_VIA_LLM", &dotenv, false),
            cluster_search_limit: get_u64("CLUSTER_SEARCH_LIMIT", &dotenv, 20),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_absent() {
        let dotenv = HashMap::new();
        assert_eq!(get_str("DOES_NOT_EXIST", &dotenv, "fallback"), "fallback");
        assert_eq!(get_u32("DOES_NOT_EXIST", &dotenv, 7), 7);
        assert_eq!(get_f64("DOES_NOT_EXIST", &dotenv, 0.85), 0.85);
    }

    #[test]
    fn bool_parses_from_dotenv() {
        let mut dotenv = HashMap::new();
        dotenv.insert("INTENT_SUMMARY_VIA_LLM".to_string(), "true".to_string());
        assert!(get_bool("INTENT_SUMMARY_VIA_LLM", &dotenv, false));
        assert!(!get_bool("MISSING_FLAG", &dotenv, false));
    }

    #[test]
    fn dotenv_value_overrides_default() {
        let mut dotenv = HashMap::new();
        dotenv.insert("EMBED_BATCH_SIZE".to_string(), "128".to_string());
        assert_eq!(get_u32("EMBED_BATCH_SIZE", &dotenv, 64), 128);
    }
}
