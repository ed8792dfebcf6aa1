use crate::error::{NlqError, Result};
use std::time::Duration;

/// Runtime configuration, loaded from environment variables (a `.env` file is
/// honored when present).
#[derive(Debug, Clone)]
pub struct Config {
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,

    /// Base URL of the llama.cpp completion server.
    pub completion_url: String,
    /// Model label forwarded to the completion server (informational for
    /// multi-model servers; a single loaded model ignores it).
    pub completion_model: String,
    pub completion_max_tokens: u32,
    /// Near-deterministic by default to minimize hallucination variance.
    pub completion_temperature: f32,
    /// Number of inference contexts that may run concurrently. A single
    /// loaded llama.cpp model is not safely reentrant, so this is 1 unless
    /// the server is known to batch.
    pub completion_concurrency: usize,

    pub request_timeout: Duration,
    pub query_timeout: Duration,
    pub max_rows: u64,
    pub prompt_max_chars: usize,
    pub schema_cache_ttl: Duration,

    /// Curated domain documentation for the knowledge index.
    pub domain_docs_path: String,

    /// Column type names (as reported by information_schema) whose equality
    /// predicates get rewritten to fuzzy ILIKE form. Configurable because the
    /// exact rewrite scope is a policy decision, not a fixed rule.
    pub fuzzy_rewrite_types: Vec<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| NlqError::Config(format!("invalid value for {}: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let fuzzy_rewrite_types = env_or(
            "FUZZY_REWRITE_TYPES",
            "character varying,varchar,text,character,char,citext",
        )
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();

        Ok(Self {
            db_host: env_or("DB_HOST", "localhost"),
            db_port: env_parse("DB_PORT", 5432)?,
            db_name: env_or("DB_NAME", "katana"),
            db_user: env_or("DB_USER", "postgres"),
            db_password: env_or("DB_PASSWORD", ""),
            completion_url: env_or("COMPLETION_URL", "http://localhost:8081"),
            completion_model: env_or("COMPLETION_MODEL", "sqlcoder-7b-2"),
            completion_max_tokens: env_parse("COMPLETION_MAX_TOKENS", 256)?,
            completion_temperature: env_parse("COMPLETION_TEMPERATURE", 0.1)?,
            completion_concurrency: env_parse("COMPLETION_CONCURRENCY", 1)?,
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECS", 60u64)?),
            query_timeout: Duration::from_secs(env_parse("QUERY_TIMEOUT_SECS", 30u64)?),
            max_rows: env_parse("MAX_ROWS", 200u64)?,
            prompt_max_chars: env_parse("PROMPT_MAX_CHARS", 8000usize)?,
            schema_cache_ttl: Duration::from_secs(env_parse("SCHEMA_CACHE_TTL_SECS", 300u64)?),
            domain_docs_path: env_or("DOMAIN_DOCS_PATH", "docs/domain_knowledge.json"),
            fuzzy_rewrite_types,
        })
    }

    /// Connection string for sqlx. DATABASE_URL wins when set.
    pub fn database_url(&self) -> String {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            return url;
        }
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.db_user, self.db_password, self.db_host, self.db_port, self.db_name
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_host: "localhost".into(),
            db_port: 5432,
            db_name: "katana".into(),
            db_user: "postgres".into(),
            db_password: String::new(),
            completion_url: "http://localhost:8081".into(),
            completion_model: "sqlcoder-7b-2".into(),
            completion_max_tokens: 256,
            completion_temperature: 0.1,
            completion_concurrency: 1,
            request_timeout: Duration::from_secs(60),
            query_timeout: Duration::from_secs(30),
            max_rows: 200,
            prompt_max_chars: 8000,
            schema_cache_ttl: Duration::from_secs(300),
            domain_docs_path: "docs/domain_knowledge.json".into(),
            fuzzy_rewrite_types: vec![
                "character varying".into(),
                "varchar".into(),
                "text".into(),
                "character".into(),
                "char".into(),
                "citext".into(),
            ],
        }
    }
}
