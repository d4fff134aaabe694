use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    Development,
    Staging,
    Production,
}

fn default_environment() -> RuntimeEnvironment {
    RuntimeEnvironment::Development
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default = "default_environment")]
    pub environment: RuntimeEnvironment,
    #[serde(default = "default_rake_port")]
    pub rake_port: u16,

    #[serde(default = "default_surrealdb_address")]
    pub surrealdb_address: String,
    #[serde(default = "default_surrealdb_credential")]
    pub surrealdb_username: String,
    #[serde(default = "default_surrealdb_credential")]
    pub surrealdb_password: String,
    #[serde(default = "default_surrealdb_namespace")]
    pub surrealdb_namespace: String,
    #[serde(default = "default_surrealdb_namespace")]
    pub surrealdb_database: String,

    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_embedding_model")]
    pub openai_embedding_model: String,
    #[serde(default = "default_batch_size")]
    pub openai_batch_size: usize,

    #[serde(default = "default_vector_store_base_url")]
    pub vector_store_base_url: String,
    #[serde(default = "default_http_timeout_secs")]
    pub vector_store_timeout_secs: u64,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: f64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_chunk_strategy")]
    pub chunk_strategy: String,

    #[serde(default)]
    pub sec_edgar_user_agent: Option<String>,
    #[serde(default = "default_sec_edgar_rate_limit")]
    pub sec_edgar_rate_limit: f64,

    #[serde(default = "default_url_scrape_rate_limit")]
    pub url_scrape_rate_limit: f64,
    #[serde(default = "default_true")]
    pub url_scrape_respect_robots: bool,

    #[serde(default = "default_true")]
    pub db_query_read_only: bool,

    #[serde(default)]
    pub scheduler_enabled: bool,
}

fn default_rake_port() -> u16 {
    8002
}

fn default_surrealdb_address() -> String {
    "ws://127.0.0.1:8000".to_string()
}

fn default_surrealdb_credential() -> String {
    "root".to_string()
}

fn default_surrealdb_namespace() -> String {
    "rake".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_vector_store_base_url() -> String {
    "http://localhost:8001".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_max_workers() -> usize {
    4
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> f64 {
    1.0
}

fn default_retry_backoff() -> f64 {
    2.0
}

fn default_chunk_size() -> usize {
    500
}

fn default_chunk_overlap() -> usize {
    50
}

fn default_chunk_strategy() -> String {
    "token_based".to_string()
}

fn default_sec_edgar_rate_limit() -> f64 {
    0.1
}

fn default_url_scrape_rate_limit() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Bounds checks over every tunable. Invalid values are a startup
    /// failure, not something to silently clamp mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn out_of_range(name: &str, detail: String) -> ConfigError {
            ConfigError::Message(format!("{name}: {detail}"))
        }

        if !(1..=2048).contains(&self.openai_batch_size) {
            return Err(out_of_range(
                "openai_batch_size",
                format!("must be in 1..=2048, got {}", self.openai_batch_size),
            ));
        }
        if !(1..=32).contains(&self.max_workers) {
            return Err(out_of_range(
                "max_workers",
                format!("must be in 1..=32, got {}", self.max_workers),
            ));
        }
        if !(1..=10).contains(&self.retry_attempts) {
            return Err(out_of_range(
                "retry_attempts",
                format!("must be in 1..=10, got {}", self.retry_attempts),
            ));
        }
        if !(0.1..=60.0).contains(&self.retry_delay) {
            return Err(out_of_range(
                "retry_delay",
                format!("must be in 0.1..=60, got {}", self.retry_delay),
            ));
        }
        if !(1.0..=10.0).contains(&self.retry_backoff) {
            return Err(out_of_range(
                "retry_backoff",
                format!("must be in 1..=10, got {}", self.retry_backoff),
            ));
        }
        if !(100..=2000).contains(&self.chunk_size) {
            return Err(out_of_range(
                "chunk_size",
                format!("must be in 100..=2000, got {}", self.chunk_size),
            ));
        }
        if !matches!(
            self.chunk_strategy.as_str(),
            "token_based" | "semantic" | "hybrid"
        ) {
            return Err(out_of_range(
                "chunk_strategy",
                format!(
                    "must be token_based, semantic or hybrid, got '{}'",
                    self.chunk_strategy
                ),
            ));
        }
        if self.chunk_overlap > 500 || self.chunk_overlap >= self.chunk_size {
            return Err(out_of_range(
                "chunk_overlap",
                format!(
                    "must be in 0..=500 and less than chunk_size ({}), got {}",
                    self.chunk_size, self.chunk_overlap
                ),
            ));
        }
        if !(0.1..=1.0).contains(&self.sec_edgar_rate_limit) {
            return Err(out_of_range(
                "sec_edgar_rate_limit",
                format!("must be in 0.1..=1, got {}", self.sec_edgar_rate_limit),
            ));
        }
        if !(0.1..=10.0).contains(&self.url_scrape_rate_limit) {
            return Err(out_of_range(
                "url_scrape_rate_limit",
                format!("must be in 0.1..=10, got {}", self.url_scrape_rate_limit),
            ));
        }
        if self.environment == RuntimeEnvironment::Production && self.openai_api_key.is_empty() {
            return Err(ConfigError::Message(
                "openai_api_key is required in production".to_string(),
            ));
        }

        Ok(())
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;
    app_config.validate()?;

    Ok(app_config)
}
