use serde::{Deserialize, Serialize};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub ocr: OcrConfig,
    pub storage: StorageConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// OCR provider credentials. Both values absent means the adapter is
/// constructed disabled; recognition then fails with a "not configured"
/// error instead of panicking at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    /// Base delay between provider retries, milliseconds.
    pub retry_base_delay_ms: u64,
}

impl OcrConfig {
    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some() && self.api_key.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for receipt images and OCR audit artifacts.
    pub root: String,
    /// Days an audit artifact is kept before the cleanup task removes it.
    pub audit_retention_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Concurrent workers; kept small to respect provider rate limits.
    pub workers: usize,
    /// Seconds an idle worker sleeps between queue polls.
    pub poll_interval_secs: u64,
    /// Whole-job retry delays in seconds, one per retry.
    pub retry_delays_secs: Vec<u64>,
    /// Seconds before a `running` claim is considered abandoned and
    /// becomes claimable again. Must exceed the worst-case job duration
    /// (OCR attempts and their backoff included).
    pub claim_timeout_secs: u64,
    /// Seconds between cleanup-task runs.
    pub cleanup_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: std::env::var("SERVER_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(8080),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgres://localhost/receipt_split".to_string()),
            },
            ocr: OcrConfig {
                endpoint: std::env::var("OCR_ENDPOINT").ok().filter(|s| !s.is_empty()),
                api_key: std::env::var("OCR_API_KEY").ok().filter(|s| !s.is_empty()),
                retry_base_delay_ms: std::env::var("OCR_RETRY_BASE_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1000),
            },
            storage: StorageConfig {
                root: std::env::var("STORAGE_ROOT").unwrap_or_else(|_| "./data".to_string()),
                audit_retention_days: std::env::var("AUDIT_RETENTION_DAYS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            },
            jobs: JobsConfig {
                workers: std::env::var("JOB_WORKERS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(2),
                poll_interval_secs: std::env::var("JOB_POLL_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(2),
                retry_delays_secs: vec![30, 60, 120],
                claim_timeout_secs: std::env::var("JOB_CLAIM_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(600),
                cleanup_interval_secs: std::env::var("CLEANUP_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(86_400),
            },
        }
    }
}
