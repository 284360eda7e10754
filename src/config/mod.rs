//! Application settings.
//!
//! Settings are built once at startup by [`SettingsLoader`] and then shared
//! read-only (typically as `Arc<Settings>`) with every component that needs
//! them. Each section mirrors one concern of the application:
//! - MCP server endpoint
//! - Outbound email (SMTP)
//! - OpenFoodFacts API
//! - Vector database and RAG tuning
//! - Cache, image processing, nutrition scoring, security
//! - Logging, CORS and rate limits

mod loader;

pub use loader::{env_bindings, EnvBinding, SettingsLoader};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

use crate::observability::LogLevel;

/// Sender display name used when `email.from_name` is empty.
pub const DEFAULT_FROM_NAME: &str = "EatSmart Assistant";

/// Sender address used when `email.username` is empty.
pub const DEFAULT_FROM_ADDRESS: &str = "no-reply@eatsmart.local";

/// Default SMTP port (submission with STARTTLS).
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// Default bound on connect and per-command SMTP waits.
pub const DEFAULT_SMTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised while building settings. All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// A source could not be read or a value failed type coercion.
    #[error("failed to load settings: {0}")]
    Source(#[from] config::ConfigError),

    /// The `.env` file exists but could not be parsed.
    #[error("failed to read env file {path}: {source}")]
    EnvFile {
        /// Path of the env file.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: dotenvy::Error,
    },

    /// Two settings fields map to the same environment variable.
    #[error("environment variable {env} is ambiguous: maps to both `{first}` and `{second}`")]
    AmbiguousEnvKey {
        /// Environment variable name.
        env: String,
        /// First settings path.
        first: String,
        /// Second settings path.
        second: String,
    },

    /// A value parsed but is semantically invalid.
    #[error("invalid setting `{field}`: {reason}")]
    Invalid {
        /// Settings path, e.g. `email.smtp_port`.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A settings-derived directory could not be created.
    #[error("cannot prepare {path}: {source}")]
    Io {
        /// Directory or file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The logging subscriber could not be installed.
    #[error("failed to initialise logging: {0}")]
    Logging(String),
}

impl ConfigurationError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigurationError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// MCP server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpSettings {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Server name advertised to clients.
    pub name: String,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3000,
            name: "eatsmart".to_string(),
        }
    }
}

/// Outbound email configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmailSettings {
    /// SMTP server hostname.
    pub smtp_server: String,
    /// SMTP server port.
    pub smtp_port: u16,
    /// Upgrade the session with STARTTLS.
    pub smtp_use_tls: bool,
    /// Bound on connecting and on every command round trip.
    #[serde(with = "humantime_serde")]
    pub smtp_timeout: Duration,
    /// Client identity sent with EHLO.
    pub helo_name: Option<String>,
    /// Login name; also the sender address when non-empty.
    pub username: String,
    /// Login password.
    pub password: Option<SecretString>,
    /// Sender display name.
    pub from_name: String,
    /// SendGrid API key. Parsed for a future SendGrid transport; unused by SMTP.
    pub sendgrid_api_key: Option<SecretString>,
    /// SendGrid sender address. Parsed for a future SendGrid transport.
    pub sendgrid_from_email: Option<String>,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            smtp_server: "smtp.gmail.com".to_string(),
            smtp_port: DEFAULT_SMTP_PORT,
            smtp_use_tls: true,
            smtp_timeout: DEFAULT_SMTP_TIMEOUT,
            helo_name: None,
            username: String::new(),
            password: None,
            from_name: DEFAULT_FROM_NAME.to_string(),
            sendgrid_api_key: None,
            sendgrid_from_email: None,
        }
    }
}

impl EmailSettings {
    /// Returns `host:port` of the SMTP server.
    pub fn address(&self) -> String {
        format!("{}:{}", self.smtp_server, self.smtp_port)
    }

    /// Returns true when both username and password are non-empty.
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
            && self
                .password
                .as_ref()
                .map(|p| !p.expose_secret().is_empty())
                .unwrap_or(false)
    }

    /// Returns the EHLO client identity.
    pub fn helo_name(&self) -> &str {
        self.helo_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or("localhost")
    }

    /// Returns the sender display name, falling back to the default.
    pub fn sender_name(&self) -> &str {
        if self.from_name.is_empty() {
            DEFAULT_FROM_NAME
        } else {
            &self.from_name
        }
    }

    /// Returns the sender address, falling back to the placeholder.
    pub fn sender_address(&self) -> &str {
        if self.username.is_empty() {
            DEFAULT_FROM_ADDRESS
        } else {
            &self.username
        }
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.smtp_server.trim().is_empty() {
            return Err(ConfigurationError::invalid("email.smtp_server", "host is required"));
        }
        if self.smtp_port == 0 {
            return Err(ConfigurationError::invalid("email.smtp_port", "port must be non-zero"));
        }
        if self.smtp_timeout.is_zero() {
            return Err(ConfigurationError::invalid("email.smtp_timeout", "timeout must be positive"));
        }
        Ok(())
    }
}

/// OpenFoodFacts API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenFoodFactsSettings {
    /// API base URL.
    pub base_url: String,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Request timeout in seconds.
    pub timeout: u64,
    /// Maximum retries per request.
    pub max_retries: u32,
}

impl Default for OpenFoodFactsSettings {
    fn default() -> Self {
        Self {
            base_url: "https://world.openfoodfacts.org".to_string(),
            user_agent: "EatSmart/1.0.0".to_string(),
            timeout: 30,
            max_retries: 3,
        }
    }
}

/// Vector database configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VectorDbSettings {
    /// Local ChromaDB directory.
    pub chromadb_path: String,
    /// Collection holding product embeddings.
    pub collection_name: String,
    /// Pinecone API key.
    pub pinecone_api_key: Option<SecretString>,
    /// Pinecone environment.
    pub pinecone_environment: Option<String>,
    /// Pinecone index name.
    pub pinecone_index_name: String,
    /// Embedding model identifier.
    pub embedding_model: String,
    /// Embedding vector dimension.
    pub embedding_dimension: usize,
}

impl Default for VectorDbSettings {
    fn default() -> Self {
        Self {
            chromadb_path: "./data/chromadb".to_string(),
            collection_name: "eatsmart_products".to_string(),
            pinecone_api_key: None,
            pinecone_environment: None,
            pinecone_index_name: "eatsmart-index".to_string(),
            embedding_model: "all-MiniLM-L6-v2".to_string(),
            embedding_dimension: 384,
        }
    }
}

/// Retrieval-augmented generation tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RagSettings {
    /// Results returned per query.
    pub top_k_results: usize,
    /// Minimum similarity for a hit.
    pub similarity_threshold: f64,
    /// Maximum context length in characters.
    pub max_context_length: usize,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            top_k_results: 10,
            similarity_threshold: 0.7,
            max_context_length: 4000,
        }
    }
}

/// Cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Enable caching.
    pub enabled: bool,
    /// Entry time to live in seconds.
    pub ttl_seconds: u64,
    /// Maximum number of entries.
    pub max_size: usize,
    /// Redis URL; in-process cache when unset.
    pub redis_url: Option<String>,
    /// Redis password.
    pub redis_password: Option<SecretString>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 3600,
            max_size: 1000,
            redis_url: None,
            redis_password: None,
        }
    }
}

impl CacheSettings {
    /// Returns the entry time to live.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Image processing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    /// Maximum size as `WIDTHxHEIGHT`.
    pub max_size: String,
    /// Encoder quality (0-100).
    pub quality: u8,
    /// Accepted file extensions.
    pub supported_formats: Vec<String>,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            max_size: "1024x1024".to_string(),
            quality: 85,
            supported_formats: vec!["jpg".to_string(), "png".to_string(), "webp".to_string()],
        }
    }
}

impl ImageSettings {
    /// Parses `max_size` into `(width, height)`.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        let (w, h) = self.max_size.split_once(['x', 'X'])?;
        let w = w.trim().parse().ok()?;
        let h = h.trim().parse().ok()?;
        if w == 0 || h == 0 {
            return None;
        }
        Some((w, h))
    }
}

/// Nutrition scoring configuration. Only settable from a settings file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NutritionSettings {
    /// Weight of each factor in the health score.
    pub health_score_weights: HashMap<String, f64>,
}

impl Default for NutritionSettings {
    fn default() -> Self {
        let health_score_weights = ["sugar", "salt", "fat", "additives"]
            .iter()
            .map(|factor| (factor.to_string(), 0.25))
            .collect();
        Self { health_score_weights }
    }
}

/// Security configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Signing key.
    pub secret_key: SecretString,
    /// Header carrying API keys.
    pub api_key_header: String,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            secret_key: SecretString::new("change-this-in-production".to_string()),
            api_key_header: "X-API-Key".to_string(),
        }
    }
}

/// Immutable application settings snapshot.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Debug mode.
    pub debug: bool,
    /// Minimum log level name.
    pub log_level: String,
    /// Deployment environment name.
    pub environment: String,
    /// Directory that `data/`, `logs/` and relative paths resolve against.
    pub project_root: Option<PathBuf>,

    /// MCP server.
    pub mcp: McpSettings,
    /// Outbound email.
    pub email: EmailSettings,
    /// OpenFoodFacts API.
    pub openfoodfacts: OpenFoodFactsSettings,
    /// Vector database.
    pub vector_db: VectorDbSettings,
    /// RAG tuning.
    pub rag: RagSettings,
    /// Cache.
    pub cache: CacheSettings,
    /// Image processing.
    pub image: ImageSettings,
    /// Nutrition scoring.
    pub nutrition: NutritionSettings,
    /// Security.
    pub security: SecuritySettings,

    /// API requests allowed per minute.
    pub api_rate_limit_per_minute: u32,
    /// Maximum products per request.
    pub max_products_per_request: u32,

    /// Database URL.
    pub database_url: String,
    /// Echo SQL statements.
    pub database_echo: bool,

    /// Emit JSON logs.
    pub enable_structured_logging: bool,
    /// Log file, relative to the project root unless absolute.
    pub log_file_path: String,
    /// Rotate the log file once it reaches this size, e.g. `10MB`.
    pub log_rotation_size: String,
    /// Days to keep rotated log files.
    pub log_retention_days: u32,

    /// Reload on source change (development servers).
    pub reload_on_change: bool,
    /// Enable CORS.
    pub enable_cors: bool,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,

    /// OpenAI API key.
    pub openai_api_key: Option<SecretString>,
    /// Anthropic API key.
    pub anthropic_api_key: Option<SecretString>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: true,
            log_level: "INFO".to_string(),
            environment: "development".to_string(),
            project_root: None,
            mcp: McpSettings::default(),
            email: EmailSettings::default(),
            openfoodfacts: OpenFoodFactsSettings::default(),
            vector_db: VectorDbSettings::default(),
            rag: RagSettings::default(),
            cache: CacheSettings::default(),
            image: ImageSettings::default(),
            nutrition: NutritionSettings::default(),
            security: SecuritySettings::default(),
            api_rate_limit_per_minute: 60,
            max_products_per_request: 50,
            database_url: "sqlite:///./data/eatsmart.db".to_string(),
            database_echo: false,
            enable_structured_logging: true,
            log_file_path: "./logs/eatsmart.log".to_string(),
            log_rotation_size: "10MB".to_string(),
            log_retention_days: 30,
            reload_on_change: true,
            enable_cors: true,
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            openai_api_key: None,
            anthropic_api_key: None,
        }
    }
}

impl Settings {
    /// Loads settings from the default sources (`.env` and the environment).
    pub fn load() -> Result<Self, ConfigurationError> {
        SettingsLoader::new().load()
    }

    /// Validates cross-field and semantic constraints.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.email.validate()?;

        if self.log_level.parse::<LogLevel>().is_err() {
            return Err(ConfigurationError::invalid(
                "log_level",
                format!("unknown level {:?}", self.log_level),
            ));
        }
        self.log_rotation_bytes()?;

        if self.image.dimensions().is_none() {
            return Err(ConfigurationError::invalid(
                "image.max_size",
                format!("expected WIDTHxHEIGHT, got {:?}", self.image.max_size),
            ));
        }
        if self.image.quality > 100 {
            return Err(ConfigurationError::invalid("image.quality", "must be between 0 and 100"));
        }
        if !(0.0..=1.0).contains(&self.rag.similarity_threshold) {
            return Err(ConfigurationError::invalid(
                "rag.similarity_threshold",
                "must be between 0 and 1",
            ));
        }

        Ok(())
    }

    /// Returns the project root.
    pub fn project_root(&self) -> PathBuf {
        self.project_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Returns `<root>/data`, creating it if absent.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigurationError> {
        ensure_dir(self.project_root().join("data"))
    }

    /// Returns `<root>/logs`, creating it if absent.
    pub fn logs_dir(&self) -> Result<PathBuf, ConfigurationError> {
        ensure_dir(self.project_root().join("logs"))
    }

    /// Returns the log file path resolved against the project root.
    pub fn log_file(&self) -> PathBuf {
        self.resolve(&self.log_file_path)
    }

    /// Returns the log rotation threshold in bytes.
    pub fn log_rotation_bytes(&self) -> Result<u64, ConfigurationError> {
        parse_byte_size(&self.log_rotation_size).ok_or_else(|| {
            ConfigurationError::invalid(
                "log_rotation_size",
                format!("expected a size such as 10MB, got {:?}", self.log_rotation_size),
            )
        })
    }

    /// Returns true when running in development mode.
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Returns true when running in production mode.
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Returns true when running in testing mode.
    pub fn is_testing(&self) -> bool {
        self.environment.eq_ignore_ascii_case("testing")
    }

    fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root().join(path)
        }
    }
}

fn ensure_dir(path: PathBuf) -> Result<PathBuf, ConfigurationError> {
    fs::create_dir_all(&path).map_err(|source| ConfigurationError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Parses sizes such as `500`, `64KB`, `10 MB` or `1GiB` into bytes.
///
/// `KB`/`MB`/`GB` are decimal, `KiB`/`MiB`/`GiB` binary.
pub fn parse_byte_size(input: &str) -> Option<u64> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);
    let number: u64 = number.parse().ok()?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        _ => return None,
    };
    number.checked_mul(multiplier).filter(|bytes| *bytes > 0)
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
