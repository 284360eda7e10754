//! Layered settings loading.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use config::{Config, File};
use tracing::debug;

use super::{ConfigurationError, Settings};

/// Top-level fields bound directly to their uppercased name.
const TOP_LEVEL: &[&str] = &[
    "debug",
    "log_level",
    "environment",
    "project_root",
    "api_rate_limit_per_minute",
    "max_products_per_request",
    "database_url",
    "database_echo",
    "enable_structured_logging",
    "log_file_path",
    "log_rotation_size",
    "log_retention_days",
    "reload_on_change",
    "enable_cors",
    "cors_origins",
    "openai_api_key",
    "anthropic_api_key",
];

/// Section fields bound to `SECTION_FIELD`.
const SECTIONS: &[(&str, &[&str])] = &[
    ("mcp", &["host", "port", "name"]),
    (
        "email",
        &[
            "smtp_server",
            "smtp_port",
            "smtp_use_tls",
            "smtp_timeout",
            "helo_name",
            "username",
            "password",
            "from_name",
            "sendgrid_api_key",
            "sendgrid_from_email",
        ],
    ),
    (
        "openfoodfacts",
        &["base_url", "user_agent", "timeout", "max_retries"],
    ),
    (
        "vector_db",
        &[
            "chromadb_path",
            "collection_name",
            "pinecone_api_key",
            "pinecone_environment",
            "pinecone_index_name",
            "embedding_model",
            "embedding_dimension",
        ],
    ),
    (
        "rag",
        &["top_k_results", "similarity_threshold", "max_context_length"],
    ),
    (
        "cache",
        &["enabled", "ttl_seconds", "max_size", "redis_url", "redis_password"],
    ),
    ("image", &["max_size", "quality", "supported_formats"]),
    ("security", &["secret_key", "api_key_header"]),
];

/// Fields holding a list of strings.
const LIST_FIELDS: &[&str] = &["cors_origins", "image.supported_formats"];

/// Binding of one environment variable to one settings path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvBinding {
    /// Uppercased variable name.
    pub env: String,
    /// Dotted settings path.
    pub path: String,
}

impl EnvBinding {
    fn new(env: String, path: String) -> Self {
        Self { env, path }
    }

    /// Returns true if the field holds a list.
    pub fn is_list(&self) -> bool {
        LIST_FIELDS.contains(&self.path.as_str())
    }
}

/// Returns the full environment binding table.
///
/// Fails if two settings paths map to the same variable name.
pub fn env_bindings() -> Result<Vec<EnvBinding>, ConfigurationError> {
    let top = TOP_LEVEL
        .iter()
        .map(|field| EnvBinding::new(field.to_ascii_uppercase(), field.to_string()));
    let nested = SECTIONS.iter().flat_map(|(section, fields)| {
        fields.iter().map(move |field| {
            EnvBinding::new(
                format!("{section}_{field}").to_ascii_uppercase(),
                format!("{section}.{field}"),
            )
        })
    });
    check_unique(top.chain(nested).collect())
}

fn check_unique(bindings: Vec<EnvBinding>) -> Result<Vec<EnvBinding>, ConfigurationError> {
    let mut seen: HashMap<&str, &str> = HashMap::with_capacity(bindings.len());
    for binding in &bindings {
        if let Some(first) = seen.insert(&binding.env, &binding.path) {
            return Err(ConfigurationError::AmbiguousEnvKey {
                env: binding.env.clone(),
                first: first.to_string(),
                second: binding.path.clone(),
            });
        }
    }
    Ok(bindings)
}

/// Builds [`Settings`] from layered sources.
///
/// Precedence, lowest first: defaults, settings file, `.env` file, process
/// environment.
#[derive(Debug, Clone)]
pub struct SettingsLoader {
    env_file: Option<PathBuf>,
    settings_file: Option<PathBuf>,
    vars: Option<Vec<(String, String)>>,
    project_root: Option<PathBuf>,
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsLoader {
    /// Creates a loader reading `.env` from the working directory.
    pub fn new() -> Self {
        Self {
            env_file: Some(PathBuf::from(".env")),
            settings_file: None,
            vars: None,
            project_root: None,
        }
    }

    /// Reads dotenv entries from `path` instead of `.env`.
    pub fn env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_file = Some(path.into());
        self
    }

    /// Skips the dotenv file.
    pub fn without_env_file(mut self) -> Self {
        self.env_file = None;
        self
    }

    /// Adds a settings file (format inferred from its extension).
    pub fn settings_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_file = Some(path.into());
        self
    }

    /// Uses the given variables instead of the process environment.
    pub fn vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.vars = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Sets the project root used when `PROJECT_ROOT` is not provided.
    pub fn project_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_root = Some(path.into());
        self
    }

    /// Loads and validates settings.
    pub fn load(self) -> Result<Settings, ConfigurationError> {
        let bindings = env_bindings()?;
        let variables = self.collect_variables()?;

        let mut builder = Config::builder();
        if let Some(path) = &self.settings_file {
            debug!(path = %path.display(), "Loading settings file");
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }
        if let Some(root) = &self.project_root {
            builder = builder.set_default("project_root", root.display().to_string())?;
        }

        for binding in &bindings {
            let Some(raw) = variables.get(&binding.env) else {
                continue;
            };
            builder = if binding.is_list() {
                builder.set_override(binding.path.as_str(), parse_list(&binding.path, raw)?)?
            } else {
                builder.set_override(binding.path.as_str(), raw.as_str())?
            };
        }

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        if settings.project_root.is_none() {
            let cwd = env::current_dir().map_err(|source| ConfigurationError::Io {
                path: PathBuf::from("."),
                source,
            })?;
            settings.project_root = Some(cwd);
        }

        settings.validate()?;
        debug!(
            environment = %settings.environment,
            smtp = %settings.email.address(),
            "Settings loaded"
        );
        Ok(settings)
    }

    /// Merges dotenv entries and environment variables, keyed by uppercased
    /// name. Environment entries win.
    fn collect_variables(&self) -> Result<HashMap<String, String>, ConfigurationError> {
        let mut variables = HashMap::new();

        if let Some(path) = self.env_file.as_deref().filter(|p| p.is_file()) {
            for (key, value) in read_env_file(path)? {
                variables.insert(key.to_ascii_uppercase(), value);
            }
        }

        let environment: Box<dyn Iterator<Item = (String, String)>> = match &self.vars {
            Some(vars) => Box::new(vars.clone().into_iter()),
            None => Box::new(env::vars()),
        };
        for (key, value) in environment {
            variables.insert(key.to_ascii_uppercase(), value);
        }

        Ok(variables)
    }
}

fn read_env_file(path: &Path) -> Result<Vec<(String, String)>, ConfigurationError> {
    let wrap = |source: dotenvy::Error| ConfigurationError::EnvFile {
        path: path.to_path_buf(),
        source,
    };
    dotenvy::from_path_iter(path)
        .map_err(wrap)?
        .map(|item| item.map_err(wrap))
        .collect()
}

/// Parses a list value given as a JSON array or a comma-separated string.
fn parse_list(field: &str, raw: &str) -> Result<Vec<String>, ConfigurationError> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| ConfigurationError::Invalid {
            field: field.to_string(),
            reason: format!("invalid JSON list: {e}"),
        });
    }
    Ok(trimmed
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect())
}
