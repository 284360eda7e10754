//! Tests for settings loading.

use eatsmart_core::config::SettingsLoader;
use eatsmart_core::ConfigurationError;
use secrecy::ExposeSecret;
use std::fs;
use std::time::Duration;

fn loader(root: &std::path::Path) -> SettingsLoader {
    SettingsLoader::new().without_env_file().project_root(root)
}

#[test]
fn test_defaults_without_any_source() {
    let dir = tempfile::tempdir().unwrap();
    let settings = loader(dir.path()).vars(Vec::<(String, String)>::new()).load().unwrap();

    assert_eq!(settings.email.smtp_server, "smtp.gmail.com");
    assert_eq!(settings.email.smtp_port, 587);
    assert!(settings.email.smtp_use_tls);
    assert_eq!(settings.email.smtp_timeout, Duration::from_secs(30));
    assert_eq!(settings.mcp.port, 3000);
    assert_eq!(settings.project_root(), dir.path());
    assert!(settings.is_development());
}

#[test]
fn test_environment_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let settings = loader(dir.path())
        .vars([
            ("EMAIL_SMTP_SERVER", "mail.eatsmart.app"),
            ("EMAIL_SMTP_PORT", "2525"),
            ("email_smtp_use_tls", "false"),
            ("EMAIL_SMTP_TIMEOUT", "5s"),
            ("EMAIL_USERNAME", "bot@eatsmart.app"),
            ("EMAIL_PASSWORD", "hunter2"),
            ("ENVIRONMENT", "Production"),
            ("RAG_SIMILARITY_THRESHOLD", "0.5"),
            ("VECTOR_DB_CHROMADB_PATH", "/var/lib/chroma"),
        ])
        .load()
        .unwrap();

    assert_eq!(settings.email.smtp_server, "mail.eatsmart.app");
    assert_eq!(settings.email.smtp_port, 2525);
    assert!(!settings.email.smtp_use_tls);
    assert_eq!(settings.email.smtp_timeout, Duration::from_secs(5));
    assert_eq!(
        settings.email.password.as_ref().map(|p| p.expose_secret().as_str()),
        Some("hunter2")
    );
    assert!(settings.email.has_credentials());
    assert!(settings.is_production());
    assert_eq!(settings.rag.similarity_threshold, 0.5);
    assert_eq!(settings.vector_db.chromadb_path, "/var/lib/chroma");
}

#[test]
fn test_unparsable_port_fails() {
    let dir = tempfile::tempdir().unwrap();
    let result = loader(dir.path())
        .vars([("EMAIL_SMTP_PORT", "not-a-number")])
        .load();
    assert!(matches!(result, Err(ConfigurationError::Source(_))));
}

#[test]
fn test_unparsable_bool_fails() {
    let dir = tempfile::tempdir().unwrap();
    let result = loader(dir.path())
        .vars([("EMAIL_SMTP_USE_TLS", "maybe")])
        .load();
    assert!(result.is_err());
}

#[test]
fn test_semantic_validation() {
    let dir = tempfile::tempdir().unwrap();

    for (key, value, field) in [
        ("LOG_LEVEL", "LOUD", "log_level"),
        ("LOG_ROTATION_SIZE", "huge", "log_rotation_size"),
        ("IMAGE_MAX_SIZE", "1024", "image.max_size"),
        ("RAG_SIMILARITY_THRESHOLD", "1.5", "rag.similarity_threshold"),
    ] {
        match loader(dir.path()).vars([(key, value)]).load() {
            Err(ConfigurationError::Invalid { field: actual, .. }) => assert_eq!(actual, field),
            other => panic!("{key}={value}: expected invalid {field}, got {other:?}"),
        }
    }

    let result = loader(dir.path()).vars([("EMAIL_SMTP_PORT", "0")]).load();
    assert!(matches!(result, Err(ConfigurationError::Invalid { .. })));
}

#[test]
fn test_list_values() {
    let dir = tempfile::tempdir().unwrap();
    let settings = loader(dir.path())
        .vars([
            ("CORS_ORIGINS", r#"["https://eatsmart.app"]"#),
            ("IMAGE_SUPPORTED_FORMATS", "jpg,png,gif"),
        ])
        .load()
        .unwrap();

    assert_eq!(settings.cors_origins, vec!["https://eatsmart.app"]);
    assert_eq!(settings.image.supported_formats, vec!["jpg", "png", "gif"]);
}

#[test]
fn test_env_file_is_below_environment() {
    let dir = tempfile::tempdir().unwrap();
    let env_file = dir.path().join(".env");
    fs::write(
        &env_file,
        "EMAIL_SMTP_SERVER=smtp.from-dotenv.test\nEMAIL_FROM_NAME=\"Dotenv Sender\"\n",
    )
    .unwrap();

    let settings = SettingsLoader::new()
        .env_file(&env_file)
        .project_root(dir.path())
        .vars([("EMAIL_SMTP_SERVER", "smtp.from-env.test")])
        .load()
        .unwrap();

    assert_eq!(settings.email.smtp_server, "smtp.from-env.test");
    assert_eq!(settings.email.from_name, "Dotenv Sender");
}

#[test]
fn test_missing_env_file_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let settings = SettingsLoader::new()
        .env_file(dir.path().join("absent.env"))
        .project_root(dir.path())
        .vars(Vec::<(String, String)>::new())
        .load()
        .unwrap();
    assert_eq!(settings.email.smtp_port, 587);
}

#[test]
fn test_settings_file_layers_under_environment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.toml");
    fs::write(
        &path,
        r#"
log_level = "DEBUG"

[email]
smtp_server = "smtp.from-file.test"
smtp_port = 465

[nutrition.health_score_weights]
sugar = 0.4
salt = 0.2
fat = 0.2
additives = 0.2
"#,
    )
    .unwrap();

    let settings = loader(dir.path())
        .settings_file(&path)
        .vars([("EMAIL_SMTP_PORT", "2525")])
        .load()
        .unwrap();

    assert_eq!(settings.log_level, "DEBUG");
    assert_eq!(settings.email.smtp_server, "smtp.from-file.test");
    assert_eq!(settings.email.smtp_port, 2525);
    assert_eq!(settings.nutrition.health_score_weights.get("sugar"), Some(&0.4));
}

#[test]
fn test_missing_settings_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let result = loader(dir.path())
        .settings_file(dir.path().join("absent.toml"))
        .vars(Vec::<(String, String)>::new())
        .load();
    assert!(matches!(result, Err(ConfigurationError::Source(_))));
}

#[test]
fn test_directories_are_created_once() {
    let dir = tempfile::tempdir().unwrap();
    let settings = loader(dir.path()).vars(Vec::<(String, String)>::new()).load().unwrap();

    let first = settings.data_dir().unwrap();
    let second = settings.data_dir().unwrap();
    assert_eq!(first, second);
    assert!(first.is_dir());

    let logs = settings.logs_dir().unwrap();
    assert_eq!(logs, settings.logs_dir().unwrap());
    assert_eq!(logs, dir.path().join("logs"));
    assert!(settings.log_file().starts_with(dir.path()));
}
