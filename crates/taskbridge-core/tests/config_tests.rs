//! Configuration management tests
//!
//! Tests for ConfigManager loading and saving config files.

use std::fs;
use std::time::Duration;

use taskbridge_core::config::{Config, ConfigManager};
use taskbridge_core::Error;
use tempfile::TempDir;

/// Create a temp directory for config tests
fn setup_config_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp dir")
}

mod config_manager_tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = setup_config_dir();
        let manager = ConfigManager::with_path(dir.path().join("config.toml")).unwrap();

        assert_eq!(manager.config().render.debounce(), Duration::from_secs(2));
        assert_eq!(manager.config().coalesce.window(), Duration::from_millis(1500));
        assert_eq!(manager.config().interaction.plan_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_load_existing_config() {
        let dir = setup_config_dir();
        let config_path = dir.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[render]
debounce_ms = 500
max_message_len = 1000

[interaction]
question_timeout_secs = 30

[agent]
command = "my-agent"
args = ["--json"]
"#,
        )
        .unwrap();

        let manager = ConfigManager::with_path(config_path).unwrap();
        let config = manager.config();
        assert_eq!(config.render.debounce_ms, 500);
        assert_eq!(config.render.max_message_len, 1000);
        // Unset fields keep their defaults
        assert_eq!(config.render.max_rate_limit_retries, 3);
        assert_eq!(config.interaction.question_timeout(), Duration::from_secs(30));
        assert_eq!(config.interaction.permission_timeout(), Duration::from_secs(300));
        assert_eq!(config.agent.command, "my-agent");
        assert_eq!(config.agent.args, vec!["--json".to_string()]);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = setup_config_dir();
        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, "[coalesce]\nwindow_ms = 0\n").unwrap();

        assert!(matches!(ConfigManager::with_path(config_path), Err(Error::Config(_))));
    }

    #[test]
    fn test_malformed_toml_is_rejected() {
        let dir = setup_config_dir();
        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, "[render\ndebounce_ms = ").unwrap();

        let err = ConfigManager::with_path(config_path).err().unwrap();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_save_config() {
        let dir = setup_config_dir();
        let config_path = dir.path().join("nested").join("config.toml");

        let mut manager = ConfigManager::with_path(config_path.clone()).unwrap();
        manager.config_mut().coalesce.window_ms = 800;
        manager.config_mut().session.storage_dir = Some(dir.path().join("sessions"));
        manager.save().unwrap();
        assert!(config_path.exists());

        let reloaded = ConfigManager::with_path(config_path).unwrap();
        assert_eq!(reloaded.config().coalesce.window_ms, 800);
        assert_eq!(reloaded.config().session.storage_dir(), dir.path().join("sessions"));
    }

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }
}
