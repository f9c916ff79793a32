use std::path::Path;

use judged::{Config, ConfigError};

#[test]
fn test_example_config_validates() {
    let config = Config::example().expect("Failed to load example config");
    config.validate().expect("example config is invalid");

    for id in ["c", "cpp17", "rust", "python3"] {
        assert!(config.languages.contains_key(id), "missing language {id}");
    }
    assert!(!config.get_language("python3").unwrap().is_compiled());
}

#[test]
fn test_load_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("judged.toml");
    std::fs::write(
        &path,
        r#"
        slots = 2

        [cache]
        root = "/tmp/judged-cache"
        budget_bytes = 4096
        safety_margin_bytes = 1024

        [languages.sh]
        name = "Shell"
        source_name = "main.sh"
        execute = ["/bin/sh", "{src_path}"]
        "#,
    )
    .unwrap();

    let config = Config::from_file(&path).expect("Failed to load config");
    assert_eq!(config.slot_count(), 2);
    assert_eq!(config.cache.budget_bytes, 4096);
    assert!(config.languages.contains_key("sh"));
}

#[test]
fn test_missing_config_file() {
    let result = Config::from_file(Path::new("/nonexistent/judged.toml"));
    assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
}

#[test]
fn test_invalid_cache_margin() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("judged.toml");
    std::fs::write(
        &path,
        "[cache]\nroot = \"/tmp/c\"\nbudget_bytes = 100\nsafety_margin_bytes = 100\n",
    )
    .unwrap();
    assert!(Config::from_file(&path).is_err());
}
