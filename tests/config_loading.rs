use std::io::Write;

use stepflow::{AppConfig, ContextBudget, Priority, StepflowError};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[orchestrator]
max_stack_depth = 5
max_steps_per_run = 50
step_timeout_secs = 120
stop_grace_secs = 10
max_result_bytes = 65536

[budget]
total_chars = 1000
recent_chars = 600
older_chars = 200

[priority]
default_tier = "low"

[priority.roles]
architect = "critical"
summarizer = "low"

[priority.keywords]
high = ["^qa-", "audit"]

[storage]
data_dir = "/tmp/stepflow-test"
journal_db = "events.db"
runs_dir = "/var/stepflow/runs"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.orchestrator.max_stack_depth, 5);
    assert_eq!(config.orchestrator.max_steps_per_run, 50);
    assert_eq!(config.orchestrator.step_timeout_secs, 120);
    assert_eq!(config.orchestrator.stop_grace_secs, 10);
    assert_eq!(config.orchestrator.max_result_bytes, 65536);
    assert_eq!(config.orchestrator.event_bus_capacity, 1024);

    assert_eq!(config.budget.budget(), ContextBudget::new(1000, 600, 200));
    assert_eq!(config.budget.min_chars, 100);

    assert_eq!(config.priority.default_tier, Priority::Low);
    assert_eq!(config.priority.roles["architect"], Priority::Critical);
    assert_eq!(config.priority.keywords[&Priority::High], vec!["^qa-", "audit"]);
    assert!(!config.priority.keywords.contains_key(&Priority::Critical));

    assert_eq!(
        config.storage.journal_path(),
        std::path::PathBuf::from("/tmp/stepflow-test/events.db")
    );
    assert_eq!(
        config.storage.projection_path(),
        std::path::PathBuf::from("/tmp/stepflow-test/projection.db")
    );
    assert_eq!(
        config.storage.runs_path(),
        std::path::PathBuf::from("/var/stepflow/runs")
    );
}

#[test]
fn test_env_vars_expand_in_config() {
    std::env::set_var("STEPFLOW_TEST_DATA_DIR", "/srv/stepflow");
    let config = AppConfig::from_toml_str(
        r#"
[storage]
data_dir = "${STEPFLOW_TEST_DATA_DIR}"
"#,
    )
    .expect("parse config");
    std::env::remove_var("STEPFLOW_TEST_DATA_DIR");

    assert_eq!(
        config.storage.journal_path(),
        std::path::PathBuf::from("/srv/stepflow/journal.db")
    );
}

#[test]
fn test_missing_config_file() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/stepflow.toml")).unwrap_err();
    assert!(matches!(err, StepflowError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_config_is_rejected() {
    assert!(matches!(
        AppConfig::from_toml_str("[orchestrator]\nmax_stack_depth = \"deep\"\n"),
        Err(StepflowError::Config(_))
    ));
    assert!(matches!(
        AppConfig::from_toml_str("[budget]\nmin_chars = 500\nmax_chars = 100\n"),
        Err(StepflowError::Config(_))
    ));
    assert!(matches!(
        AppConfig::from_toml_str("[orchestrator]\nmax_steps_per_run = 0\n"),
        Err(StepflowError::Config(_))
    ));
}
