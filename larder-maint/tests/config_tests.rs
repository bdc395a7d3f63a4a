//! Layered configuration: TOML file, LARDER_* environment, command line
//!
//! Tests that touch LARDER_* variables are #[serial].

use larder_maint::config::MaintConfig;
use larder_maint::normalize::TieBreak;
use larder_maint::{Mode, RunOverrides, StageName};
use serial_test::serial;
use std::env;
use std::path::PathBuf;
use tempfile::TempDir;

const ENV_KEYS: [&str; 6] = [
    "LARDER_CONFIG",
    "LARDER_URL",
    "LARDER_STAGES",
    "LARDER_MAX_ACTIONS",
    "LARDER_AUDIT_ONLY",
    "LARDER_CONFIDENCE_THRESHOLD",
];

fn clear_env() {
    for key in ENV_KEYS {
        env::remove_var(key);
    }
}

fn write_config(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("larder.toml");
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
#[serial]
fn test_toml_values_and_relative_input_files() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[service]
url = "http://mealie:9000/api"
api_key = "abc"

[pipeline]
stages = "foods, units"
max_actions_per_stage = 10
tie_break = "earliest-created"
checkpoint_dir = "state"

[stages.units]
mode = "apply"

[units]
alias_file = "unit_aliases.json"

[tools]
file = "seeds/tools.json"

[labels]
file = "labels.json"
replace = true

[logging]
level = "debug"
"#,
    );

    let config = MaintConfig::load(Some(&path)).unwrap();
    assert_eq!(config.service.url, "http://mealie:9000/api");
    assert_eq!(config.pipeline.stages, vec!["foods", "units"]);
    assert_eq!(config.pipeline.max_actions_per_stage, 10);
    assert_eq!(config.pipeline.tie_break, TieBreak::EarliestCreated);
    assert_eq!(config.pipeline.checkpoint_dir, PathBuf::from("state"));
    assert_eq!(config.units.alias_file, Some(dir.path().join("unit_aliases.json")));
    assert_eq!(config.tools.file, Some(dir.path().join("seeds/tools.json")));
    assert_eq!(config.labels.file, Some(dir.path().join("labels.json")));
    assert!(config.labels.replace);
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.mode_for(StageName::Units), Mode::Apply);
    assert_eq!(config.mode_for(StageName::Foods), Mode::Audit);
    assert_eq!(
        config.validate().unwrap(),
        vec![StageName::Foods, StageName::Units]
    );
}

#[test]
#[serial]
fn test_env_overrides_toml() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "[pipeline]\nstages = [\"foods\"]\nmax_actions_per_stage = 10\n",
    );
    env::set_var("LARDER_STAGES", "units,taxonomy");
    env::set_var("LARDER_MAX_ACTIONS", "3");
    env::set_var("LARDER_AUDIT_ONLY", "yes");
    env::set_var("LARDER_URL", "http://env-host/api");

    let config = MaintConfig::load(Some(&path)).unwrap();
    clear_env();

    assert_eq!(config.pipeline.stages, vec!["units", "taxonomy"]);
    assert_eq!(config.pipeline.max_actions_per_stage, 3);
    assert!(config.pipeline.audit_only);
    assert_eq!(config.service.url, "http://env-host/api");
}

#[test]
#[serial]
fn test_invalid_env_value_is_error() {
    clear_env();
    env::set_var("LARDER_CONFIDENCE_THRESHOLD", "high");
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "");

    let err = MaintConfig::load(Some(&path)).unwrap_err();
    clear_env();
    assert!(err.to_string().contains("LARDER_CONFIDENCE_THRESHOLD"));
}

#[test]
#[serial]
fn test_explicit_missing_config_is_error() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let err = MaintConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
    assert!(err.to_string().contains("nope.toml"));
}

#[test]
#[serial]
fn test_command_line_beats_env() {
    clear_env();
    env::set_var("LARDER_MAX_ACTIONS", "3");
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "");

    let mut config = MaintConfig::load(Some(&path)).unwrap();
    clear_env();
    config.apply_overrides(&RunOverrides {
        stages: Some(vec!["parse".to_string()]),
        max_actions: Some(0),
        workers: Some(8),
        ..Default::default()
    });

    assert_eq!(config.pipeline.max_actions_per_stage, 0);
    assert_eq!(config.pipeline.workers, 8);
    assert_eq!(config.validate().unwrap(), vec![StageName::Parse]);
}

#[test]
fn test_unknown_stage_mode_section_is_error() {
    let mut config = MaintConfig::default();
    config.stages.insert("labels".to_string(), Default::default());
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("labels"));
}
