//! Maintenance configuration
//!
//! Resolution priority: command line → `LARDER_*` environment → TOML file →
//! compiled default. Everything is validated once, before any stage runs,
//! so a bad value never leaves the service half-maintained.

use crate::client::{RetryPolicy, ServiceSettings};
use crate::parser::is_known_strategy;
use crate::normalize::TieBreak;
use crate::planner::Mode;
use crate::stages::categorize::TargetMode;
use crate::stages::StageName;
use larder_common::config::{
    env_bool, env_parse, env_string, load_toml_config, locate_config_file, LoggingConfig,
};
use larder_common::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Accept `"parse,foods"` as well as `["parse", "foods"]`
fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::One(text) => split_list(&text),
        Raw::Many(items) => items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    })
}

/// Comma or whitespace separated list
pub fn split_list(text: &str) -> Vec<String> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub url: String,
    pub api_key: String,
    pub timeout_seconds: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub requests_per_second: u32,
    pub page_size: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            timeout_seconds: 30,
            max_attempts: 4,
            backoff_base_ms: 400,
            backoff_max_ms: 8000,
            requests_per_second: 10,
            page_size: 500,
        }
    }
}

impl ServiceConfig {
    /// Client settings; url and api key are required here
    pub fn settings(&self) -> Result<ServiceSettings> {
        if self.url.trim().is_empty() {
            return Err(Error::Config(
                "service url is not set ([service] url or LARDER_URL)".into(),
            ));
        }
        if self.api_key.trim().is_empty() {
            return Err(Error::Config(
                "service api key is not set ([service] api_key or LARDER_API_KEY)".into(),
            ));
        }
        if self.requests_per_second == 0 || self.page_size == 0 || self.timeout_seconds == 0 {
            return Err(Error::Config(
                "timeout_seconds, requests_per_second and page_size must be positive".into(),
            ));
        }
        Ok(ServiceSettings {
            base_url: self.url.trim().to_string(),
            api_key: self.api_key.trim().to_string(),
            timeout: Duration::from_secs(self.timeout_seconds),
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                base_backoff: Duration::from_millis(self.backoff_base_ms),
                max_backoff: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
            },
            requests_per_second: self.requests_per_second,
            page_size: self.page_size,
        })
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    #[serde(deserialize_with = "string_or_list")]
    pub stages: Vec<String>,
    pub continue_on_error: bool,
    pub audit_only: bool,
    pub max_actions_per_stage: i64,
    pub workers: usize,
    pub deadline_seconds: Option<u64>,
    pub checkpoint_dir: PathBuf,
    pub report_dir: PathBuf,
    pub tie_break: TieBreak,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: StageName::DEFAULT_ORDER
                .iter()
                .map(|s| s.to_string())
                .collect(),
            continue_on_error: false,
            audit_only: false,
            max_actions_per_stage: 250,
            workers: 4,
            deadline_seconds: None,
            checkpoint_dir: PathBuf::from("cache/maintenance"),
            report_dir: PathBuf::from("reports"),
            tie_break: TieBreak::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct StageConfig {
    pub mode: Mode,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ParserConfig {
    pub confidence_threshold: f64,
    #[serde(deserialize_with = "string_or_list")]
    pub strategies: Vec<String>,
    pub force_parser: Option<String>,
    pub max_recipes: Option<usize>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.80,
            strategies: vec!["nlp".to_string(), "openai".to_string()],
            force_parser: None,
            max_recipes: None,
        }
    }
}

impl ParserConfig {
    /// Strategy chain to run; a forced parser is used exclusively
    pub fn effective_strategies(&self) -> Vec<String> {
        match &self.force_parser {
            Some(forced) => vec![forced.clone()],
            None => self.strategies.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FoodsConfig {
    pub allow_fuzzy: bool,
    pub fuzzy_threshold: f64,
}

impl Default for FoodsConfig {
    fn default() -> Self {
        Self {
            allow_fuzzy: false,
            fuzzy_threshold: 0.92,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct UnitsConfig {
    pub alias_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaxonomyConfig {
    pub categories_file: Option<PathBuf>,
    pub tags_file: Option<PathBuf>,
    pub tag_max_name_length: usize,
    pub delete_unused_noisy: bool,
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        Self {
            categories_file: None,
            tags_file: None,
            tag_max_name_length: 24,
            delete_unused_noisy: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct CategorizeConfig {
    pub target_mode: TargetMode,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct CookbooksConfig {
    pub file: Option<PathBuf>,
    pub replace: bool,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolsConfig {
    /// Tool names to create when missing
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LabelsConfig {
    pub file: Option<PathBuf>,
    pub replace: bool,
}

/// Complete maintenance configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaintConfig {
    pub service: ServiceConfig,
    pub pipeline: PipelineConfig,
    pub stages: BTreeMap<String, StageConfig>,
    pub parser: ParserConfig,
    pub foods: FoodsConfig,
    pub units: UnitsConfig,
    pub tools: ToolsConfig,
    pub taxonomy: TaxonomyConfig,
    pub categorize: CategorizeConfig,
    pub cookbooks: CookbooksConfig,
    pub labels: LabelsConfig,
    pub logging: LoggingConfig,
}

/// Values given on the command line; `None` leaves lower layers in place
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOverrides {
    pub stages: Option<Vec<String>>,
    pub audit_only: bool,
    pub continue_on_error: bool,
    pub max_actions: Option<i64>,
    pub workers: Option<usize>,
    pub deadline_seconds: Option<u64>,
}

impl MaintConfig {
    /// Locate and load the TOML file, then apply environment overrides
    ///
    /// Relative input file paths inside the TOML are resolved against the
    /// file's directory; checkpoint and report dirs stay relative to the
    /// working directory.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let mut config = match locate_config_file(cli_path) {
            Some(path) => {
                let loaded: Option<MaintConfig> = load_toml_config(&path)?;
                match (loaded, cli_path) {
                    (Some(mut config), _) => {
                        if let Some(base) = path.parent() {
                            config.resolve_paths(base);
                        }
                        config
                    }
                    // An explicit --config that does not exist is a mistake
                    (None, Some(_)) => {
                        return Err(Error::Config(format!(
                            "config file {} does not exist",
                            path.display()
                        )))
                    }
                    (None, None) => MaintConfig::default(),
                }
            }
            None => {
                tracing::info!("No config file found, using defaults");
                MaintConfig::default()
            }
        };
        config.apply_env()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        use larder_common::config::resolve_relative;
        let fix_opt = |path: &mut Option<PathBuf>| {
            if let Some(p) = path.as_mut() {
                let resolved = resolve_relative(base, p);
                *p = resolved;
            }
        };
        fix_opt(&mut self.units.alias_file);
        fix_opt(&mut self.taxonomy.categories_file);
        fix_opt(&mut self.taxonomy.tags_file);
        fix_opt(&mut self.cookbooks.file);
        fix_opt(&mut self.tools.file);
        fix_opt(&mut self.labels.file);
    }

    /// Apply `LARDER_*` environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_string("LARDER_URL") {
            self.service.url = url;
        }
        if let Some(key) = env_string("LARDER_API_KEY") {
            self.service.api_key = key;
        }
        if let Some(stages) = env_string("LARDER_STAGES") {
            self.pipeline.stages = split_list(&stages);
        }
        if let Some(audit_only) = env_bool("LARDER_AUDIT_ONLY")? {
            self.pipeline.audit_only = audit_only;
        }
        if let Some(continue_on_error) = env_bool("LARDER_CONTINUE_ON_ERROR")? {
            self.pipeline.continue_on_error = continue_on_error;
        }
        if let Some(cap) = env_parse::<i64>("LARDER_MAX_ACTIONS")? {
            self.pipeline.max_actions_per_stage = cap;
        }
        if let Some(workers) = env_parse::<usize>("LARDER_WORKERS")? {
            self.pipeline.workers = workers;
        }
        if let Some(dir) = env_string("LARDER_CHECKPOINT_DIR") {
            self.pipeline.checkpoint_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_string("LARDER_REPORT_DIR") {
            self.pipeline.report_dir = PathBuf::from(dir);
        }
        if let Some(threshold) = env_parse::<f64>("LARDER_CONFIDENCE_THRESHOLD")? {
            self.parser.confidence_threshold = threshold;
        }
        if let Some(strategies) = env_string("LARDER_PARSER_STRATEGIES") {
            self.parser.strategies = split_list(&strategies);
        }
        if let Some(forced) = env_string("LARDER_FORCE_PARSER") {
            self.parser.force_parser = Some(forced);
        }
        Ok(())
    }

    /// Apply command-line values (highest priority)
    pub fn apply_overrides(&mut self, overrides: &RunOverrides) {
        if let Some(stages) = &overrides.stages {
            self.pipeline.stages = stages.clone();
        }
        if overrides.audit_only {
            self.pipeline.audit_only = true;
        }
        if overrides.continue_on_error {
            self.pipeline.continue_on_error = true;
        }
        if let Some(cap) = overrides.max_actions {
            self.pipeline.max_actions_per_stage = cap;
        }
        if let Some(workers) = overrides.workers {
            self.pipeline.workers = workers;
        }
        if let Some(deadline) = overrides.deadline_seconds {
            self.pipeline.deadline_seconds = Some(deadline);
        }
    }

    /// Check every value and return the resolved stage order
    pub fn validate(&self) -> Result<Vec<StageName>> {
        let order = self.stage_order()?;

        for name in self.stages.keys() {
            name.parse::<StageName>()
                .map_err(|e| Error::Config(format!("[stages.{}]: {}", name, e)))?;
        }

        if self.pipeline.max_actions_per_stage < 0 {
            return Err(Error::Config(format!(
                "max_actions_per_stage must not be negative (got {})",
                self.pipeline.max_actions_per_stage
            )));
        }
        if self.pipeline.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }

        let threshold = self.parser.confidence_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(Error::Config(format!(
                "confidence_threshold must be in (0, 1] (got {})",
                threshold
            )));
        }

        let strategies = self.parser.effective_strategies();
        if strategies.is_empty() {
            return Err(Error::Config("parser strategy list is empty".into()));
        }
        if let Some(unknown) = strategies.iter().find(|s| !is_known_strategy(s)) {
            return Err(Error::Config(format!("unknown parser strategy '{}'", unknown)));
        }

        let fuzzy = self.foods.fuzzy_threshold;
        if !(0.0..=1.0).contains(&fuzzy) {
            return Err(Error::Config(format!(
                "fuzzy_threshold must be in [0, 1] (got {})",
                fuzzy
            )));
        }

        Ok(order)
    }

    /// Configured stage order, with unknown or repeated names rejected
    pub fn stage_order(&self) -> Result<Vec<StageName>> {
        if self.pipeline.stages.is_empty() {
            return Err(Error::Config("stage list is empty".into()));
        }
        let mut seen = HashSet::new();
        let mut order = Vec::with_capacity(self.pipeline.stages.len());
        for raw in &self.pipeline.stages {
            let stage: StageName = raw.parse().map_err(Error::Config)?;
            if !seen.insert(stage) {
                return Err(Error::Config(format!("stage '{}' listed twice", stage)));
            }
            order.push(stage);
        }
        Ok(order)
    }

    /// Effective mode of a stage; audit-only wins over any apply flag
    pub fn mode_for(&self, stage: StageName) -> Mode {
        if self.pipeline.audit_only {
            return Mode::Audit;
        }
        self.stages
            .get(stage.as_str())
            .map(|s| s.mode)
            .unwrap_or_default()
    }

    pub fn set_mode(&mut self, stage: StageName, mode: Mode) {
        self.stages
            .entry(stage.as_str().to_string())
            .or_default()
            .mode = mode;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MaintConfig::default();
        assert_eq!(config.pipeline.max_actions_per_stage, 250);
        assert_eq!(config.pipeline.workers, 4);
        assert!(!config.pipeline.continue_on_error);
        assert_eq!(config.parser.effective_strategies(), vec!["nlp", "openai"]);
        assert_eq!(
            config.validate().unwrap(),
            StageName::DEFAULT_ORDER.to_vec()
        );
        assert_eq!(config.mode_for(StageName::Foods), Mode::Audit);
    }

    #[test]
    fn test_toml_sections() {
        let config: MaintConfig = toml::from_str(
            r#"
            [service]
            url = "http://mealie:9000/api"
            api_key = "secret"

            [pipeline]
            stages = "foods, units"
            max_actions_per_stage = 10
            tie_break = "earliest-created"

            [stages.foods]
            mode = "apply"

            [parser]
            strategies = ["rules", "nlp"]
            confidence_threshold = 0.9

            [categorize]
            target_mode = "missing-tags"

            [labels]
            file = "labels.json"
            replace = true
            "#,
        )
        .unwrap();

        assert_eq!(
            config.validate().unwrap(),
            vec![StageName::Foods, StageName::Units]
        );
        assert_eq!(config.mode_for(StageName::Foods), Mode::Apply);
        assert_eq!(config.mode_for(StageName::Units), Mode::Audit);
        assert_eq!(config.pipeline.tie_break, TieBreak::EarliestCreated);
        assert_eq!(config.categorize.target_mode, TargetMode::MissingTags);
        assert_eq!(config.service.settings().unwrap().page_size, 500);
        assert_eq!(config.labels.file, Some(PathBuf::from("labels.json")));
        assert!(config.labels.replace);
        assert_eq!(config.tools.file, None);
    }

    #[test]
    fn test_audit_only_overrides_apply() {
        let mut config = MaintConfig::default();
        config.set_mode(StageName::Foods, Mode::Apply);
        config.apply_overrides(&RunOverrides {
            audit_only: true,
            ..Default::default()
        });
        assert_eq!(config.mode_for(StageName::Foods), Mode::Audit);
    }

    #[test]
    fn test_validation_errors() {
        let check = |mutate: &dyn Fn(&mut MaintConfig), needle: &str| {
            let mut config = MaintConfig::default();
            mutate(&mut config);
            let err = config.validate().unwrap_err().to_string();
            assert!(err.contains(needle), "{} should mention {}", err, needle);
        };

        check(&|c| c.pipeline.stages = vec!["foods".into(), "bogus".into()], "bogus");
        check(&|c| c.pipeline.stages.clear(), "empty");
        check(&|c| c.pipeline.stages = vec!["foods".into(), "foods".into()], "twice");
        check(&|c| c.pipeline.max_actions_per_stage = -1, "negative");
        check(&|c| c.pipeline.workers = 0, "workers");
        check(&|c| c.parser.confidence_threshold = 0.0, "confidence_threshold");
        check(&|c| c.parser.confidence_threshold = 1.5, "confidence_threshold");
        check(&|c| c.parser.strategies = vec!["magic".into()], "magic");
        check(&|c| c.parser.force_parser = Some("gpt".into()), "gpt");
        check(
            &|c| {
                c.stages.insert("nope".into(), StageConfig::default());
            },
            "nope",
        );
    }

    #[test]
    fn test_zero_cap_is_valid() {
        let mut config = MaintConfig::default();
        config.pipeline.max_actions_per_stage = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_service_settings_require_url_and_key() {
        let mut service = ServiceConfig::default();
        assert!(service.settings().is_err());
        service.url = "http://localhost:9000/api".into();
        assert!(service.settings().is_err());
        service.api_key = "k".into();
        let settings = service.settings().unwrap();
        assert_eq!(settings.timeout, Duration::from_secs(30));
        assert_eq!(settings.retry.max_attempts, 4);
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("parse, foods  units,"), vec!["parse", "foods", "units"]);
    }
}
