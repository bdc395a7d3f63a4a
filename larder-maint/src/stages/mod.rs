//! Pipeline stages
//!
//! Each stage fetches what it needs fresh from the service, asks its engine
//! for proposals, and hands them to [`StageRun::execute`] which plans against
//! the stage checkpoint and runs the executor.

pub mod audit;
pub mod categorize;
pub mod cookbooks;
pub mod entities;
pub mod labels;
pub mod parse;
pub mod taxonomy;

use crate::checkpoint::{CheckpointRecord, CheckpointSnapshot, CheckpointStore};
use crate::client::RecipeService;
use crate::config::MaintConfig;
use crate::error::StageError;
use crate::executor::ActionExecutor;
use crate::model::IngredientRef;
use crate::normalize::AliasMap;
use crate::planner::{plan, Mode, Outcome, Proposal};
use crate::report::StageReport;
use async_trait::async_trait;
use chrono::Utc;
use cookbooks::CookbookSpec;
use larder_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Parse,
    Foods,
    Units,
    Tools,
    Taxonomy,
    Categorize,
    Cookbooks,
    Labels,
    Audit,
}

impl StageName {
    pub const ALL: [StageName; 9] = [
        StageName::Parse,
        StageName::Foods,
        StageName::Units,
        StageName::Tools,
        StageName::Taxonomy,
        StageName::Categorize,
        StageName::Cookbooks,
        StageName::Labels,
        StageName::Audit,
    ];

    pub const DEFAULT_ORDER: [StageName; 7] = [
        StageName::Parse,
        StageName::Foods,
        StageName::Units,
        StageName::Taxonomy,
        StageName::Categorize,
        StageName::Cookbooks,
        StageName::Audit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Parse => "parse",
            StageName::Foods => "foods",
            StageName::Units => "units",
            StageName::Tools => "tools",
            StageName::Taxonomy => "taxonomy",
            StageName::Categorize => "categorize",
            StageName::Cookbooks => "cookbooks",
            StageName::Labels => "labels",
            StageName::Audit => "audit",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        StageName::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == wanted)
            .ok_or_else(|| {
                let valid: Vec<&str> = StageName::ALL.iter().map(|s| s.as_str()).collect();
                format!("unknown stage '{}' (valid: {})", s.trim(), valid.join(", "))
            })
    }
}

/// Files read once during preflight, shared by the stages that need them
#[derive(Debug, Clone, Default)]
pub struct StageInputs {
    pub aliases: AliasMap,
    pub category_seeds: Vec<String>,
    pub tag_seeds: Vec<String>,
    pub tool_seeds: Vec<String>,
    /// `None` when no cookbook file is configured
    pub cookbooks: Option<Vec<CookbookSpec>>,
    /// `None` when no labels file is configured
    pub labels: Option<Vec<String>>,
}

impl StageInputs {
    /// Load every input file the configured stages use
    ///
    /// Runs before any stage, so a malformed file fails the run with no
    /// write attempted.
    pub fn load(config: &MaintConfig, order: &[StageName]) -> Result<Self> {
        let uses = |stage: StageName| order.contains(&stage);
        let mut inputs = StageInputs::default();

        // The rules parser and the audit stage also key units
        if let Some(path) = &config.units.alias_file {
            if uses(StageName::Units) || uses(StageName::Parse) || uses(StageName::Audit) {
                inputs.aliases = AliasMap::load(path)?;
                tracing::info!(path = %path.display(), aliases = inputs.aliases.len(), "Loaded unit aliases");
            }
        }

        if uses(StageName::Taxonomy) {
            if let Some(path) = &config.taxonomy.categories_file {
                inputs.category_seeds = load_name_list(path)?;
            }
            if let Some(path) = &config.taxonomy.tags_file {
                inputs.tag_seeds = load_name_list(path)?;
            }
        }

        if uses(StageName::Tools) {
            if let Some(path) = &config.tools.file {
                inputs.tool_seeds = load_name_list(path)?;
            }
        }

        if uses(StageName::Cookbooks) {
            if let Some(path) = &config.cookbooks.file {
                inputs.cookbooks = Some(cookbooks::load_cookbook_specs(path)?);
            }
        }

        if uses(StageName::Labels) {
            if let Some(path) = &config.labels.file {
                inputs.labels = Some(labels::load_label_names(path)?);
            }
        }

        Ok(inputs)
    }
}

/// JSON array of names, either `["Dinner"]` or `[{"name": "Dinner"}]`
pub fn load_name_list(path: &Path) -> Result<Vec<String>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Item {
        Name(String),
        Object { name: String },
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let items: Vec<Item> = serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    Ok(items
        .into_iter()
        .map(|item| match item {
            Item::Name(name) | Item::Object { name } => name.trim().to_string(),
        })
        .filter(|name| !name.is_empty())
        .collect())
}

/// Everything a stage needs for one run
#[derive(Clone)]
pub struct StageContext {
    pub service: Arc<dyn RecipeService>,
    pub config: Arc<MaintConfig>,
    pub inputs: Arc<StageInputs>,
    pub mode: Mode,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    /// Run the stage to completion
    ///
    /// Per-item failures are reported in the returned report; `Err` means
    /// the stage as a whole could not run.
    async fn run(&self, ctx: &StageContext) -> std::result::Result<StageReport, StageError>;
}

/// Proposals and findings gathered by a stage before planning
#[derive(Debug, Default)]
pub struct StageWork {
    pub evaluated: usize,
    pub proposals: Vec<Proposal>,
    /// Items skipped by the stage itself because of their checkpoint
    pub already_processed: usize,
    pub findings: BTreeMap<String, u64>,
    pub notes: Vec<String>,
}

impl StageWork {
    pub fn finding(&mut self, key: impl Into<String>, value: u64) {
        *self.findings.entry(key.into()).or_insert(0) += value;
    }
}

/// An open stage checkpoint for the duration of one run
pub struct StageRun {
    stage: StageName,
    store: CheckpointStore,
    run_counter: i64,
    snapshot: CheckpointSnapshot,
}

impl StageRun {
    pub async fn open(ctx: &StageContext, stage: StageName) -> std::result::Result<Self, StageError> {
        let store = CheckpointStore::open(&ctx.config.pipeline.checkpoint_dir, stage.as_str())
            .await
            .map_err(|e| StageError::Checkpoint(e.to_string()))?;
        Self::with_store(stage, store).await
    }

    pub async fn with_store(
        stage: StageName,
        store: CheckpointStore,
    ) -> std::result::Result<Self, StageError> {
        let checkpoint_err = |e: Error| StageError::Checkpoint(e.to_string());
        let run_counter = store.begin_run().await.map_err(checkpoint_err)?;
        let snapshot = store.read_all().await.map_err(checkpoint_err)?;
        tracing::debug!(
            stage = %stage,
            run_counter,
            records = snapshot.len(),
            "Opened stage checkpoint"
        );
        Ok(Self {
            stage,
            store,
            run_counter,
            snapshot,
        })
    }

    pub fn snapshot(&self) -> &CheckpointSnapshot {
        &self.snapshot
    }

    /// Record an outcome decided outside the executor (parse review)
    pub async fn record(
        &self,
        item_id: &str,
        state_key: &str,
        outcome: Outcome,
    ) -> std::result::Result<(), StageError> {
        self.store
            .upsert(&CheckpointRecord {
                item_id: item_id.to_string(),
                state_key: state_key.to_string(),
                outcome,
                run_counter: self.run_counter,
                updated_at: Utc::now(),
            })
            .await
            .map_err(|e| StageError::Checkpoint(e.to_string()))
    }

    /// Plan the proposals against the checkpoint and execute them
    pub async fn execute(
        self,
        ctx: &StageContext,
        work: StageWork,
        known_foods: Vec<IngredientRef>,
    ) -> std::result::Result<StageReport, StageError> {
        let pipeline = &ctx.config.pipeline;
        let planned = plan(
            work.proposals,
            ctx.mode,
            pipeline.max_actions_per_stage,
            &self.snapshot,
        );

        let mut report = StageReport::new(self.stage, ctx.mode);
        report.counts.evaluated = work.evaluated;
        report.counts.proposed = planned.actions.len();
        report.counts.already_processed = work.already_processed + planned.already_processed;
        report.findings = work.findings;
        report.notes = work.notes;

        tracing::info!(
            stage = %self.stage,
            mode = %ctx.mode,
            planned = planned.actions.len(),
            deferred = planned.deferred.len(),
            already_processed = report.counts.already_processed,
            "Plan ready"
        );

        let execution = {
            let executor = ActionExecutor::new(
                ctx.service.as_ref(),
                &self.store,
                self.run_counter,
                ctx.cancel.clone(),
            )
            .with_workers(pipeline.workers)
            .with_halt_on_failure(!pipeline.continue_on_error)
            .with_known_foods(known_foods);
            executor.execute_plan(&planned).await
        };
        self.store.close().await;

        report.absorb_execution(execution?);
        Ok(report)
    }
}

/// Build the stage implementation for a name
pub fn build_stage(
    name: StageName,
    categorizer: Option<Arc<dyn categorize::Categorizer>>,
) -> Box<dyn Stage> {
    use crate::model::EntityKind;
    match name {
        StageName::Parse => Box::new(parse::ParseStage),
        StageName::Foods => Box::new(entities::DedupStage::new(name, EntityKind::Food)),
        StageName::Units => Box::new(entities::DedupStage::new(name, EntityKind::Unit)),
        StageName::Tools => Box::new(entities::DedupStage::new(name, EntityKind::Tool)),
        StageName::Taxonomy => Box::new(taxonomy::TaxonomyStage),
        StageName::Categorize => Box::new(categorize::CategorizeStage::new(
            categorizer.unwrap_or_else(|| Arc::new(categorize::KeywordCategorizer)),
        )),
        StageName::Cookbooks => Box::new(cookbooks::CookbookStage),
        StageName::Labels => Box::new(labels::LabelStage),
        StageName::Audit => Box::new(audit::AuditStage),
    }
}
