//! Ingredient parse stage
//!
//! Recipes without structured ingredients are fetched, their lines run
//! through the strategy chain, and fully accepted recipes become patch
//! actions. Anything else lands in `review_low_confidence.json` and is
//! checkpointed as rejected or exhausted until its text changes. A recipe
//! the parser could not answer for (service outage) is an item failure and
//! is not checkpointed.

use super::{Stage, StageContext, StageName, StageRun, StageWork};
use crate::error::StageError;
use crate::model::{EntityKind, IngredientRef, Recipe};
use crate::parser::{
    is_known_strategy, parse_recipe, parse_state_key, sanitized_lines, LineParse, ParseStrategy,
    RecipeParse, RecipeParseOutcome, RuleParser, ServiceParser, StrategyChain, RULES_STRATEGY,
};
use crate::planner::{ActionPayload, Mode, Outcome, Proposal};
use crate::report::{ItemFailure, StageReport};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

pub const REVIEW_FILE_NAME: &str = "review_low_confidence.json";
pub const SUCCESS_LOG_NAME: &str = "parsed_success.log";

/// One recipe held back for manual review
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewEntry {
    pub recipe_id: String,
    pub slug: String,
    pub name: String,
    pub outcome: Outcome,
    pub threshold: f64,
    pub dropped_lines: usize,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub suspicious: BTreeMap<String, usize>,
    pub lines: Vec<LineParse>,
}

pub struct ParseStage;

#[async_trait]
impl Stage for ParseStage {
    fn name(&self) -> StageName {
        StageName::Parse
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport, StageError> {
        if ctx.cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let chain = build_chain(ctx).await?;
        tracing::info!(
            strategies = ?chain.names(),
            threshold = chain.threshold(),
            "Parser chain ready"
        );

        let mut candidates = ctx.service.recipes_needing_parse().await?;
        candidates.sort_by(|a, b| a.slug.cmp(&b.slug));
        let budget = ctx.config.parser.max_recipes;

        let run = StageRun::open(ctx, StageName::Parse).await?;
        let mut work = StageWork::default();
        let mut review = Vec::new();
        let mut item_failures = Vec::new();
        let mut still_suppressed: HashSet<String> = HashSet::new();
        let mut recipes_by_id: HashMap<String, (String, String)> = HashMap::new();

        // Only recipes that reach the strategy chain count toward
        // `max_recipes`, so suppressed ones never starve the rest
        let workers = ctx.config.pipeline.workers.max(1);
        let service = ctx.service.as_ref();
        let mut chained = 0usize;
        let mut next = 0usize;
        while next < candidates.len() {
            let room = budget.map_or(workers, |limit| limit.saturating_sub(chained));
            if room == 0 {
                break;
            }
            let end = (next + room.min(workers)).min(candidates.len());
            let batch = &candidates[next..end];
            next = end;

            // Summaries may omit ingredients; fetch each recipe in full
            let pending: Vec<_> = batch
                .iter()
                .map(|summary| async move {
                    let result = service.get_recipe(&summary.slug).await.map_err(StageError::from);
                    (summary.id.clone(), result)
                })
                .collect();
            let fetched: Vec<(String, Result<Recipe, StageError>)> = stream::iter(pending)
                .buffered(workers)
                .collect()
                .await;

            for (recipe_id, fetched) in fetched {
                if ctx.cancel.is_cancelled() {
                    return Err(StageError::Cancelled);
                }
                work.evaluated += 1;
                let recipe = match fetched {
                    Ok(recipe) => recipe,
                    Err(err) => {
                        tracing::warn!(recipe_id = %recipe_id, error = %err, "Recipe fetch failed");
                        item_failures.push(ItemFailure {
                            item_id: recipe_id,
                            description: "fetch recipe".to_string(),
                            error: err.to_string(),
                        });
                        continue;
                    }
                };

                if let Some((lines, _)) = sanitized_lines(&recipe) {
                    let key = parse_state_key(&recipe.id, &lines);
                    if run.snapshot().suppresses(&recipe.id, &key, ctx.mode) {
                        work.already_processed += 1;
                        still_suppressed.insert(recipe.id.clone());
                        continue;
                    }
                }

                let parsed = match parse_recipe(&chain, &recipe).await {
                    RecipeParseOutcome::AlreadyParsed => {
                        work.finding("already_parsed", 1);
                        continue;
                    }
                    RecipeParseOutcome::Empty { dropped } => {
                        work.finding("empty_after_sanitize", 1);
                        work.finding("dropped_lines", dropped as u64);
                        continue;
                    }
                    RecipeParseOutcome::Parsed(parsed) => parsed,
                };
                chained += 1;

                // An outage says nothing about the text; retry next run
                let errors = parsed.strategy_errors();
                if !errors.is_empty() {
                    tracing::warn!(slug = %parsed.slug, errors = ?errors, "Parser unavailable for recipe");
                    item_failures.push(ItemFailure {
                        item_id: parsed.recipe_id.clone(),
                        description: format!("parse {}", parsed.slug),
                        error: errors.join("; "),
                    });
                    continue;
                }

                let accepted = parsed.lines.iter().filter(|l| l.is_accepted()).count();
                work.finding("lines_accepted", accepted as u64);
                work.finding("lines_rejected", parsed.count_state(false) as u64);
                work.finding("lines_exhausted", parsed.count_state(true) as u64);
                work.finding("dropped_lines", parsed.dropped_lines as u64);

                match classify(&parsed) {
                    None => {
                        recipes_by_id.insert(
                            parsed.recipe_id.clone(),
                            (parsed.slug.clone(), parsed.name.clone()),
                        );
                        work.proposals.push(patch_proposal(&parsed));
                    }
                    Some(outcome) => {
                        run.record(&parsed.recipe_id, &parsed.state_key(), outcome)
                            .await?;
                        work.finding(format!("recipes_{}", outcome), 1);
                        review.push(ReviewEntry {
                            recipe_id: parsed.recipe_id.clone(),
                            slug: parsed.slug.clone(),
                            name: parsed.name.clone(),
                            outcome,
                            threshold: chain.threshold(),
                            dropped_lines: parsed.dropped_lines,
                            suspicious: parsed.suspicious_reasons(),
                            lines: parsed.lines,
                        });
                    }
                }
            }
        }

        let deferred = candidates.len() - next;
        if deferred > 0 {
            work.finding("recipes_deferred", deferred as u64);
            tracing::info!(deferred, "max_recipes reached, remaining recipes left for a later run");
        }

        let known_foods = if ctx.mode == Mode::Apply && !work.proposals.is_empty() {
            ctx.service
                .list_entities(EntityKind::Food)
                .await?
                .into_iter()
                .map(|food| IngredientRef {
                    id: Some(food.id),
                    name: food.name,
                })
                .collect()
        } else {
            Vec::new()
        };

        let mut report = run.execute(ctx, work, known_foods).await?;
        report.counts.failed += item_failures.len();
        report.failures.extend(item_failures);

        let report_dir = &ctx.config.pipeline.report_dir;
        write_review(report_dir, &review, &still_suppressed)?;
        write_success_log(report_dir, &report, &recipes_by_id)?;
        Ok(report)
    }
}

/// Strategy chain from the configured (or forced) strategy names
async fn build_chain(ctx: &StageContext) -> Result<StrategyChain, StageError> {
    let mut strategies: Vec<Arc<dyn ParseStrategy>> = Vec::new();
    for name in ctx.config.parser.effective_strategies() {
        if name == RULES_STRATEGY {
            let units = ctx.service.list_entities(EntityKind::Unit).await?;
            strategies.push(Arc::new(RuleParser::new(&units, ctx.inputs.aliases.clone())));
        } else if is_known_strategy(&name) {
            strategies.push(Arc::new(ServiceParser::new(ctx.service.clone(), name)));
        } else {
            return Err(StageError::Config(format!("unknown parser strategy '{}'", name)));
        }
    }
    Ok(StrategyChain::new(
        strategies,
        ctx.config.parser.confidence_threshold,
    ))
}

/// `None` when the recipe can be patched, else the review outcome
pub fn classify(parsed: &RecipeParse) -> Option<Outcome> {
    if parsed.all_accepted() && parsed.suspicious_reasons().is_empty() {
        return None;
    }
    // Any low-confidence or suspicious answer makes it a rejection; only a
    // recipe whose unaccepted lines were all declined is exhausted
    if parsed.count_state(false) == 0 && parsed.count_state(true) > 0 {
        Some(Outcome::Exhausted)
    } else {
        Some(Outcome::Rejected)
    }
}

fn patch_proposal(parsed: &RecipeParse) -> Proposal {
    Proposal {
        item_id: parsed.recipe_id.clone(),
        state_key: parsed.state_key(),
        serial_key: parsed.slug.clone(),
        payload: ActionPayload::PatchIngredients {
            slug: parsed.slug.clone(),
            recipe_name: parsed.name.clone(),
            ingredients: parsed.accepted_fields(),
            strategies: parsed.strategies_used(),
        },
    }
}

/// Rewrite the review file
///
/// Entries from earlier runs are kept while their recipe is still
/// suppressed by its checkpoint; everything else is replaced by this run.
fn write_review(
    dir: &Path,
    review: &[ReviewEntry],
    still_suppressed: &HashSet<String>,
) -> Result<(), StageError> {
    let path = dir.join(REVIEW_FILE_NAME);
    let mut entries: Vec<Value> = read_review(&path)
        .into_iter()
        .filter(|entry| {
            entry
                .get("recipe_id")
                .and_then(Value::as_str)
                .is_some_and(|id| still_suppressed.contains(id))
        })
        .collect();
    let carried = entries.len();
    for entry in review {
        entries.push(serde_json::to_value(entry).map_err(invalid_data)?);
    }
    entries.sort_by(|a, b| {
        let slug = |v: &Value| v.get("slug").and_then(Value::as_str).unwrap_or_default().to_string();
        slug(a).cmp(&slug(b))
    });

    std::fs::create_dir_all(dir)?;
    let content = serde_json::to_string_pretty(&entries).map_err(invalid_data)?;
    std::fs::write(&path, content)?;
    if !entries.is_empty() {
        tracing::info!(
            recipes = entries.len(),
            carried,
            path = %path.display(),
            "Recipes written for review"
        );
    }
    Ok(())
}

/// Entries of an earlier review file; unreadable files start over
fn read_review(path: &Path) -> Vec<Value> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<Value>>(&content) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable review file");
            Vec::new()
        }
    }
}

fn invalid_data(e: serde_json::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

/// One line per patched (or, in audit mode, patchable) recipe
fn write_success_log(
    dir: &Path,
    report: &StageReport,
    recipes: &HashMap<String, (String, String)>,
) -> Result<(), StageError> {
    std::fs::create_dir_all(dir)?;
    let mut file = std::fs::File::create(dir.join(SUCCESS_LOG_NAME))?;
    for record in &report.actions {
        let prefix = match record.outcome {
            Outcome::Applied => "applied",
            Outcome::SkippedAudit => "audit",
            _ => continue,
        };
        let (slug, name) = recipes
            .get(&record.item_id)
            .map(|(slug, name)| (slug.as_str(), name.as_str()))
            .unwrap_or((record.item_id.as_str(), ""));
        writeln!(file, "[{}] {}\t{}\t{}", prefix, slug, name, record.description)?;
    }
    Ok(())
}
