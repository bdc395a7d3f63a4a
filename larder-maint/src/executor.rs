//! Action Executor
//!
//! Applies planned actions through the [`RecipeService`] and records each
//! terminal outcome in the stage checkpoint before moving on. Actions that
//! share a serial key (same canonical target, same recipe) run one after
//! another; distinct serial keys run concurrently on a bounded pool.

use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::client::RecipeService;
use crate::error::{ServiceError, StageError};
use crate::model::{EntityDraft, EntityKind, IngredientRef, StructuredIngredient};
use crate::normalize::normalize_name;
use crate::planner::{Action, ActionKind, ActionPayload, Mode, Outcome, Plan};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Result of one action
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRecord {
    pub item_id: String,
    pub kind: ActionKind,
    pub mode: Mode,
    pub description: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionRecord {
    fn new(action: &Action, outcome: Outcome, error: Option<String>) -> Self {
        Self {
            item_id: action.item_id.clone(),
            kind: action.kind,
            mode: action.mode,
            description: action.payload.describe(),
            outcome,
            error,
        }
    }
}

/// Everything the executor did for one plan
#[derive(Debug, Clone, Default)]
pub struct Execution {
    /// One record per planned or deferred action, ordered by item id
    pub records: Vec<ActionRecord>,
    /// A failure stopped the remaining actions
    pub halted: bool,
}

impl Execution {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.records.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ActionRecord> {
        self.records.iter().filter(|r| r.outcome == Outcome::Failed)
    }
}

pub struct ActionExecutor<'a> {
    service: &'a dyn RecipeService,
    checkpoint: &'a CheckpointStore,
    run_counter: i64,
    cancel: CancellationToken,
    workers: usize,
    halt_on_failure: bool,
    halted: AtomicBool,
    /// Normalized food name → reference, filled as foods are created
    food_index: Mutex<HashMap<String, IngredientRef>>,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(
        service: &'a dyn RecipeService,
        checkpoint: &'a CheckpointStore,
        run_counter: i64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            service,
            checkpoint,
            run_counter,
            cancel,
            workers: 1,
            halt_on_failure: false,
            halted: AtomicBool::new(false),
            food_index: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Stop starting new actions after the first failure
    pub fn with_halt_on_failure(mut self, halt: bool) -> Self {
        self.halt_on_failure = halt;
        self
    }

    /// Foods already known to the service, used to resolve parsed names
    pub fn with_known_foods(self, foods: impl IntoIterator<Item = IngredientRef>) -> Self {
        let index = foods
            .into_iter()
            .filter(|food| food.id.is_some())
            .map(|food| (normalize_name(&food.name), food))
            .collect();
        Self {
            food_index: Mutex::new(index),
            ..self
        }
    }

    /// Execute every planned action and record deferred ones as skipped
    pub async fn execute_plan(&self, plan: &Plan) -> Result<Execution, StageError> {
        let groups = serial_groups(&plan.actions);

        let pending: Vec<_> = groups.into_iter().map(|group| self.run_serial(group)).collect();
        let results: Vec<Result<Vec<ActionRecord>, StageError>> = stream::iter(pending)
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut records = Vec::with_capacity(plan.proposed());
        for result in results {
            records.extend(result?);
        }
        records.extend(
            plan.deferred
                .iter()
                .map(|action| ActionRecord::new(action, Outcome::SkippedCap, None)),
        );
        records.sort_by(|a, b| a.item_id.cmp(&b.item_id));

        Ok(Execution {
            records,
            halted: self.halted.load(Ordering::SeqCst),
        })
    }

    async fn run_serial(&self, actions: Vec<&Action>) -> Result<Vec<ActionRecord>, StageError> {
        let mut records = Vec::with_capacity(actions.len());
        for action in actions {
            if self.cancel.is_cancelled() || self.halted.load(Ordering::SeqCst) {
                records.push(ActionRecord::new(action, Outcome::Cancelled, None));
                continue;
            }
            let record = self.execute(action).await?;
            if record.outcome == Outcome::Failed && self.halt_on_failure {
                self.halted.store(true, Ordering::SeqCst);
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Execute one action and checkpoint its outcome
    ///
    /// Audit actions never reach the service. `Err` is returned only when
    /// the checkpoint cannot be written.
    pub async fn execute(&self, action: &Action) -> Result<ActionRecord, StageError> {
        let (outcome, error) = match action.mode {
            Mode::Audit => (Outcome::SkippedAudit, None),
            Mode::Apply => match self.apply(&action.payload).await {
                Ok(()) => (Outcome::Applied, None),
                Err(err) => (Outcome::Failed, Some(err.to_string())),
            },
        };

        self.checkpoint
            .upsert(&CheckpointRecord {
                item_id: action.item_id.clone(),
                state_key: action.state_key.clone(),
                outcome,
                run_counter: self.run_counter,
                updated_at: Utc::now(),
            })
            .await
            .map_err(|e| StageError::Checkpoint(e.to_string()))?;

        match &error {
            Some(message) => tracing::warn!(
                stage = %self.checkpoint.stage(),
                item_id = %action.item_id,
                action = %action.payload.describe(),
                error = %message,
                "Action failed"
            ),
            None => tracing::debug!(
                stage = %self.checkpoint.stage(),
                item_id = %action.item_id,
                action = %action.payload.describe(),
                outcome = %outcome,
                "Action recorded"
            ),
        }

        Ok(ActionRecord::new(action, outcome, error))
    }

    async fn apply(&self, payload: &ActionPayload) -> Result<(), ServiceError> {
        match payload {
            ActionPayload::Merge {
                kind,
                canonical_id,
                absorbed_id,
                ..
            } => {
                self.service
                    .merge_entities(*kind, canonical_id, std::slice::from_ref(absorbed_id))
                    .await
            }
            ActionPayload::Delete { kind, id, .. } => self.service.delete_entity(*kind, id).await,
            ActionPayload::Create { kind, draft } => {
                self.service.create_entity(*kind, draft).await.map(|_| ())
            }
            ActionPayload::Update { kind, id, draft } => {
                self.service.update_entity(*kind, id, draft).await
            }
            ActionPayload::PatchIngredients {
                slug, ingredients, ..
            } => {
                let resolved = self.resolve_foods(ingredients).await?;
                self.service.patch_ingredients(slug, &resolved).await
            }
            ActionPayload::AssignTaxonomy {
                slug,
                categories,
                tags,
                ..
            } => {
                self.service
                    .update_recipe_taxonomy(slug, categories, tags)
                    .await
            }
        }
    }

    /// Give every named food an id, creating foods the service lacks
    async fn resolve_foods(
        &self,
        ingredients: &[StructuredIngredient],
    ) -> Result<Vec<StructuredIngredient>, ServiceError> {
        let mut resolved = Vec::with_capacity(ingredients.len());
        for ingredient in ingredients {
            let mut ingredient = ingredient.clone();
            if let Some(food) = &ingredient.food {
                if food.id.is_none() {
                    ingredient.food = Some(self.ensure_food(&food.name).await?);
                }
            }
            resolved.push(ingredient);
        }
        Ok(resolved)
    }

    async fn ensure_food(&self, name: &str) -> Result<IngredientRef, ServiceError> {
        let key = normalize_name(name);
        // Held across the create so two recipes never create the same food
        let mut index = self.food_index.lock().await;
        if let Some(existing) = index.get(&key) {
            return Ok(existing.clone());
        }

        let created = self
            .service
            .create_entity(EntityKind::Food, &EntityDraft::named(name.trim()))
            .await?;
        tracing::info!(food_id = %created.id, name = %created.name, "Created food for parsed ingredient");

        let reference = IngredientRef {
            id: Some(created.id),
            name: created.name,
        };
        index.insert(key, reference.clone());
        Ok(reference)
    }
}

/// Partition actions by serial key, keeping first-appearance order
pub fn serial_groups(actions: &[Action]) -> Vec<Vec<&Action>> {
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<Vec<&Action>> = Vec::new();
    for action in actions {
        match positions.get(action.serial_key.as_str()) {
            Some(&index) => groups[index].push(action),
            None => {
                positions.insert(action.serial_key.as_str(), groups.len());
                groups.push(vec![action]);
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::fingerprint;

    fn action(item: &str, serial: &str) -> Action {
        Action {
            item_id: item.to_string(),
            state_key: fingerprint(&[item]),
            serial_key: serial.to_string(),
            kind: ActionKind::Delete,
            mode: Mode::Apply,
            payload: ActionPayload::Delete {
                kind: EntityKind::Tag,
                id: item.to_string(),
                name: item.to_string(),
            },
        }
    }

    #[test]
    fn test_serial_groups_keep_order_within_group() {
        let actions = vec![
            action("a", "t1"),
            action("b", "t2"),
            action("c", "t1"),
            action("d", "t3"),
        ];
        let groups = serial_groups(&actions);
        let ids: Vec<Vec<&str>> = groups
            .iter()
            .map(|g| g.iter().map(|a| a.item_id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["a", "c"], vec!["b"], vec!["d"]]);
    }

    #[test]
    fn test_empty_plan_has_no_groups() {
        assert!(serial_groups(&[]).is_empty());
    }
}
