//! Shared test fixtures
//!
//! `FakeService` is an in-memory [`RecipeService`] with failure injection.
//! Merges behave like the real service: the absorbed entity disappears and
//! its usage moves to the canonical target. Organizer merges (categories,
//! tags, tools) repoint recipe lists the way the HTTP client does: read every
//! recipe, yield, then write each list back whole.

#![allow(dead_code)]

use async_trait::async_trait;
use larder_maint::client::RecipeService;
use larder_maint::config::MaintConfig;
use larder_maint::error::ServiceError;
use larder_maint::model::{
    Entity, EntityDraft, EntityKind, EntityRef, IngredientLine, Recipe, ServiceParse,
    StructuredIngredient,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct FakeState {
    pub entities: BTreeMap<EntityKind, Vec<Entity>>,
    pub recipes: Vec<Recipe>,
    /// (strategy, line) → answer; anything else is a blank (declined) answer
    pub parse_answers: HashMap<(String, String), ServiceParse>,
    /// Every call, in order, e.g. `merge:food:f2->f1`
    pub calls: Vec<String>,
    /// Absorbed ids whose merge is refused with a 422
    pub refuse_merge: HashSet<String>,
    /// Kinds whose listing fails with a 500
    pub fail_list: HashSet<EntityKind>,
    /// Parser strategies answering with a 503
    pub fail_parse: HashSet<String>,
    /// Cancel the token once this many writes have happened
    pub cancel_after: Option<(usize, CancellationToken)>,
    pub write_count: usize,
    next_id: u64,
}

impl FakeState {
    fn wrote(&mut self) {
        self.write_count += 1;
        if let Some((limit, token)) = &self.cancel_after {
            if self.write_count >= *limit {
                token.cancel();
            }
        }
    }

    fn absorb(&mut self, kind: EntityKind, canonical_id: &str, absorbed: &str) {
        let list = self.entities.entry(kind).or_default();
        let Some(position) = list.iter().position(|e| e.id == absorbed) else {
            return;
        };
        let removed = list.remove(position);
        if let Some(target) = list.iter_mut().find(|e| e.id == canonical_id) {
            target.usage_count += removed.usage_count;
        }
    }
}

fn organizers(recipe: &Recipe, kind: EntityKind) -> &Vec<EntityRef> {
    match kind {
        EntityKind::Category => &recipe.categories,
        EntityKind::Tag => &recipe.tags,
        _ => &recipe.tools,
    }
}

fn organizers_mut(recipe: &mut Recipe, kind: EntityKind) -> &mut Vec<EntityRef> {
    match kind {
        EntityKind::Category => &mut recipe.categories,
        EntityKind::Tag => &mut recipe.tags,
        _ => &mut recipe.tools,
    }
}

#[derive(Default)]
pub struct FakeService {
    state: Mutex<FakeState>,
}

impl FakeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(self, entities: Vec<Entity>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            for entity in entities {
                state.entities.entry(entity.kind).or_default().push(entity);
            }
        }
        self
    }

    pub fn with_recipes(self, recipes: Vec<Recipe>) -> Self {
        self.state.lock().unwrap().recipes.extend(recipes);
        self
    }

    pub fn answer(&self, strategy: &str, line: &str, parse: ServiceParse) {
        self.state
            .lock()
            .unwrap()
            .parse_answers
            .insert((strategy.to_string(), line.to_string()), parse);
    }

    pub fn refuse_merge_of(&self, absorbed_id: &str) {
        self.state
            .lock()
            .unwrap()
            .refuse_merge
            .insert(absorbed_id.to_string());
    }

    pub fn fail_listing(&self, kind: EntityKind) {
        self.state.lock().unwrap().fail_list.insert(kind);
    }

    pub fn fail_parsing(&self, strategy: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_parse
            .insert(strategy.to_string());
    }

    pub fn restore_parsing(&self) {
        self.state.lock().unwrap().fail_parse.clear();
    }

    pub fn cancel_after_writes(&self, writes: usize, token: CancellationToken) {
        self.state.lock().unwrap().cancel_after = Some((writes, token));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls that would change the service
    pub fn writes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| {
                ["merge:", "create:", "update:", "delete:", "patch:", "assign:"]
                    .iter()
                    .any(|prefix| c.starts_with(prefix))
            })
            .collect()
    }

    pub fn entity_ids(&self, kind: EntityKind) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<String> = state
            .entities
            .get(&kind)
            .map(|list| list.iter().map(|e| e.id.clone()).collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn recipe(&self, slug: &str) -> Option<Recipe> {
        let state = self.state.lock().unwrap();
        state.recipes.iter().find(|r| r.slug == slug).cloned()
    }

    fn log(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    async fn merge_organizer(
        &self,
        kind: EntityKind,
        canonical_id: &str,
        absorbed: &str,
    ) -> Result<(), ServiceError> {
        let (canonical, snapshot) = {
            let mut state = self.state.lock().unwrap();
            state
                .calls
                .push(format!("merge:{}:{}->{}", kind, absorbed, canonical_id));
            if state.refuse_merge.contains(absorbed) {
                return Err(ServiceError::Status {
                    status: 422,
                    message: format!("merge of {} refused", absorbed),
                });
            }
            let canonical = state
                .entities
                .get(&kind)
                .and_then(|list| list.iter().find(|e| e.id == canonical_id))
                .map(Entity::as_ref);
            let snapshot: Vec<(String, Vec<EntityRef>)> = state
                .recipes
                .iter()
                .map(|r| (r.slug.clone(), organizers(r, kind).clone()))
                .collect();
            (canonical, snapshot)
        };

        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut state = self.state.lock().unwrap();
        if let Some(canonical) = canonical {
            for (slug, refs) in snapshot {
                if !refs.iter().any(|r| r.id == absorbed) {
                    continue;
                }
                let mut repointed: Vec<EntityRef> = refs
                    .into_iter()
                    .filter(|r| r.id != absorbed && r.id != canonical.id)
                    .collect();
                repointed.push(canonical.clone());
                if let Some(recipe) = state.recipes.iter_mut().find(|r| r.slug == slug) {
                    *organizers_mut(recipe, kind) = repointed;
                }
            }
        }
        state.absorb(kind, canonical_id, absorbed);
        state.wrote();
        Ok(())
    }
}

#[async_trait]
impl RecipeService for FakeService {
    async fn list_entities(&self, kind: EntityKind) -> Result<Vec<Entity>, ServiceError> {
        self.log(format!("list:{}", kind));
        let state = self.state.lock().unwrap();
        if state.fail_list.contains(&kind) {
            return Err(ServiceError::Status {
                status: 500,
                message: format!("list {} failed", kind),
            });
        }
        Ok(state.entities.get(&kind).cloned().unwrap_or_default())
    }

    async fn list_recipes(&self) -> Result<Vec<Recipe>, ServiceError> {
        self.log("list:recipes".to_string());
        Ok(self.state.lock().unwrap().recipes.clone())
    }

    async fn get_recipe(&self, slug: &str) -> Result<Recipe, ServiceError> {
        self.log(format!("get:{}", slug));
        self.recipe(slug).ok_or_else(|| ServiceError::Status {
            status: 404,
            message: format!("recipe {} not found", slug),
        })
    }

    async fn recipes_needing_parse(&self) -> Result<Vec<Recipe>, ServiceError> {
        self.log("list:needing-parse".to_string());
        Ok(self
            .state
            .lock()
            .unwrap()
            .recipes
            .iter()
            .filter(|r| !r.has_parsed_ingredients)
            .cloned()
            .collect())
    }

    async fn parse_ingredients(
        &self,
        lines: &[String],
        strategy: &str,
    ) -> Result<Vec<ServiceParse>, ServiceError> {
        self.log(format!("parse:{}:{}", strategy, lines.join("|")));
        let state = self.state.lock().unwrap();
        if state.fail_parse.contains(strategy) {
            return Err(ServiceError::Status {
                status: 503,
                message: format!("parser {} unavailable", strategy),
            });
        }
        Ok(lines
            .iter()
            .map(|line| {
                state
                    .parse_answers
                    .get(&(strategy.to_string(), line.clone()))
                    .cloned()
                    .unwrap_or(ServiceParse {
                        ingredient: StructuredIngredient::default(),
                        confidence: 0.0,
                    })
            })
            .collect())
    }

    async fn patch_ingredients(
        &self,
        slug: &str,
        ingredients: &[StructuredIngredient],
    ) -> Result<(), ServiceError> {
        self.log(format!("patch:{}", slug));
        let mut state = self.state.lock().unwrap();
        let recipe = state
            .recipes
            .iter_mut()
            .find(|r| r.slug == slug)
            .ok_or_else(|| ServiceError::Status {
                status: 404,
                message: format!("recipe {} not found", slug),
            })?;
        recipe.ingredients = ingredients
            .iter()
            .map(|i| IngredientLine {
                raw_text: i.original_text.clone(),
                quantity: i.quantity,
                unit: i.unit.clone(),
                food: i.food.clone(),
                note: Some(i.note.clone()),
            })
            .collect();
        recipe.has_parsed_ingredients = true;
        state.wrote();
        Ok(())
    }

    async fn update_recipe_taxonomy(
        &self,
        slug: &str,
        categories: &[EntityRef],
        tags: &[EntityRef],
    ) -> Result<(), ServiceError> {
        self.log(format!("assign:{}", slug));
        let mut state = self.state.lock().unwrap();
        if let Some(recipe) = state.recipes.iter_mut().find(|r| r.slug == slug) {
            recipe.categories = categories.to_vec();
            recipe.tags = tags.to_vec();
        }
        state.wrote();
        Ok(())
    }

    async fn merge_entities(
        &self,
        kind: EntityKind,
        canonical_id: &str,
        absorbed_ids: &[String],
    ) -> Result<(), ServiceError> {
        if kind.is_organizer() {
            for absorbed in absorbed_ids {
                self.merge_organizer(kind, canonical_id, absorbed).await?;
            }
            return Ok(());
        }

        let mut state = self.state.lock().unwrap();
        for absorbed in absorbed_ids {
            state
                .calls
                .push(format!("merge:{}:{}->{}", kind, absorbed, canonical_id));
            if state.refuse_merge.contains(absorbed) {
                return Err(ServiceError::Status {
                    status: 422,
                    message: format!("merge of {} refused", absorbed),
                });
            }
            state.absorb(kind, canonical_id, absorbed);
            state.wrote();
        }
        Ok(())
    }

    async fn create_entity(
        &self,
        kind: EntityKind,
        draft: &EntityDraft,
    ) -> Result<Entity, ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("new-{}-{}", kind, state.next_id);
        state.calls.push(format!("create:{}:{}", kind, draft.name));
        let mut entity = Entity::new(kind, id, draft.name.clone());
        entity.group_id = draft.group_id.clone();
        entity.attributes = draft.attributes.clone();
        state.entities.entry(kind).or_default().push(entity.clone());
        state.wrote();
        Ok(entity)
    }

    async fn update_entity(
        &self,
        kind: EntityKind,
        id: &str,
        draft: &EntityDraft,
    ) -> Result<(), ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("update:{}:{}:{}", kind, id, draft.name));
        if let Some(entity) = state
            .entities
            .entry(kind)
            .or_default()
            .iter_mut()
            .find(|e| e.id == id)
        {
            entity.name = draft.name.clone();
            entity.attributes = draft.attributes.clone();
        }
        state.wrote();
        Ok(())
    }

    async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<(), ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete:{}:{}", kind, id));
        state.entities.entry(kind).or_default().retain(|e| e.id != id);
        state.wrote();
        Ok(())
    }
}

/// Config writing checkpoints and reports under `dir`
pub fn test_config(dir: &Path, stages: &[&str]) -> MaintConfig {
    let mut config = MaintConfig::default();
    config.pipeline.stages = stages.iter().map(|s| s.to_string()).collect();
    config.pipeline.checkpoint_dir = dir.join("checkpoints");
    config.pipeline.report_dir = dir.join("reports");
    config.pipeline.workers = 2;
    config
}

pub fn unit(id: &str, name: &str, usage: u64) -> Entity {
    Entity::new(EntityKind::Unit, id, name).with_usage(usage)
}

pub fn category(id: &str, name: &str, usage: u64) -> Entity {
    Entity::new(EntityKind::Category, id, name).with_usage(usage)
}

pub fn food(id: &str, name: &str, usage: u64) -> Entity {
    Entity::new(EntityKind::Food, id, name).with_usage(usage)
}

/// Recipe with unparsed ingredient lines
pub fn raw_recipe(id: &str, slug: &str, lines: &[&str]) -> Recipe {
    Recipe {
        id: id.to_string(),
        slug: slug.to_string(),
        name: slug.replace('-', " "),
        ingredients: lines
            .iter()
            .map(|line| IngredientLine {
                raw_text: line.to_string(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

pub fn food_answer(name: &str, quantity: f64, confidence: f64) -> ServiceParse {
    ServiceParse {
        ingredient: StructuredIngredient {
            quantity: Some(quantity),
            food: Some(larder_maint::model::IngredientRef {
                id: None,
                name: name.to_string(),
            }),
            ..Default::default()
        },
        confidence,
    }
}
