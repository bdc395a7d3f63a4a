//! Assign existing categories and tags to recipes that lack them
//!
//! Suggestions come from a [`Categorizer`]. The built-in one matches
//! category and tag names as whole words in the recipe name and description.

use super::{Stage, StageContext, StageName, StageRun, StageWork};
use crate::error::StageError;
use crate::model::{Entity, EntityKind, EntityRef, Recipe};
use crate::normalize::normalize_name;
use crate::planner::{fingerprint, ActionPayload, Proposal};
use crate::report::StageReport;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which recipes the categorize stage looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetMode {
    /// Recipes missing categories or tags; only the missing side is filled
    #[default]
    MissingEither,
    MissingCategories,
    MissingTags,
    /// Every recipe; suggestions are added to what is already there
    All,
}

impl TargetMode {
    fn wants_categories(&self, recipe: &Recipe) -> bool {
        match self {
            TargetMode::MissingEither | TargetMode::MissingCategories => recipe.categories.is_empty(),
            TargetMode::MissingTags => false,
            TargetMode::All => true,
        }
    }

    fn wants_tags(&self, recipe: &Recipe) -> bool {
        match self {
            TargetMode::MissingEither | TargetMode::MissingTags => recipe.tags.is_empty(),
            TargetMode::MissingCategories => false,
            TargetMode::All => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Suggestion {
    pub categories: Vec<EntityRef>,
    pub tags: Vec<EntityRef>,
}

#[async_trait]
pub trait Categorizer: Send + Sync {
    /// Pick from the existing categories and tags for one recipe
    async fn suggest(
        &self,
        recipe: &Recipe,
        categories: &[Entity],
        tags: &[Entity],
    ) -> Result<Suggestion, StageError>;
}

/// Whole-word name matching over recipe name and description
pub struct KeywordCategorizer;

impl KeywordCategorizer {
    fn matches(haystack: &str, entities: &[Entity]) -> Vec<EntityRef> {
        entities
            .iter()
            .filter(|entity| {
                let key = normalize_name(&entity.name);
                !key.is_empty() && haystack.contains(&format!(" {} ", key))
            })
            .map(Entity::as_ref)
            .collect()
    }
}

#[async_trait]
impl Categorizer for KeywordCategorizer {
    async fn suggest(
        &self,
        recipe: &Recipe,
        categories: &[Entity],
        tags: &[Entity],
    ) -> Result<Suggestion, StageError> {
        let text = format!(
            "{} {}",
            recipe.name,
            recipe.description.as_deref().unwrap_or_default()
        );
        let haystack = format!(" {} ", normalize_name(&text));
        Ok(Suggestion {
            categories: Self::matches(&haystack, categories),
            tags: Self::matches(&haystack, tags),
        })
    }
}

pub struct CategorizeStage {
    categorizer: Arc<dyn Categorizer>,
}

impl CategorizeStage {
    pub fn new(categorizer: Arc<dyn Categorizer>) -> Self {
        Self { categorizer }
    }
}

#[async_trait]
impl Stage for CategorizeStage {
    fn name(&self) -> StageName {
        StageName::Categorize
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport, StageError> {
        if ctx.cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let recipes = ctx.service.list_recipes().await?;
        let categories = ctx.service.list_entities(EntityKind::Category).await?;
        let tags = ctx.service.list_entities(EntityKind::Tag).await?;
        let target_mode = ctx.config.categorize.target_mode;

        let targets: Vec<&Recipe> = recipes
            .iter()
            .filter(|r| target_mode.wants_categories(r) || target_mode.wants_tags(r))
            .collect();

        let mut work = StageWork {
            evaluated: targets.len(),
            ..Default::default()
        };
        work.finding(
            "recipes_missing_categories",
            recipes.iter().filter(|r| r.categories.is_empty()).count() as u64,
        );
        work.finding(
            "recipes_missing_tags",
            recipes.iter().filter(|r| r.tags.is_empty()).count() as u64,
        );

        let categorizer = self.categorizer.as_ref();
        let pending: Vec<_> = targets
            .iter()
            .map(|recipe| categorizer.suggest(recipe, &categories, &tags))
            .collect();
        let suggestions: Vec<Result<Suggestion, StageError>> = stream::iter(pending)
            .buffered(ctx.config.pipeline.workers.max(1))
            .collect()
            .await;

        let mut unmatched = 0u64;
        for (recipe, suggestion) in targets.iter().zip(suggestions) {
            match assignment(recipe, suggestion?, target_mode) {
                Some(proposal) => work.proposals.push(proposal),
                None => unmatched += 1,
            }
        }
        work.finding("recipes_without_suggestion", unmatched);

        let run = StageRun::open(ctx, StageName::Categorize).await?;
        run.execute(ctx, work, Vec::new()).await
    }
}

/// Merge a suggestion into the recipe's current taxonomy
///
/// `None` when nothing would be added.
pub fn assignment(recipe: &Recipe, suggestion: Suggestion, mode: TargetMode) -> Option<Proposal> {
    let extend = |current: &[EntityRef], suggested: Vec<EntityRef>, wanted: bool| {
        let mut merged = current.to_vec();
        if wanted {
            for item in suggested {
                if !merged.iter().any(|m| m.id == item.id) {
                    merged.push(item);
                }
            }
        }
        merged
    };

    let categories = extend(
        &recipe.categories,
        suggestion.categories,
        mode.wants_categories(recipe),
    );
    let tags = extend(&recipe.tags, suggestion.tags, mode.wants_tags(recipe));
    if categories.len() == recipe.categories.len() && tags.len() == recipe.tags.len() {
        return None;
    }

    let mut parts = vec!["categorize", recipe.id.as_str()];
    parts.extend(categories.iter().map(|c| c.id.as_str()));
    parts.push("|");
    parts.extend(tags.iter().map(|t| t.id.as_str()));

    Some(Proposal {
        item_id: recipe.id.clone(),
        state_key: fingerprint(&parts),
        serial_key: recipe.slug.clone(),
        payload: ActionPayload::AssignTaxonomy {
            slug: recipe.slug.clone(),
            recipe_name: recipe.name.clone(),
            categories,
            tags,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe(name: &str, description: &str) -> Recipe {
        Recipe {
            id: format!("r-{}", name.len()),
            slug: normalize_name(name).replace(' ', "-"),
            name: name.to_string(),
            description: Some(description.to_string()),
            ..Default::default()
        }
    }

    fn taxonomy() -> (Vec<Entity>, Vec<Entity>) {
        (
            vec![
                Entity::new(EntityKind::Category, "c-dinner", "Dinner"),
                Entity::new(EntityKind::Category, "c-soup", "Soup"),
            ],
            vec![
                Entity::new(EntityKind::Tag, "t-quick", "Quick"),
                Entity::new(EntityKind::Tag, "t-veg", "Vegetarian"),
            ],
        )
    }

    #[tokio::test]
    async fn test_keyword_matching_is_whole_word() {
        let (categories, tags) = taxonomy();
        let suggestion = KeywordCategorizer
            .suggest(
                &recipe("Quick tomato soup", "Souper easy dinner."),
                &categories,
                &tags,
            )
            .await
            .unwrap();
        let ids: Vec<&str> = suggestion.categories.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c-dinner", "c-soup"]);
        assert_eq!(suggestion.tags.len(), 1);
        assert_eq!(suggestion.tags[0].id, "t-quick");
    }

    #[test]
    fn test_assignment_respects_target_mode() {
        let mut target = recipe("Soup", "");
        target.tags = vec![EntityRef {
            id: "t-existing".into(),
            name: "Existing".into(),
            slug: None,
        }];
        let suggestion = Suggestion {
            categories: vec![Entity::new(EntityKind::Category, "c-soup", "Soup").as_ref()],
            tags: vec![Entity::new(EntityKind::Tag, "t-quick", "Quick").as_ref()],
        };

        // Tags already present, so only categories are filled
        let proposal = assignment(&target, suggestion.clone(), TargetMode::MissingEither).unwrap();
        match proposal.payload {
            ActionPayload::AssignTaxonomy { categories, tags, .. } => {
                assert_eq!(categories.len(), 1);
                assert_eq!(tags.len(), 1);
                assert_eq!(tags[0].id, "t-existing");
            }
            other => panic!("unexpected payload {:?}", other),
        }

        assert!(assignment(&target, suggestion.clone(), TargetMode::MissingTags).is_none());

        let all = assignment(&target, suggestion, TargetMode::All).unwrap();
        match all.payload {
            ActionPayload::AssignTaxonomy { tags, .. } => assert_eq!(tags.len(), 2),
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
