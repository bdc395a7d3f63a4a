//! Recipe service access
//!
//! Stages talk to the service only through [`RecipeService`], so the
//! pipeline can be driven against the HTTP client in production and an
//! in-memory fake in tests.

pub mod http;
pub mod retry;

pub use http::{HttpRecipeService, ServiceSettings};
pub use retry::{retry_transient, RetryPolicy};

use crate::error::ServiceError;
use crate::model::{
    Entity, EntityDraft, EntityKind, EntityRef, Recipe, ServiceParse, StructuredIngredient,
};
use async_trait::async_trait;

/// Typed operations against the recipe service
///
/// Every method is safe to retry; implementations retry transient failures
/// internally and surface only permanent errors (or exhaustion).
#[async_trait]
pub trait RecipeService: Send + Sync {
    /// All entities of a kind, with usage counts filled in
    async fn list_entities(&self, kind: EntityKind) -> Result<Vec<Entity>, ServiceError>;

    /// All recipes with organizers and ingredient lines
    async fn list_recipes(&self) -> Result<Vec<Recipe>, ServiceError>;

    /// One recipe with full ingredient detail
    async fn get_recipe(&self, slug: &str) -> Result<Recipe, ServiceError>;

    /// Recipes whose ingredients have not been structured yet
    async fn recipes_needing_parse(&self) -> Result<Vec<Recipe>, ServiceError>;

    /// Run the service-side parser on raw lines
    ///
    /// Returns one result per input line, in order.
    async fn parse_ingredients(
        &self,
        lines: &[String],
        strategy: &str,
    ) -> Result<Vec<ServiceParse>, ServiceError>;

    /// Replace a recipe's ingredient list with structured lines
    async fn patch_ingredients(
        &self,
        slug: &str,
        ingredients: &[StructuredIngredient],
    ) -> Result<(), ServiceError>;

    /// Replace a recipe's category and tag lists
    async fn update_recipe_taxonomy(
        &self,
        slug: &str,
        categories: &[EntityRef],
        tags: &[EntityRef],
    ) -> Result<(), ServiceError>;

    /// Fold `absorbed_ids` into `canonical_id`
    ///
    /// References move to the canonical entity and the absorbed ones are gone
    /// afterwards.
    async fn merge_entities(
        &self,
        kind: EntityKind,
        canonical_id: &str,
        absorbed_ids: &[String],
    ) -> Result<(), ServiceError>;

    async fn create_entity(
        &self,
        kind: EntityKind,
        draft: &EntityDraft,
    ) -> Result<Entity, ServiceError>;

    async fn update_entity(
        &self,
        kind: EntityKind,
        id: &str,
        draft: &EntityDraft,
    ) -> Result<(), ServiceError>;

    async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<(), ServiceError>;
}
