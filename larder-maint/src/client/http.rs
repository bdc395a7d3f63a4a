//! HTTP implementation of [`RecipeService`] for the Mealie REST API
//!
//! Every request goes through the client-side rate limiter and the transient
//! retry policy. List endpoints are paginated; the service returns `next`
//! links that sometimes drop the `/api` prefix, which is repaired here.

use super::retry::{retry_transient, RetryPolicy};
use super::RecipeService;
use crate::error::ServiceError;
use crate::model::{
    Entity, EntityDraft, EntityKind, EntityRef, IngredientLine, IngredientRef, Recipe,
    ServiceParse, StructuredIngredient,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, Method};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use std::time::Duration;

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Connection settings for the HTTP client
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    /// API root, e.g. `http://mealie:9000/api`
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub requests_per_second: u32,
    pub page_size: u32,
}

/// Cookbook fields carried in [`Entity::attributes`]
const COOKBOOK_FIELDS: [&str; 4] = ["description", "queryFilterString", "public", "position"];

pub struct HttpRecipeService {
    client: Client,
    settings: ServiceSettings,
    rate_limiter: DirectRateLimiter,
}

impl HttpRecipeService {
    pub fn new(settings: ServiceSettings) -> Result<Self, ServiceError> {
        if settings.base_url.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("service url is empty".into()));
        }

        let client = Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|e| ServiceError::InvalidRequest(format!("HTTP client build failed: {}", e)))?;

        let per_second = NonZeroU32::new(settings.requests_per_second)
            .unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(per_second));

        let mut settings = settings;
        settings.base_url = settings.base_url.trim_end_matches('/').to_string();

        Ok(Self {
            client,
            settings,
            rate_limiter,
        })
    }

    fn make_url(&self, path_or_url: &str) -> String {
        let lower = path_or_url.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return path_or_url.to_string();
        }
        if path_or_url.starts_with('/') {
            format!("{}{}", self.settings.base_url, path_or_url)
        } else {
            format!("{}/{}", self.settings.base_url, path_or_url)
        }
    }

    /// One HTTP round trip; no retry
    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>, ServiceError> {
        self.rate_limiter.until_ready().await;

        tracing::trace!(method = %method, url, "Service request");

        let mut request = self
            .client
            .request(method.clone(), url)
            .bearer_auth(&self.settings.api_key)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ServiceError::Status {
                status: status.as_u16(),
                message: format!("{} {}: {}", method, url, short_text(&text, 240)),
            });
        }

        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| ServiceError::Decode(format!("{} {}: {}", method, url, e)))
    }

    async fn request(
        &self,
        method: Method,
        path_or_url: &str,
        body: Option<Value>,
    ) -> Result<Option<Value>, ServiceError> {
        let url = self.make_url(path_or_url);
        let operation = format!("{} {}", method, path_or_url);
        retry_transient(&operation, &self.settings.retry, || {
            self.send_once(method.clone(), &url, body.as_ref())
        })
        .await
    }

    async fn request_json(
        &self,
        method: Method,
        path_or_url: &str,
        body: Option<Value>,
    ) -> Result<Value, ServiceError> {
        self.request(method.clone(), path_or_url, body)
            .await?
            .ok_or_else(|| ServiceError::Decode(format!("{} {}: empty body", method, path_or_url)))
    }

    /// Collect every item of a paginated list endpoint
    async fn get_paginated(&self, path: &str) -> Result<Vec<Value>, ServiceError> {
        let mut items = Vec::new();
        let first = self.make_url(path);
        let mut next_url = if first.contains("perPage=") {
            Some(first)
        } else {
            let join = if first.contains('?') { '&' } else { '?' };
            Some(format!("{}{}perPage={}", first, join, self.settings.page_size))
        };

        let mut visited: HashSet<String> = HashSet::new();
        while let Some(url) = next_url.take() {
            if !visited.insert(url.clone()) {
                tracing::warn!(path, url = %url, "Pagination loops back to a fetched page, stopping");
                break;
            }
            let data = self.request_json(Method::GET, &url, None).await?;
            match data {
                Value::Array(page) => {
                    items.extend(page.into_iter().filter(Value::is_object));
                }
                Value::Object(mut page) => {
                    if let Some(Value::Array(page_items)) = page.remove("items") {
                        items.extend(page_items.into_iter().filter(Value::is_object));
                    }
                    next_url = page
                        .get("next")
                        .and_then(Value::as_str)
                        .and_then(|next| resolve_next_url(&url, next));
                }
                _ => {}
            }
        }

        tracing::debug!(path, count = items.len(), "Fetched paginated list");
        Ok(items)
    }

    async fn list_recipe_summaries(&self) -> Result<Vec<WireRecipe>, ServiceError> {
        self.get_paginated("/recipes")
            .await?
            .into_iter()
            .map(|item| {
                serde_json::from_value::<WireRecipe>(item)
                    .map_err(|e| ServiceError::Decode(format!("recipe: {}", e)))
            })
            .collect()
    }

    async fn patch_recipe(&self, slug: &str, payload: Value) -> Result<(), ServiceError> {
        self.request(Method::PATCH, &format!("/recipes/{}", slug), Some(payload))
            .await
            .map(|_| ())
    }

    /// Repoint every recipe referencing `absorbed_id` to `canonical`, then
    /// delete the absorbed organizer
    async fn repoint_and_delete(
        &self,
        kind: EntityKind,
        canonical: &EntityRef,
        absorbed_id: &str,
        recipes: &[WireRecipe],
    ) -> Result<(), ServiceError> {
        let field = organizer_field(kind)?;
        for recipe in recipes {
            let refs = match kind {
                EntityKind::Category => &recipe.recipe_category,
                EntityKind::Tag => &recipe.tags,
                _ => &recipe.tools,
            };
            if !refs.iter().any(|r| r.id.as_deref() == Some(absorbed_id)) {
                continue;
            }
            let Some(slug) = recipe.slug.as_deref() else {
                continue;
            };

            let mut repointed: Vec<Value> = Vec::with_capacity(refs.len());
            let mut has_canonical = false;
            for r in refs {
                let id = r.id.as_deref().unwrap_or_default();
                if id == absorbed_id || id == canonical.id {
                    if !has_canonical {
                        repointed.push(ref_json(canonical));
                        has_canonical = true;
                    }
                } else {
                    repointed.push(r.to_json());
                }
            }
            let mut payload = serde_json::Map::new();
            payload.insert(field.to_string(), Value::Array(repointed));
            self.patch_recipe(slug, Value::Object(payload)).await?;
        }

        self.delete_entity(kind, absorbed_id).await
    }

    async fn find_entity(&self, kind: EntityKind, id: &str) -> Result<Entity, ServiceError> {
        let path = format!("{}/{}", entity_path(kind), id);
        let item = self.request_json(Method::GET, &path, None).await?;
        entity_from_value(kind, item)
    }
}

#[async_trait]
impl RecipeService for HttpRecipeService {
    async fn list_entities(&self, kind: EntityKind) -> Result<Vec<Entity>, ServiceError> {
        let raw = self.get_paginated(entity_path(kind)).await?;
        let mut entities = raw
            .into_iter()
            .map(|item| entity_from_value(kind, item))
            .collect::<Result<Vec<_>, _>>()?;

        if !matches!(kind, EntityKind::Cookbook | EntityKind::Label) {
            let recipes = self.list_recipe_summaries().await?;
            let usage = usage_counts(kind, &recipes);
            for entity in &mut entities {
                entity.usage_count = usage.get(&entity.id).copied().unwrap_or(0);
            }
        }

        Ok(entities)
    }

    async fn list_recipes(&self) -> Result<Vec<Recipe>, ServiceError> {
        Ok(self
            .list_recipe_summaries()
            .await?
            .into_iter()
            .filter_map(WireRecipe::into_recipe)
            .collect())
    }

    async fn get_recipe(&self, slug: &str) -> Result<Recipe, ServiceError> {
        let data = self
            .request_json(Method::GET, &format!("/recipes/{}", slug), None)
            .await?;
        let wire: WireRecipe = serde_json::from_value(data)
            .map_err(|e| ServiceError::Decode(format!("recipe {}: {}", slug, e)))?;
        wire.into_recipe()
            .ok_or_else(|| ServiceError::Decode(format!("recipe {}: missing id or slug", slug)))
    }

    async fn recipes_needing_parse(&self) -> Result<Vec<Recipe>, ServiceError> {
        Ok(self
            .list_recipes()
            .await?
            .into_iter()
            .filter(|recipe| !recipe.has_parsed_ingredients)
            .collect())
    }

    async fn parse_ingredients(
        &self,
        lines: &[String],
        strategy: &str,
    ) -> Result<Vec<ServiceParse>, ServiceError> {
        let data = self
            .request_json(
                Method::POST,
                "/parser/ingredients",
                Some(json!({ "strategy": strategy, "ingredients": lines })),
            )
            .await?;
        let parsed: Vec<WireParsedLine> = serde_json::from_value(data)
            .map_err(|e| ServiceError::Decode(format!("parser response: {}", e)))?;

        Ok(parsed
            .into_iter()
            .map(|line| ServiceParse {
                confidence: line.confidence.and_then(|c| c.average).unwrap_or(0.0),
                ingredient: line.ingredient.into_structured(),
            })
            .collect())
    }

    async fn patch_ingredients(
        &self,
        slug: &str,
        ingredients: &[StructuredIngredient],
    ) -> Result<(), ServiceError> {
        let lines: Vec<Value> = ingredients
            .iter()
            .map(|ingredient| {
                json!({
                    "quantity": ingredient.quantity.unwrap_or(0.0),
                    "unit": ingredient.unit.as_ref().map(ingredient_ref_json),
                    "food": ingredient.food.as_ref().map(ingredient_ref_json),
                    "note": ingredient.note,
                    "originalText": ingredient.original_text,
                })
            })
            .collect();
        self.patch_recipe(slug, json!({ "recipeIngredient": lines })).await
    }

    async fn update_recipe_taxonomy(
        &self,
        slug: &str,
        categories: &[EntityRef],
        tags: &[EntityRef],
    ) -> Result<(), ServiceError> {
        let payload = json!({
            "recipeCategory": categories.iter().map(ref_json).collect::<Vec<_>>(),
            "tags": tags.iter().map(ref_json).collect::<Vec<_>>(),
        });
        self.patch_recipe(slug, payload).await
    }

    async fn merge_entities(
        &self,
        kind: EntityKind,
        canonical_id: &str,
        absorbed_ids: &[String],
    ) -> Result<(), ServiceError> {
        match kind {
            EntityKind::Food | EntityKind::Unit => {
                let (route, from, to) = if kind == EntityKind::Food {
                    ("/foods/merge", "fromFood", "toFood")
                } else {
                    ("/units/merge", "fromUnit", "toUnit")
                };
                for absorbed in absorbed_ids {
                    let mut payload = serde_json::Map::new();
                    payload.insert(from.to_string(), Value::String(absorbed.clone()));
                    payload.insert(to.to_string(), Value::String(canonical_id.to_string()));
                    self.request(Method::PUT, route, Some(Value::Object(payload)))
                        .await?;
                }
                Ok(())
            }
            EntityKind::Category | EntityKind::Tag | EntityKind::Tool => {
                let canonical = self.find_entity(kind, canonical_id).await?.as_ref();
                let recipes = self.list_recipe_summaries().await?;
                for absorbed in absorbed_ids {
                    self.repoint_and_delete(kind, &canonical, absorbed, &recipes)
                        .await?;
                }
                Ok(())
            }
            EntityKind::Cookbook | EntityKind::Label => Err(ServiceError::InvalidRequest(
                format!("{}s cannot be merged", kind),
            )),
        }
    }

    async fn create_entity(
        &self,
        kind: EntityKind,
        draft: &EntityDraft,
    ) -> Result<Entity, ServiceError> {
        let created = self
            .request_json(Method::POST, entity_path(kind), Some(draft_json(draft)))
            .await?;
        entity_from_value(kind, created)
    }

    async fn update_entity(
        &self,
        kind: EntityKind,
        id: &str,
        draft: &EntityDraft,
    ) -> Result<(), ServiceError> {
        let mut payload = draft_json(draft);
        if let Value::Object(map) = &mut payload {
            map.insert("id".into(), Value::String(id.to_string()));
        }
        self.request(
            Method::PUT,
            &format!("{}/{}", entity_path(kind), id),
            Some(payload),
        )
        .await
        .map(|_| ())
    }

    async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<(), ServiceError> {
        self.request(Method::DELETE, &format!("{}/{}", entity_path(kind), id), None)
            .await
            .map(|_| ())
    }
}

/// REST collection path for an entity kind
fn entity_path(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Food => "/foods",
        EntityKind::Unit => "/units",
        EntityKind::Tool => "/organizers/tools",
        EntityKind::Category => "/organizers/categories",
        EntityKind::Tag => "/organizers/tags",
        EntityKind::Cookbook => "/households/cookbooks",
        EntityKind::Label => "/groups/labels",
    }
}

fn organizer_field(kind: EntityKind) -> Result<&'static str, ServiceError> {
    match kind {
        EntityKind::Category => Ok("recipeCategory"),
        EntityKind::Tag => Ok("tags"),
        EntityKind::Tool => Ok("tools"),
        other => Err(ServiceError::InvalidRequest(format!(
            "{} is not a recipe organizer",
            other
        ))),
    }
}

/// Resolve a pagination `next` link against the URL that produced it
///
/// Relative links that lost the `/api` prefix get it back.
pub(crate) fn resolve_next_url(current_url: &str, next: &str) -> Option<String> {
    let next = next.trim();
    if next.is_empty() {
        return None;
    }
    let lower = next.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Some(next.to_string());
    }

    let current = reqwest::Url::parse(current_url).ok()?;
    if next.starts_with('/') {
        let api_prefixed = current.path().starts_with("/api/");
        let fixed = if api_prefixed && !next.starts_with("/api/") {
            format!("/api{}", next)
        } else {
            next.to_string()
        };
        return current.join(&fixed).ok().map(String::from);
    }
    current.join(next).ok().map(String::from)
}

fn usage_counts(kind: EntityKind, recipes: &[WireRecipe]) -> HashMap<String, u64> {
    let mut usage: HashMap<String, u64> = HashMap::new();
    for recipe in recipes {
        let ids: Vec<&str> = match kind {
            EntityKind::Food => recipe
                .recipe_ingredient
                .iter()
                .filter_map(|i| i.food.as_ref().and_then(|f| f.id.as_deref()))
                .collect(),
            EntityKind::Unit => recipe
                .recipe_ingredient
                .iter()
                .filter_map(|i| i.unit.as_ref().and_then(|u| u.id.as_deref()))
                .collect(),
            EntityKind::Category => refs_ids(&recipe.recipe_category),
            EntityKind::Tag => refs_ids(&recipe.tags),
            EntityKind::Tool => refs_ids(&recipe.tools),
            EntityKind::Cookbook | EntityKind::Label => Vec::new(),
        };
        // Count each recipe once per entity
        let mut seen: Vec<&str> = Vec::new();
        for id in ids {
            if !seen.contains(&id) {
                seen.push(id);
                *usage.entry(id.to_string()).or_insert(0) += 1;
            }
        }
    }
    usage
}

fn refs_ids(refs: &[WireRef]) -> Vec<&str> {
    refs.iter().filter_map(|r| r.id.as_deref()).collect()
}

fn entity_from_value(kind: EntityKind, item: Value) -> Result<Entity, ServiceError> {
    let wire: WireEntity = serde_json::from_value(item.clone())
        .map_err(|e| ServiceError::Decode(format!("{}: {}", kind, e)))?;

    let attributes = if kind == EntityKind::Cookbook {
        let mut map = serde_json::Map::new();
        for field in COOKBOOK_FIELDS {
            if let Some(value) = item.get(field) {
                map.insert(field.to_string(), value.clone());
            }
        }
        Value::Object(map)
    } else {
        Value::Null
    };

    Ok(Entity {
        id: wire.id,
        kind,
        name: wire.name.trim().to_string(),
        usage_count: 0,
        group_id: wire.group_id,
        aliases: wire.aliases.into_iter().map(|a| a.name).collect(),
        created_at: wire.created_at.as_deref().and_then(parse_timestamp),
        slug: wire.slug,
        attributes,
    })
}

fn draft_json(draft: &EntityDraft) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("name".into(), Value::String(draft.name.clone()));
    if let Some(group_id) = &draft.group_id {
        map.insert("groupId".into(), Value::String(group_id.clone()));
    }
    if let Value::Object(attributes) = &draft.attributes {
        for (key, value) in attributes {
            map.insert(key.clone(), value.clone());
        }
    }
    Value::Object(map)
}

fn ref_json(r: &EntityRef) -> Value {
    let mut value = json!({ "id": r.id, "name": r.name });
    if let Some(slug) = &r.slug {
        value["slug"] = Value::String(slug.clone());
    }
    value
}

fn ingredient_ref_json(r: &IngredientRef) -> Value {
    json!({ "id": r.id, "name": r.name })
}

/// Service timestamps may or may not carry an offset
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn short_text(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let truncated: String = collapsed.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEntity {
    id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    name: String,
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    aliases: Vec<WireAlias>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    slug: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAlias {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WireRef {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    slug: Option<String>,
}

impl WireRef {
    fn to_json(&self) -> Value {
        json!({ "id": self.id, "name": self.name, "slug": self.slug })
    }

    fn into_entity_ref(self) -> Option<EntityRef> {
        Some(EntityRef {
            id: self.id?,
            name: self.name.unwrap_or_default(),
            slug: self.slug,
        })
    }

    fn into_ingredient_ref(self) -> Option<IngredientRef> {
        let name = self.name.unwrap_or_default().trim().to_string();
        let id = self.id.filter(|id| !id.trim().is_empty());
        if id.is_none() && name.is_empty() {
            return None;
        }
        Some(IngredientRef { id, name })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireIngredient {
    #[serde(default)]
    quantity: Option<f64>,
    #[serde(default)]
    unit: Option<WireRef>,
    #[serde(default)]
    food: Option<WireRef>,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    original_text: Option<String>,
    #[serde(default)]
    display: Option<String>,
}

impl WireIngredient {
    fn into_line(self) -> IngredientLine {
        let raw_text = [&self.original_text, &self.note, &self.display]
            .into_iter()
            .flatten()
            .map(|text| text.trim())
            .find(|text| !text.is_empty())
            .unwrap_or_default()
            .to_string();
        IngredientLine {
            raw_text,
            quantity: self.quantity,
            unit: self.unit.and_then(WireRef::into_ingredient_ref),
            food: self.food.and_then(WireRef::into_ingredient_ref),
            note: self.note,
        }
    }

    fn into_structured(self) -> StructuredIngredient {
        StructuredIngredient {
            quantity: self.quantity,
            unit: self.unit.and_then(WireRef::into_ingredient_ref),
            food: self.food.and_then(WireRef::into_ingredient_ref),
            note: self.note.unwrap_or_default().trim().to_string(),
            original_text: self.original_text.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecipe {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    recipe_category: Vec<WireRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    tags: Vec<WireRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    tools: Vec<WireRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    recipe_ingredient: Vec<WireIngredient>,
    #[serde(default)]
    has_parsed_ingredients: Option<bool>,
}

impl WireRecipe {
    fn into_recipe(self) -> Option<Recipe> {
        let slug = self.slug.filter(|s| !s.is_empty())?;
        let ingredients: Vec<IngredientLine> = self
            .recipe_ingredient
            .into_iter()
            .map(WireIngredient::into_line)
            .collect();
        let has_parsed_ingredients = self
            .has_parsed_ingredients
            .unwrap_or_else(|| ingredients.iter().any(|line| line.food.is_some()));
        Some(Recipe {
            id: self.id.unwrap_or_else(|| slug.clone()),
            name: self.name.unwrap_or_else(|| slug.clone()),
            slug,
            description: self.description,
            categories: self
                .recipe_category
                .into_iter()
                .filter_map(WireRef::into_entity_ref)
                .collect(),
            tags: self.tags.into_iter().filter_map(WireRef::into_entity_ref).collect(),
            tools: self.tools.into_iter().filter_map(WireRef::into_entity_ref).collect(),
            ingredients,
            has_parsed_ingredients,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireConfidence {
    #[serde(default)]
    average: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireParsedLine {
    ingredient: WireIngredient,
    #[serde(default)]
    confidence: Option<WireConfidence>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_url_absolute_is_kept() {
        assert_eq!(
            resolve_next_url("http://h/api/foods?page=1", "https://other/api/foods?page=2"),
            Some("https://other/api/foods?page=2".to_string())
        );
    }

    #[test]
    fn test_next_url_regains_api_prefix() {
        assert_eq!(
            resolve_next_url("http://h:9000/api/recipes?page=1&perPage=50", "/recipes?page=2&perPage=50"),
            Some("http://h:9000/api/recipes?page=2&perPage=50".to_string())
        );
    }

    #[test]
    fn test_next_url_empty_ends_pagination() {
        assert_eq!(resolve_next_url("http://h/api/foods", "  "), None);
    }

    #[test]
    fn test_usage_counts_once_per_recipe() {
        let recipe: WireRecipe = serde_json::from_value(json!({
            "slug": "soup",
            "recipeIngredient": [
                {"food": {"id": "f1", "name": "onion"}},
                {"food": {"id": "f1", "name": "onion"}},
                {"food": null, "note": "salt"}
            ],
            "tags": null
        }))
        .unwrap();
        let usage = usage_counts(EntityKind::Food, &[recipe]);
        assert_eq!(usage.get("f1"), Some(&1));
        assert_eq!(usage.len(), 1);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-03-01T10:00:00Z").is_some());
        assert!(parse_timestamp("2024-03-01T10:00:00.123456").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_recipe_without_parsed_flag_infers_from_foods() {
        let wire: WireRecipe = serde_json::from_value(json!({
            "id": "r1",
            "slug": "pie",
            "recipeIngredient": [{"note": "2 cups flour", "food": null}]
        }))
        .unwrap();
        let recipe = wire.into_recipe().unwrap();
        assert!(!recipe.has_parsed_ingredients);
        assert_eq!(recipe.ingredients[0].raw_text, "2 cups flour");
    }
}
