//! Domain types shared by the client, engines and stages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of reference entity held by the recipe service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Food,
    Unit,
    Tool,
    Category,
    Tag,
    Cookbook,
    Label,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Food => "food",
            EntityKind::Unit => "unit",
            EntityKind::Tool => "tool",
            EntityKind::Category => "category",
            EntityKind::Tag => "tag",
            EntityKind::Cookbook => "cookbook",
            EntityKind::Label => "label",
        }
    }

    /// Kinds attached directly to recipes as organizer lists
    pub fn is_organizer(&self) -> bool {
        matches!(self, EntityKind::Category | EntityKind::Tag | EntityKind::Tool)
    }

    /// Serial key shared by every action that rewrites recipe organizer
    /// lists of this kind
    ///
    /// A repoint rewrites the whole list on each recipe, so two of them on
    /// the same kind must never overlap even for different targets.
    pub fn organizer_serial_key(&self) -> Option<String> {
        self.is_organizer().then(|| format!("organizer:{}", self.as_str()))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference-data record in the recipe service
///
/// `id` is immutable once created; `name` only changes through merge or rename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    pub name: String,
    /// Number of recipes referencing this entity
    pub usage_count: u64,
    /// Service group scope; merges never cross groups
    pub group_id: Option<String>,
    pub aliases: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub slug: Option<String>,
    /// Kind-specific fields (cookbook description, filter, position, ...)
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl Entity {
    pub fn new(kind: EntityKind, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            usage_count: 0,
            group_id: None,
            aliases: Vec::new(),
            created_at: None,
            slug: None,
            attributes: serde_json::Value::Null,
        }
    }

    pub fn with_usage(mut self, usage_count: u64) -> Self {
        self.usage_count = usage_count;
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn as_ref(&self) -> EntityRef {
        EntityRef {
            id: self.id.clone(),
            name: self.name.clone(),
            slug: self.slug.clone(),
        }
    }
}

/// Payload for creating or updating an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDraft {
    pub name: String,
    pub group_id: Option<String>,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl EntityDraft {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group_id: None,
            attributes: serde_json::Value::Null,
        }
    }
}

/// Lightweight reference to an entity as embedded in recipes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
}

/// Food or unit reference inside a structured ingredient
///
/// `id` is `None` when the parser produced a name the service does not know yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngredientRef {
    pub id: Option<String>,
    pub name: String,
}

/// One ingredient line as stored on a recipe
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngredientLine {
    pub raw_text: String,
    pub quantity: Option<f64>,
    pub unit: Option<IngredientRef>,
    pub food: Option<IngredientRef>,
    pub note: Option<String>,
}

/// Structured ingredient fields written back by a parse patch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredIngredient {
    pub quantity: Option<f64>,
    pub unit: Option<IngredientRef>,
    pub food: Option<IngredientRef>,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub original_text: String,
}

/// A recipe as seen by the maintenance stages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub categories: Vec<EntityRef>,
    pub tags: Vec<EntityRef>,
    pub tools: Vec<EntityRef>,
    pub ingredients: Vec<IngredientLine>,
    /// Whether the service reports the ingredients as already structured
    pub has_parsed_ingredients: bool,
}

/// A line parsed by the service-side parser
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceParse {
    pub ingredient: StructuredIngredient,
    /// Average confidence in [0, 1]
    pub confidence: f64,
}
