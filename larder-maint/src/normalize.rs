//! Normalization & Candidate Engine
//!
//! Pure functions over entities already fetched from the service: compute a
//! canonical key per entity, group entities sharing a key, and pick the
//! canonical target of each group.

use crate::model::{Entity, EntityKind};
use larder_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Key given to names that normalize to nothing; never grouped
const SENTINEL: &str = "\u{0}empty";

/// Normalized form of an entity name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn sentinel() -> Self {
        CanonicalKey(SENTINEL.to_string())
    }

    pub fn is_sentinel(&self) -> bool {
        self.0 == SENTINEL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_sentinel() {
            f.write_str("<empty>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Lowercase, drop punctuation, collapse whitespace
///
/// Apostrophes vanish ("baker's" → "bakers"); other punctuation separates
/// words ("all-purpose" → "all purpose").
pub fn normalize_name(name: &str) -> String {
    let mut cleaned = String::with_capacity(name.len());
    for ch in name.chars().flat_map(char::to_lowercase) {
        if ch == '\'' || ch == '\u{2019}' {
            continue;
        }
        if ch.is_alphanumeric() {
            cleaned.push(ch);
        } else {
            cleaned.push(' ');
        }
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical key for an entity; the alias map only applies to units
pub fn canonical_key(entity: &Entity, aliases: &AliasMap) -> CanonicalKey {
    key_for_name(&entity.name, entity.kind, aliases)
}

pub fn key_for_name(name: &str, kind: EntityKind, aliases: &AliasMap) -> CanonicalKey {
    let normalized = normalize_name(name);
    if normalized.is_empty() {
        return CanonicalKey::sentinel();
    }
    if kind == EntityKind::Unit {
        if let Some(canonical) = aliases.canonical_for(&normalized) {
            return CanonicalKey(canonical.to_string());
        }
    }
    CanonicalKey(normalized)
}

/// Unit alias table: normalized alias → normalized canonical
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AliasMap {
    alias_to_canonical: HashMap<String, String>,
    display: HashMap<String, String>,
}

impl AliasMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read alias file {} failed: {}", path.display(), e)))?;
        Self::from_json_str(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("Alias file {}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Parse either `{"canonical": ["alias", ..]}` or
    /// `[{"canonical": "..", "aliases": [..]}]`
    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("invalid JSON: {}", e)))?;

        let entries: Vec<(String, Value)> = match raw {
            Value::Object(map) => map.into_iter().collect(),
            Value::Array(items) => items
                .into_iter()
                .map(|item| {
                    let canonical = item
                        .get("canonical")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let aliases = item.get("aliases").cloned().unwrap_or(Value::Null);
                    (canonical, aliases)
                })
                .collect(),
            _ => {
                return Err(Error::Config(
                    "alias file must be an object or an array of objects".into(),
                ))
            }
        };

        let mut map = AliasMap::new();
        for (canonical, aliases) in entries {
            let canonical = canonical.trim();
            let canonical_norm = normalize_name(canonical);
            if canonical_norm.is_empty() {
                return Err(Error::Config("alias entry with empty canonical name".into()));
            }
            map.display
                .entry(canonical_norm.clone())
                .or_insert_with(|| canonical.to_string());

            let aliases = match aliases {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                _ => {
                    return Err(Error::Config(format!(
                        "aliases for '{}' must be an array",
                        canonical
                    )))
                }
            };
            for alias in aliases {
                let alias_norm = normalize_name(alias.as_str().unwrap_or_default());
                if alias_norm.is_empty() {
                    continue;
                }
                map.insert(&alias_norm, &canonical_norm)?;
            }
        }
        Ok(map)
    }

    fn insert(&mut self, alias_norm: &str, canonical_norm: &str) -> Result<()> {
        match self.alias_to_canonical.get(alias_norm) {
            Some(existing) if existing != canonical_norm => Err(Error::Config(format!(
                "alias '{}' maps to both '{}' and '{}'",
                alias_norm, existing, canonical_norm
            ))),
            _ => {
                self.alias_to_canonical
                    .insert(alias_norm.to_string(), canonical_norm.to_string());
                Ok(())
            }
        }
    }

    pub fn canonical_for(&self, normalized: &str) -> Option<&str> {
        self.alias_to_canonical.get(normalized).map(String::as_str)
    }

    /// Preferred display name for a canonical key
    pub fn display_for(&self, key: &CanonicalKey) -> Option<&str> {
        self.display.get(key.as_str()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.alias_to_canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alias_to_canonical.is_empty()
    }
}

/// Secondary ordering after usage count when picking a canonical target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    #[default]
    LowestId,
    EarliestCreated,
}

impl FromStr for TieBreak {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "lowest-id" => Ok(TieBreak::LowestId),
            "earliest-created" => Ok(TieBreak::EarliestCreated),
            other => Err(format!(
                "unknown tie-break '{}' (expected lowest-id or earliest-created)",
                other
            )),
        }
    }
}

/// Entities sharing a canonical key within one service group
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateGroup {
    pub key: CanonicalKey,
    pub group_id: Option<String>,
    pub canonical: Entity,
    /// Sorted by id
    pub absorbed: Vec<Entity>,
}

/// Index of the canonical target among `members`
///
/// Highest usage wins; ties go to the tie-break policy, then the smallest id.
/// Independent of input order.
pub fn choose_canonical(members: &[Entity], tie_break: TieBreak) -> Option<usize> {
    members
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            b.usage_count
                .cmp(&a.usage_count)
                .then_with(|| match tie_break {
                    TieBreak::LowestId => std::cmp::Ordering::Equal,
                    TieBreak::EarliestCreated => match (a.created_at, b.created_at) {
                        (Some(x), Some(y)) => x.cmp(&y),
                        (Some(_), None) => std::cmp::Ordering::Less,
                        (None, Some(_)) => std::cmp::Ordering::Greater,
                        (None, None) => std::cmp::Ordering::Equal,
                    },
                })
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|(index, _)| index)
}

/// Group entities by (service group, canonical key)
///
/// Sentinel keys and single-member groups are dropped. Output is ordered by
/// key, then service group.
pub fn group_candidates(
    entities: &[Entity],
    aliases: &AliasMap,
    tie_break: TieBreak,
) -> Vec<CandidateGroup> {
    let mut buckets: BTreeMap<(CanonicalKey, Option<String>), Vec<Entity>> = BTreeMap::new();
    for entity in entities {
        let key = canonical_key(entity, aliases);
        if key.is_sentinel() {
            continue;
        }
        buckets
            .entry((key, entity.group_id.clone()))
            .or_default()
            .push(entity.clone());
    }

    let mut groups = Vec::new();
    for ((key, group_id), mut members) in buckets {
        if members.len() < 2 {
            continue;
        }
        let Some(index) = choose_canonical(&members, tie_break) else {
            continue;
        };
        let canonical = members.swap_remove(index);
        members.sort_by(|a, b| a.id.cmp(&b.id));
        groups.push(CandidateGroup {
            key,
            group_id,
            canonical,
            absorbed: members,
        });
    }
    groups
}

/// Unit targets whose name differs from the alias map's display name
///
/// Covers grouped targets and lone units alike. Skipped when some member
/// already carries the display name, since that member would clash.
pub fn display_renames(
    entities: &[Entity],
    aliases: &AliasMap,
    tie_break: TieBreak,
) -> Vec<(Entity, String)> {
    let mut buckets: BTreeMap<(CanonicalKey, Option<String>), Vec<&Entity>> = BTreeMap::new();
    for entity in entities.iter().filter(|e| e.kind == EntityKind::Unit) {
        let key = canonical_key(entity, aliases);
        if key.is_sentinel() {
            continue;
        }
        buckets
            .entry((key, entity.group_id.clone()))
            .or_default()
            .push(entity);
    }

    let mut renames = Vec::new();
    for ((key, _), members) in buckets {
        let Some(display) = aliases.display_for(&key) else {
            continue;
        };
        if members.iter().any(|m| m.name.trim() == display) {
            continue;
        }
        let owned: Vec<Entity> = members.into_iter().cloned().collect();
        if let Some(index) = choose_canonical(&owned, tie_break) {
            renames.push((owned[index].clone(), display.to_string()));
        }
    }
    renames
}

/// Near-duplicate names that did not share a key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FuzzyPair {
    pub left_id: String,
    pub left_name: String,
    pub right_id: String,
    pub right_name: String,
    pub score: f64,
}

/// Report pairs of differently-keyed names scoring at least `threshold`
///
/// Only compares within a service group. Report-only.
pub fn fuzzy_pairs(entities: &[Entity], aliases: &AliasMap, threshold: f64) -> Vec<FuzzyPair> {
    let keyed: Vec<(&Entity, CanonicalKey)> = entities
        .iter()
        .map(|e| (e, canonical_key(e, aliases)))
        .filter(|(_, key)| !key.is_sentinel())
        .collect();

    let mut pairs = Vec::new();
    for (i, (left, left_key)) in keyed.iter().enumerate() {
        for (right, right_key) in keyed.iter().skip(i + 1) {
            if left.group_id != right.group_id || left_key == right_key {
                continue;
            }
            let score = strsim::normalized_levenshtein(left_key.as_str(), right_key.as_str());
            if score >= threshold {
                let (a, b) = if left.id <= right.id {
                    (left, right)
                } else {
                    (right, left)
                };
                pairs.push(FuzzyPair {
                    left_id: a.id.clone(),
                    left_name: a.name.clone(),
                    right_id: b.id.clone(),
                    right_name: b.name.clone(),
                    score,
                });
            }
        }
    }

    pairs.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.left_id.cmp(&b.left_id))
            .then_with(|| a.right_id.cmp(&b.right_id))
    });
    pairs
}
