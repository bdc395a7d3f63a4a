//! Cookbook sync from a JSON file
//!
//! Desired cookbooks are matched to existing ones by case-insensitive name.
//! Missing ones are created, changed ones updated, and with `replace` the
//! cookbooks not listed in the file are deleted.

use super::{Stage, StageContext, StageName, StageRun, StageWork};
use crate::error::StageError;
use crate::model::{Entity, EntityDraft, EntityKind};
use crate::planner::{fingerprint, ActionPayload, Proposal};
use crate::report::StageReport;
use async_trait::async_trait;
use larder_common::{Error, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct CookbookSpec {
    pub name: String,
    pub description: String,
    pub query_filter_string: String,
    pub public: bool,
    pub position: i64,
}

impl CookbookSpec {
    fn attributes(&self) -> Value {
        json!({
            "description": self.description,
            "queryFilterString": self.query_filter_string,
            "public": self.public,
            "position": self.position,
        })
    }

    fn draft(&self, group_id: Option<String>) -> EntityDraft {
        EntityDraft {
            name: self.name.clone(),
            group_id,
            attributes: self.attributes(),
        }
    }

    /// Whether an existing cookbook differs from this spec
    pub fn differs_from(&self, existing: &Entity) -> bool {
        let attr = &existing.attributes;
        let text = |key: &str| attr.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        existing.name.trim() != self.name
            || text("description") != self.description
            || text("queryFilterString") != self.query_filter_string
            || attr.get("public").and_then(Value::as_bool).unwrap_or(false) != self.public
            || attr.get("position").and_then(Value::as_i64).unwrap_or(0) != self.position
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCookbook {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    query_filter_string: String,
    #[serde(default)]
    public: bool,
    position: Option<i64>,
}

/// Read the cookbook file: a JSON array of cookbook objects
///
/// Position defaults to the 1-based index in the file.
pub fn load_cookbook_specs(path: &Path) -> Result<Vec<CookbookSpec>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    parse_cookbook_specs(&content)
        .map_err(|e| Error::Config(format!("Cookbook file {}: {}", path.display(), e)))
}

pub fn parse_cookbook_specs(content: &str) -> std::result::Result<Vec<CookbookSpec>, String> {
    let raw: Vec<RawCookbook> = serde_json::from_str(content).map_err(|e| e.to_string())?;
    raw.into_iter()
        .enumerate()
        .map(|(index, item)| {
            let name = item.name.trim().to_string();
            if name.is_empty() {
                return Err(format!("cookbook #{} has no name", index + 1));
            }
            Ok(CookbookSpec {
                name,
                description: item.description,
                query_filter_string: item.query_filter_string,
                public: item.public,
                position: item.position.unwrap_or(index as i64 + 1),
            })
        })
        .collect()
}

pub struct CookbookStage;

#[async_trait]
impl Stage for CookbookStage {
    fn name(&self) -> StageName {
        StageName::Cookbooks
    }

    async fn run(&self, ctx: &StageContext) -> std::result::Result<StageReport, StageError> {
        if ctx.cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let Some(desired) = ctx.inputs.cookbooks.as_ref() else {
            let mut report = StageReport::new(StageName::Cookbooks, ctx.mode);
            report.notes.push("no cookbook file configured".to_string());
            return Ok(report);
        };

        let existing = ctx.service.list_entities(EntityKind::Cookbook).await?;
        let work = sync_work(desired, &existing, ctx.config.cookbooks.replace);

        let run = StageRun::open(ctx, StageName::Cookbooks).await?;
        run.execute(ctx, work, Vec::new()).await
    }
}

pub fn sync_work(desired: &[CookbookSpec], existing: &[Entity], replace: bool) -> StageWork {
    let by_name: HashMap<String, &Entity> = existing
        .iter()
        .filter(|e| !e.name.trim().is_empty())
        .map(|e| (e.name.trim().to_lowercase(), e))
        .collect();

    let mut work = StageWork {
        evaluated: desired.len(),
        ..Default::default()
    };
    let mut unchanged = 0u64;

    for spec in desired {
        let key = spec.name.to_lowercase();
        let attributes = spec.attributes().to_string();
        match by_name.get(&key) {
            None => {
                let item_id = format!("create:cookbook:{}", key);
                work.proposals.push(Proposal {
                    state_key: fingerprint(&["create", "cookbook", &spec.name, &attributes]),
                    serial_key: item_id.clone(),
                    item_id,
                    payload: ActionPayload::Create {
                        kind: EntityKind::Cookbook,
                        draft: spec.draft(None),
                    },
                });
            }
            Some(current) if spec.differs_from(current) => {
                work.proposals.push(Proposal {
                    item_id: current.id.clone(),
                    state_key: fingerprint(&["update", "cookbook", &current.id, &spec.name, &attributes]),
                    serial_key: current.id.clone(),
                    payload: ActionPayload::Update {
                        kind: EntityKind::Cookbook,
                        id: current.id.clone(),
                        draft: spec.draft(current.group_id.clone()),
                    },
                });
            }
            Some(_) => unchanged += 1,
        }
    }
    work.finding("cookbooks_unchanged", unchanged);

    let wanted: Vec<String> = desired.iter().map(|s| s.name.to_lowercase()).collect();
    let extras: Vec<&Entity> = existing
        .iter()
        .filter(|e| !wanted.contains(&e.name.trim().to_lowercase()))
        .collect();
    work.finding("cookbooks_not_in_file", extras.len() as u64);

    if replace {
        for extra in extras {
            work.proposals.push(Proposal {
                item_id: extra.id.clone(),
                state_key: fingerprint(&["delete", "cookbook", &extra.id, &extra.name]),
                serial_key: extra.id.clone(),
                payload: ActionPayload::Delete {
                    kind: EntityKind::Cookbook,
                    id: extra.id.clone(),
                    name: extra.name.clone(),
                },
            });
        }
    }
    work
}
