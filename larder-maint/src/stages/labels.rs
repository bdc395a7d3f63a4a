//! Shopping-list label sync from a JSON file
//!
//! Labels listed in the file are created when missing. With `replace` the
//! labels the file does not list are deleted.

use super::{load_name_list, Stage, StageContext, StageName, StageRun, StageWork};
use crate::error::StageError;
use crate::model::{Entity, EntityDraft, EntityKind};
use crate::normalize::normalize_name;
use crate::planner::{fingerprint, ActionPayload, Proposal};
use crate::report::StageReport;
use async_trait::async_trait;
use larder_common::{Error, Result};
use std::collections::HashSet;
use std::path::Path;

/// Read the labels file, dropping names that normalize alike
pub fn load_label_names(path: &Path) -> Result<Vec<String>> {
    let names = dedup_names(load_name_list(path)?);
    if names.is_empty() {
        return Err(Error::Config(format!("Labels file {} lists no labels", path.display())));
    }
    Ok(names)
}

fn dedup_names(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter(|name| {
            let key = normalize_name(name);
            !key.is_empty() && seen.insert(key)
        })
        .collect()
}

pub struct LabelStage;

#[async_trait]
impl Stage for LabelStage {
    fn name(&self) -> StageName {
        StageName::Labels
    }

    async fn run(&self, ctx: &StageContext) -> std::result::Result<StageReport, StageError> {
        if ctx.cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let Some(desired) = ctx.inputs.labels.as_ref() else {
            let mut report = StageReport::new(StageName::Labels, ctx.mode);
            report.notes.push("no labels file configured".to_string());
            return Ok(report);
        };

        let existing = ctx.service.list_entities(EntityKind::Label).await?;
        let work = sync_work(desired, &existing, ctx.config.labels.replace);

        let run = StageRun::open(ctx, StageName::Labels).await?;
        run.execute(ctx, work, Vec::new()).await
    }
}

pub fn sync_work(desired: &[String], existing: &[Entity], replace: bool) -> StageWork {
    let present: HashSet<String> = existing
        .iter()
        .map(|e| normalize_name(&e.name))
        .filter(|k| !k.is_empty())
        .collect();

    let mut work = StageWork {
        evaluated: desired.len(),
        ..Default::default()
    };
    let mut unchanged = 0u64;

    for name in desired {
        let key = normalize_name(name);
        if present.contains(&key) {
            unchanged += 1;
            continue;
        }
        let item_id = format!("create:label:{}", key);
        work.proposals.push(Proposal {
            state_key: fingerprint(&["create", "label", &key]),
            serial_key: item_id.clone(),
            item_id,
            payload: ActionPayload::Create {
                kind: EntityKind::Label,
                draft: EntityDraft::named(name.trim()),
            },
        });
    }
    work.finding("labels_unchanged", unchanged);

    let wanted: HashSet<String> = desired.iter().map(|n| normalize_name(n)).collect();
    let extras: Vec<&Entity> = existing
        .iter()
        .filter(|e| !wanted.contains(&normalize_name(&e.name)))
        .collect();
    work.finding("labels_not_in_file", extras.len() as u64);

    if replace {
        for extra in extras {
            work.proposals.push(Proposal {
                item_id: extra.id.clone(),
                state_key: fingerprint(&["delete", "label", &extra.id, &extra.name]),
                serial_key: extra.id.clone(),
                payload: ActionPayload::Delete {
                    kind: EntityKind::Label,
                    id: extra.id.clone(),
                    name: extra.name.clone(),
                },
            });
        }
    }
    work
}
