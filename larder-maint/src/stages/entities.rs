//! Duplicate merge for foods, units and tools
//!
//! The tools stage also creates tools listed in its seed file.

use super::taxonomy::seed_proposals;
use super::{Stage, StageContext, StageName, StageRun, StageWork};
use crate::error::StageError;
use crate::model::{Entity, EntityDraft, EntityKind};
use crate::normalize::{display_renames, fuzzy_pairs, group_candidates};
use crate::planner::{fingerprint, merge_proposals, ActionPayload, Proposal};
use crate::report::StageReport;
use async_trait::async_trait;

/// Fuzzy pairs listed individually in the report notes
const MAX_FUZZY_NOTES: usize = 50;

pub struct DedupStage {
    stage: StageName,
    kind: EntityKind,
}

impl DedupStage {
    pub fn new(stage: StageName, kind: EntityKind) -> Self {
        Self { stage, kind }
    }
}

#[async_trait]
impl Stage for DedupStage {
    fn name(&self) -> StageName {
        self.stage
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport, StageError> {
        if ctx.cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let entities = ctx.service.list_entities(self.kind).await?;
        let mut work = dedup_work(self.kind, &entities, ctx);
        tracing::info!(
            stage = %self.stage,
            entities = entities.len(),
            proposals = work.proposals.len(),
            "Duplicate scan complete"
        );

        if self.kind == EntityKind::Food && ctx.config.foods.allow_fuzzy {
            let pairs = fuzzy_pairs(&entities, &ctx.inputs.aliases, ctx.config.foods.fuzzy_threshold);
            work.finding("fuzzy_pairs", pairs.len() as u64);
            for pair in pairs.iter().take(MAX_FUZZY_NOTES) {
                work.notes.push(format!(
                    "possible duplicate: '{}' ({}) ~ '{}' ({}) score {:.2}",
                    pair.left_name, pair.left_id, pair.right_name, pair.right_id, pair.score
                ));
            }
        }

        let run = StageRun::open(ctx, self.stage).await?;
        run.execute(ctx, work, Vec::new()).await
    }
}

/// Merge proposals, plus display renames for units and seeds for tools
pub fn dedup_work(kind: EntityKind, entities: &[Entity], ctx: &StageContext) -> StageWork {
    let tie_break = ctx.config.pipeline.tie_break;
    let groups = group_candidates(entities, &ctx.inputs.aliases, tie_break);

    let mut work = StageWork {
        evaluated: entities.len(),
        ..Default::default()
    };
    work.finding("duplicate_groups", groups.len() as u64);
    work.finding(
        "absorbable",
        groups.iter().map(|g| g.absorbed.len() as u64).sum(),
    );
    work.proposals = merge_proposals(&groups);

    if kind == EntityKind::Unit {
        let renames = display_renames(entities, &ctx.inputs.aliases, tie_break);
        work.finding("display_renames", renames.len() as u64);
        work.proposals
            .extend(renames.into_iter().map(|(target, display)| rename_proposal(&target, display)));
    }

    if kind == EntityKind::Tool {
        let seeded = seed_proposals(kind, entities, &ctx.inputs.tool_seeds, &ctx.inputs.aliases);
        work.finding("missing_seed_tools", seeded.len() as u64);
        work.proposals.extend(seeded);
    }
    work
}

fn rename_proposal(target: &Entity, display: String) -> Proposal {
    Proposal {
        item_id: format!("rename:{}", target.id),
        state_key: fingerprint(&["rename", &target.id, &target.name, &display]),
        // Same serial key as merges into this unit
        serial_key: target.id.clone(),
        payload: ActionPayload::Update {
            kind: target.kind,
            id: target.id.clone(),
            draft: EntityDraft {
                name: display,
                group_id: target.group_id.clone(),
                attributes: target.attributes.clone(),
            },
        },
    }
}
