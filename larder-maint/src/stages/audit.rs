//! Read-only health check over the whole collection

use super::{Stage, StageContext, StageName};
use crate::error::StageError;
use crate::model::{EntityKind, Recipe};
use crate::normalize::group_candidates;
use crate::report::StageReport;
use async_trait::async_trait;

const AUDITED_KINDS: [EntityKind; 5] = [
    EntityKind::Food,
    EntityKind::Unit,
    EntityKind::Tool,
    EntityKind::Category,
    EntityKind::Tag,
];

pub struct AuditStage;

#[async_trait]
impl Stage for AuditStage {
    fn name(&self) -> StageName {
        StageName::Audit
    }

    /// Never proposes actions and never opens a checkpoint
    async fn run(&self, ctx: &StageContext) -> Result<StageReport, StageError> {
        let mut report = StageReport::new(StageName::Audit, ctx.mode);
        let tie_break = ctx.config.pipeline.tie_break;

        for kind in AUDITED_KINDS {
            if ctx.cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            let entities = ctx.service.list_entities(kind).await?;
            report.counts.evaluated += entities.len();

            let groups = group_candidates(&entities, &ctx.inputs.aliases, tie_break);
            report.add_finding(format!("{}_duplicate_groups", kind), groups.len() as u64);
            report.add_finding(
                format!("{}_absorbable", kind),
                groups.iter().map(|g| g.absorbed.len() as u64).sum(),
            );
            if kind.is_organizer() {
                report.add_finding(
                    format!("{}_unused", kind),
                    entities.iter().filter(|e| e.usage_count == 0).count() as u64,
                );
            }
        }

        let recipes = ctx.service.list_recipes().await?;
        report.counts.evaluated += recipes.len();
        record_recipe_findings(&mut report, &recipes);

        tracing::info!(
            findings = report.findings.len(),
            evaluated = report.counts.evaluated,
            "Audit complete"
        );
        Ok(report)
    }
}

fn record_recipe_findings(report: &mut StageReport, recipes: &[Recipe]) {
    let count = |pred: fn(&Recipe) -> bool| recipes.iter().filter(|r| pred(r)).count() as u64;
    report.add_finding("recipes_total", recipes.len() as u64);
    report.add_finding("recipes_missing_categories", count(|r| r.categories.is_empty()));
    report.add_finding("recipes_missing_tags", count(|r| r.tags.is_empty()));
    report.add_finding("recipes_needing_parse", count(|r| !r.has_parsed_ingredients));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityRef;
    use crate::planner::Mode;

    #[test]
    fn test_recipe_findings() {
        let tagged = Recipe {
            id: "r1".into(),
            tags: vec![EntityRef {
                id: "t1".into(),
                name: "Quick".into(),
                slug: None,
            }],
            has_parsed_ingredients: true,
            ..Default::default()
        };
        let bare = Recipe {
            id: "r2".into(),
            ..Default::default()
        };
        let mut report = StageReport::new(StageName::Audit, Mode::Audit);
        record_recipe_findings(&mut report, &[tagged, bare]);

        assert_eq!(report.findings["recipes_total"], 2);
        assert_eq!(report.findings["recipes_missing_categories"], 2);
        assert_eq!(report.findings["recipes_missing_tags"], 1);
        assert_eq!(report.findings["recipes_needing_parse"], 1);
    }
}
