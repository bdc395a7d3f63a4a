//! Categories and tags: duplicate merges, seeded names, noisy tag cleanup

use super::{Stage, StageContext, StageName, StageRun, StageWork};
use crate::error::StageError;
use crate::model::{Entity, EntityDraft, EntityKind};
use crate::normalize::{canonical_key, group_candidates, key_for_name, AliasMap, CandidateGroup};
use crate::planner::{fingerprint, merge_proposals, ActionPayload, Proposal};
use crate::report::StageReport;
use async_trait::async_trait;
use std::collections::HashSet;

pub struct TaxonomyStage;

#[async_trait]
impl Stage for TaxonomyStage {
    fn name(&self) -> StageName {
        StageName::Taxonomy
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport, StageError> {
        if ctx.cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let categories = ctx.service.list_entities(EntityKind::Category).await?;
        let tags = ctx.service.list_entities(EntityKind::Tag).await?;

        let settings = TaxonomySettings {
            aliases: &ctx.inputs.aliases,
            tie_break: ctx.config.pipeline.tie_break,
            category_seeds: &ctx.inputs.category_seeds,
            tag_seeds: &ctx.inputs.tag_seeds,
            delete_unused_noisy: ctx.config.taxonomy.delete_unused_noisy,
            tag_max_name_length: ctx.config.taxonomy.tag_max_name_length,
        };
        let work = taxonomy_work(&categories, &tags, &settings);

        let run = StageRun::open(ctx, StageName::Taxonomy).await?;
        run.execute(ctx, work, Vec::new()).await
    }
}

pub struct TaxonomySettings<'a> {
    pub aliases: &'a AliasMap,
    pub tie_break: crate::normalize::TieBreak,
    pub category_seeds: &'a [String],
    pub tag_seeds: &'a [String],
    pub delete_unused_noisy: bool,
    pub tag_max_name_length: usize,
}

pub fn taxonomy_work(categories: &[Entity], tags: &[Entity], settings: &TaxonomySettings<'_>) -> StageWork {
    let mut work = StageWork {
        evaluated: categories.len() + tags.len(),
        ..Default::default()
    };

    let category_groups = group_candidates(categories, settings.aliases, settings.tie_break);
    let tag_groups = group_candidates(tags, settings.aliases, settings.tie_break);
    work.finding("category_duplicate_groups", category_groups.len() as u64);
    work.finding("tag_duplicate_groups", tag_groups.len() as u64);
    work.proposals.extend(merge_proposals(&category_groups));
    work.proposals.extend(merge_proposals(&tag_groups));

    let seeded_categories = seed_proposals(EntityKind::Category, categories, settings.category_seeds, settings.aliases);
    let seeded_tags = seed_proposals(EntityKind::Tag, tags, settings.tag_seeds, settings.aliases);
    work.finding("missing_seed_categories", seeded_categories.len() as u64);
    work.finding("missing_seed_tags", seeded_tags.len() as u64);
    work.proposals.extend(seeded_categories);
    work.proposals.extend(seeded_tags);

    work.finding(
        "unused_categories",
        categories.iter().filter(|c| c.usage_count == 0).count() as u64,
    );
    work.finding(
        "unused_tags",
        tags.iter().filter(|t| t.usage_count == 0).count() as u64,
    );

    let noisy = noisy_tags(tags, &tag_groups, settings.tag_max_name_length);
    work.finding("noisy_tags", noisy.len() as u64);
    if settings.delete_unused_noisy {
        work.proposals.extend(noisy.into_iter().map(|tag| Proposal {
            item_id: tag.id.clone(),
            state_key: fingerprint(&["delete", "tag", &tag.id, &tag.name]),
            serial_key: EntityKind::Tag
                .organizer_serial_key()
                .unwrap_or_else(|| tag.id.clone()),
            payload: ActionPayload::Delete {
                kind: EntityKind::Tag,
                id: tag.id.clone(),
                name: tag.name.clone(),
            },
        }));
    }

    work
}

/// Create proposals for seed names with no existing entity of the same key
pub(crate) fn seed_proposals(kind: EntityKind, existing: &[Entity], seeds: &[String], aliases: &AliasMap) -> Vec<Proposal> {
    let mut known: HashSet<String> = existing
        .iter()
        .map(|e| canonical_key(e, aliases))
        .filter(|k| !k.is_sentinel())
        .map(|k| k.as_str().to_string())
        .collect();

    let mut proposals = Vec::new();
    for seed in seeds {
        let key = key_for_name(seed, kind, aliases);
        if key.is_sentinel() || !known.insert(key.as_str().to_string()) {
            continue;
        }
        let item_id = format!("create:{}:{}", kind, key.as_str());
        proposals.push(Proposal {
            state_key: fingerprint(&["create", kind.as_str(), key.as_str()]),
            serial_key: item_id.clone(),
            item_id,
            payload: ActionPayload::Create {
                kind,
                draft: EntityDraft::named(seed.trim()),
            },
        });
    }
    proposals
}

/// Unused tags with overlong names, excluding merge group members
fn noisy_tags<'a>(tags: &'a [Entity], groups: &[CandidateGroup], max_len: usize) -> Vec<&'a Entity> {
    let grouped: HashSet<&str> = groups
        .iter()
        .flat_map(|g| std::iter::once(&g.canonical).chain(g.absorbed.iter()))
        .map(|e| e.id.as_str())
        .collect();

    tags.iter()
        .filter(|t| t.usage_count == 0)
        .filter(|t| t.name.trim().chars().count() > max_len)
        .filter(|t| !grouped.contains(t.id.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::TieBreak;
    use crate::planner::ActionKind;

    fn settings<'a>(aliases: &'a AliasMap, seeds: &'a [String], delete: bool) -> TaxonomySettings<'a> {
        TaxonomySettings {
            aliases,
            tie_break: TieBreak::LowestId,
            category_seeds: seeds,
            tag_seeds: &[],
            delete_unused_noisy: delete,
            tag_max_name_length: 24,
        }
    }

    #[test]
    fn test_taxonomy_proposals() {
        let categories = vec![
            Entity::new(EntityKind::Category, "c1", "Dinner").with_usage(10),
            Entity::new(EntityKind::Category, "c2", "dinner!").with_usage(1),
            Entity::new(EntityKind::Category, "c3", "Dessert").with_usage(3),
        ];
        let tags = vec![
            Entity::new(EntityKind::Tag, "t1", "quick").with_usage(4),
            Entity::new(EntityKind::Tag, "t2", "imported from some random website today"),
            Entity::new(EntityKind::Tag, "t3", "short"),
        ];
        let aliases = AliasMap::new();
        let seeds = vec!["Breakfast".to_string(), "DESSERT".to_string(), "breakfast".to_string()];

        let work = taxonomy_work(&categories, &tags, &settings(&aliases, &seeds, true));
        let kinds: Vec<(String, ActionKind)> = work
            .proposals
            .iter()
            .map(|p| (p.item_id.clone(), p.payload.kind()))
            .collect();

        assert_eq!(
            kinds,
            vec![
                ("c2".to_string(), ActionKind::Merge),
                ("create:category:breakfast".to_string(), ActionKind::Create),
                ("t2".to_string(), ActionKind::Delete),
            ]
        );
        assert_eq!(work.findings["unused_tags"], 2);
        assert_eq!(work.findings["noisy_tags"], 1);
    }

    #[test]
    fn test_noisy_tags_only_deleted_when_enabled() {
        let tags = vec![Entity::new(
            EntityKind::Tag,
            "t9",
            "a very long tag name that nobody uses",
        )];
        let aliases = AliasMap::new();
        let work = taxonomy_work(&[], &tags, &settings(&aliases, &[], false));
        assert!(work.proposals.is_empty());
        assert_eq!(work.findings["noisy_tags"], 1);
    }
}
