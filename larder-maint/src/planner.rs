//! Merge/Patch Planner
//!
//! Turns proposals from the candidate engine or the parser into an ordered,
//! capped list of actions. Filtering against the checkpoint happens here, so
//! the executor only ever sees work that still needs doing.

use crate::checkpoint::CheckpointSnapshot;
use crate::model::{EntityDraft, EntityKind, EntityRef, StructuredIngredient};
use crate::normalize::CandidateGroup;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Whether a stage writes to the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Audit,
    Apply,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Audit => f.write_str("audit"),
            Mode::Apply => f.write_str("apply"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audit" => Ok(Mode::Audit),
            "apply" => Ok(Mode::Apply),
            other => Err(format!("unknown mode '{}' (expected audit or apply)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Merge,
    Delete,
    Create,
    Update,
    Patch,
}

/// Terminal (or pending) outcome of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Applied,
    SkippedCap,
    SkippedAudit,
    Failed,
    /// Parse result below threshold
    Rejected,
    /// Every parse strategy declined
    Exhausted,
    /// Not executed because the run was cancelled or the stage halted
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::SkippedCap => "skipped-cap",
            Outcome::SkippedAudit => "skipped-audit",
            Outcome::Failed => "failed",
            Outcome::Rejected => "rejected",
            Outcome::Exhausted => "exhausted",
            Outcome::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "applied" => Some(Outcome::Applied),
            "skipped-cap" => Some(Outcome::SkippedCap),
            "skipped-audit" => Some(Outcome::SkippedAudit),
            "failed" => Some(Outcome::Failed),
            "rejected" => Some(Outcome::Rejected),
            "exhausted" => Some(Outcome::Exhausted),
            "cancelled" => Some(Outcome::Cancelled),
            _ => None,
        }
    }

    /// Whether a checkpointed outcome keeps an unchanged item from being
    /// proposed again in `mode`
    pub fn suppresses(&self, mode: Mode) -> bool {
        match self {
            Outcome::Applied | Outcome::Rejected | Outcome::Exhausted => true,
            Outcome::SkippedAudit => mode == Mode::Audit,
            Outcome::SkippedCap | Outcome::Failed | Outcome::Cancelled => false,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an action does when applied
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionPayload {
    Merge {
        kind: EntityKind,
        canonical_id: String,
        canonical_name: String,
        absorbed_id: String,
        absorbed_name: String,
    },
    Delete {
        kind: EntityKind,
        id: String,
        name: String,
    },
    Create {
        kind: EntityKind,
        draft: EntityDraft,
    },
    Update {
        kind: EntityKind,
        id: String,
        draft: EntityDraft,
    },
    PatchIngredients {
        slug: String,
        recipe_name: String,
        ingredients: Vec<StructuredIngredient>,
        strategies: Vec<String>,
    },
    AssignTaxonomy {
        slug: String,
        recipe_name: String,
        categories: Vec<EntityRef>,
        tags: Vec<EntityRef>,
    },
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::Merge { .. } => ActionKind::Merge,
            ActionPayload::Delete { .. } => ActionKind::Delete,
            ActionPayload::Create { .. } => ActionKind::Create,
            ActionPayload::Update { .. } => ActionKind::Update,
            ActionPayload::PatchIngredients { .. } | ActionPayload::AssignTaxonomy { .. } => {
                ActionKind::Patch
            }
        }
    }

    /// Short human-readable description for logs and reports
    pub fn describe(&self) -> String {
        match self {
            ActionPayload::Merge {
                kind,
                canonical_name,
                absorbed_name,
                ..
            } => format!("merge {} '{}' -> '{}'", kind, absorbed_name, canonical_name),
            ActionPayload::Delete { kind, name, .. } => format!("delete {} '{}'", kind, name),
            ActionPayload::Create { kind, draft } => format!("create {} '{}'", kind, draft.name),
            ActionPayload::Update { kind, draft, .. } => {
                format!("update {} -> '{}'", kind, draft.name)
            }
            ActionPayload::PatchIngredients {
                slug, ingredients, ..
            } => format!("patch {} ({} ingredients)", slug, ingredients.len()),
            ActionPayload::AssignTaxonomy {
                slug,
                categories,
                tags,
                ..
            } => format!(
                "assign {} ({} categories, {} tags)",
                slug,
                categories.len(),
                tags.len()
            ),
        }
    }
}

/// Work proposed by an engine, before planning
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    /// Checkpoint key: entity id, recipe id or a synthetic create key
    pub item_id: String,
    /// Fingerprint of the input state that produced this proposal
    pub state_key: String,
    /// Proposals sharing a serial key never run concurrently
    pub serial_key: String,
    pub payload: ActionPayload,
}

/// A planned unit of work
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    pub item_id: String,
    pub state_key: String,
    pub serial_key: String,
    pub kind: ActionKind,
    pub mode: Mode,
    pub payload: ActionPayload,
}

/// Planner output
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Actions to hand to the executor, in execution order
    pub actions: Vec<Action>,
    /// Over the cap; eligible again next run
    pub deferred: Vec<Action>,
    /// Proposals dropped because the checkpoint already covers them
    pub already_processed: usize,
}

impl Plan {
    /// Proposals that survived checkpoint filtering
    pub fn proposed(&self) -> usize {
        self.actions.len() + self.deferred.len()
    }
}

/// Build the plan for one stage run
///
/// Checkpointed proposals are dropped, the rest are sorted by item id and
/// truncated to `max_actions`. A cap of zero or less yields an empty plan
/// (everything deferred).
pub fn plan(
    proposals: Vec<Proposal>,
    mode: Mode,
    max_actions: i64,
    checkpoint: &CheckpointSnapshot,
) -> Plan {
    let mut already_processed = 0usize;
    let mut pending: Vec<Action> = Vec::with_capacity(proposals.len());

    for proposal in proposals {
        if checkpoint.suppresses(&proposal.item_id, &proposal.state_key, mode) {
            already_processed += 1;
            continue;
        }
        pending.push(Action {
            kind: proposal.payload.kind(),
            item_id: proposal.item_id,
            state_key: proposal.state_key,
            serial_key: proposal.serial_key,
            mode,
            payload: proposal.payload,
        });
    }

    pending.sort_by(|a, b| a.item_id.cmp(&b.item_id));
    pending.dedup_by(|later, earlier| later.item_id == earlier.item_id);

    let cap = usize::try_from(max_actions.max(0)).unwrap_or(usize::MAX);
    let deferred = if pending.len() > cap {
        pending.split_off(cap)
    } else {
        Vec::new()
    };

    Plan {
        actions: pending,
        deferred,
        already_processed,
    }
}

/// Merge proposals for every absorbed member of every group
///
/// Food and unit merges serialize per canonical target; organizer merges
/// serialize per kind.
pub fn merge_proposals(groups: &[CandidateGroup]) -> Vec<Proposal> {
    let mut proposals = Vec::new();
    for group in groups {
        for absorbed in &group.absorbed {
            proposals.push(Proposal {
                item_id: absorbed.id.clone(),
                state_key: fingerprint(&[
                    "merge",
                    group.canonical.kind.as_str(),
                    group.key.as_str(),
                    &group.canonical.id,
                    &absorbed.name,
                ]),
                serial_key: group
                    .canonical
                    .kind
                    .organizer_serial_key()
                    .unwrap_or_else(|| group.canonical.id.clone()),
                payload: ActionPayload::Merge {
                    kind: group.canonical.kind,
                    canonical_id: group.canonical.id.clone(),
                    canonical_name: group.canonical.name.clone(),
                    absorbed_id: absorbed.id.clone(),
                    absorbed_name: absorbed.name.clone(),
                },
            });
        }
    }
    proposals
}

/// Stable hex fingerprint of a proposal's input state
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    digest.iter().take(16).map(|b| format!("{:02x}", b)).collect()
}
