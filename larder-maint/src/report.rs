//! Run Report
//!
//! Per-stage counts, failures and findings, written once per run as
//! `maintenance_report.json` and summarised through tracing.

use crate::executor::{ActionRecord, Execution};
use crate::planner::{Mode, Outcome};
use crate::stages::StageName;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const REPORT_FILE_NAME: &str = "maintenance_report.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    Completed,
    Failed,
    NotRun,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::NotRun => "not-run",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    /// Entities or recipes looked at
    pub evaluated: usize,
    /// Actions planned this run (cap applied)
    pub proposed: usize,
    pub applied: usize,
    /// Audit records plus cap-deferred actions
    pub skipped: usize,
    pub failed: usize,
    pub already_processed: usize,
    /// Left for a later run by the action cap
    pub deferred: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub item_id: String,
    pub description: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: StageName,
    pub status: StageStatus,
    pub mode: Mode,
    pub counts: StageCounts,
    pub failures: Vec<ItemFailure>,
    pub findings: BTreeMap<String, u64>,
    pub notes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageReport {
    pub fn new(stage: StageName, mode: Mode) -> Self {
        Self {
            stage,
            status: StageStatus::Completed,
            mode,
            counts: StageCounts::default(),
            failures: Vec::new(),
            findings: BTreeMap::new(),
            notes: Vec::new(),
            actions: Vec::new(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn not_run(stage: StageName, mode: Mode) -> Self {
        Self {
            status: StageStatus::NotRun,
            ..Self::new(stage, mode)
        }
    }

    /// Stage-level error: nothing about its items can be trusted
    pub fn failed(stage: StageName, mode: Mode, error: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failed,
            error: Some(error.into()),
            ..Self::new(stage, mode)
        }
    }

    /// Fold executor records into the counts
    ///
    /// A halted execution marks the stage failed.
    pub fn absorb_execution(&mut self, execution: Execution) {
        self.counts.applied += execution.count(Outcome::Applied);
        self.counts.failed += execution.count(Outcome::Failed);
        self.counts.deferred += execution.count(Outcome::SkippedCap);
        self.counts.skipped +=
            execution.count(Outcome::SkippedAudit) + execution.count(Outcome::SkippedCap);
        self.failures.extend(execution.failures().map(|r| ItemFailure {
            item_id: r.item_id.clone(),
            description: r.description.clone(),
            error: r.error.clone().unwrap_or_default(),
        }));

        let cancelled = execution.count(Outcome::Cancelled);
        if execution.halted {
            self.status = StageStatus::Failed;
            self.error = Some(format!(
                "halted after item failure ({} action(s) not started)",
                cancelled
            ));
        } else if cancelled > 0 {
            self.notes
                .push(format!("{} action(s) not started: run cancelled", cancelled));
        }
        self.actions = execution.records;
    }

    pub fn add_finding(&mut self, key: impl Into<String>, value: u64) {
        *self.findings.entry(key.into()).or_insert(0) += value;
    }

    /// Failed stage, or any failed item
    pub fn has_failures(&self) -> bool {
        self.status == StageStatus::Failed || self.counts.failed > 0
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Running,
    Completed,
    Halted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: PipelineState,
    pub audit_only: bool,
    pub stages: Vec<StageReport>,
}

impl RunReport {
    pub fn new(audit_only: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            state: PipelineState::Idle,
            audit_only,
            stages: Vec::new(),
        }
    }

    pub fn stage(&self, name: StageName) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == name)
    }

    /// 0 only for a completed run with no failed stage and no failed item
    pub fn exit_code(&self) -> u8 {
        let clean = self.state == PipelineState::Completed
            && self.stages.iter().all(|s| !s.has_failures());
        if clean {
            0
        } else {
            1
        }
    }

    pub fn write_json(&self, dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(REPORT_FILE_NAME);
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, content)?;
        Ok(path)
    }

    pub fn log_summary(&self) {
        for stage in &self.stages {
            let c = &stage.counts;
            tracing::info!(
                stage = %stage.stage,
                status = %stage.status,
                mode = %stage.mode,
                evaluated = c.evaluated,
                proposed = c.proposed,
                applied = c.applied,
                skipped = c.skipped,
                failed = c.failed,
                already_processed = c.already_processed,
                "Stage summary"
            );
            for (finding, value) in &stage.findings {
                tracing::info!(stage = %stage.stage, finding = %finding, value, "Finding");
            }
        }
        tracing::info!(
            run_id = %self.run_id,
            state = ?self.state,
            exit_code = self.exit_code(),
            "Maintenance run finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ActionKind;

    fn record(item: &str, outcome: Outcome) -> ActionRecord {
        ActionRecord {
            item_id: item.to_string(),
            kind: ActionKind::Merge,
            mode: Mode::Apply,
            description: format!("merge {}", item),
            outcome,
            error: (outcome == Outcome::Failed).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn test_absorb_execution_counts() {
        let mut report = StageReport::new(StageName::Foods, Mode::Apply);
        report.absorb_execution(Execution {
            records: vec![
                record("a", Outcome::Applied),
                record("b", Outcome::Failed),
                record("c", Outcome::SkippedCap),
            ],
            halted: false,
        });
        assert_eq!(report.counts.applied, 1);
        assert_eq!(report.counts.failed, 1);
        assert_eq!(report.counts.skipped, 1);
        assert_eq!(report.counts.deferred, 1);
        assert_eq!(report.failures[0].error, "boom");
        assert_eq!(report.status, StageStatus::Completed);
        assert!(report.has_failures());
    }

    #[test]
    fn test_halted_execution_fails_stage() {
        let mut report = StageReport::new(StageName::Units, Mode::Apply);
        report.absorb_execution(Execution {
            records: vec![record("a", Outcome::Failed), record("b", Outcome::Cancelled)],
            halted: true,
        });
        assert_eq!(report.status, StageStatus::Failed);
        assert!(report.error.as_deref().unwrap().contains("1 action"));
    }

    #[test]
    fn test_exit_code() {
        let mut run = RunReport::new(false);
        run.state = PipelineState::Completed;
        run.stages.push(StageReport::new(StageName::Audit, Mode::Audit));
        assert_eq!(run.exit_code(), 0);

        run.stages
            .push(StageReport::failed(StageName::Foods, Mode::Apply, "down"));
        assert_eq!(run.exit_code(), 1);

        let mut halted = RunReport::new(false);
        halted.state = PipelineState::Halted;
        assert_eq!(halted.exit_code(), 1);
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = RunReport::new(true);
        run.stages.push(StageReport::not_run(StageName::Parse, Mode::Audit));
        let path = run.write_json(dir.path()).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["audit_only"], true);
        assert_eq!(value["stages"][0]["status"], "not-run");
        assert_eq!(value["stages"][0]["stage"], "parse");
    }
}
