//! Pipeline Orchestrator
//!
//! Runs the configured stages strictly in order. Configuration and input
//! files are validated in [`Pipeline::new`], before any stage can write.
//! Without `continue_on_error` the first failed stage halts the run and the
//! remaining stages are reported `not-run`.

use crate::client::RecipeService;
use crate::config::MaintConfig;
use crate::error::StageError;
use crate::report::{PipelineState, RunReport, StageReport, StageStatus};
use crate::stages::categorize::Categorizer;
use crate::stages::{build_stage, StageContext, StageInputs, StageName};
use chrono::Utc;
use larder_common::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct Pipeline {
    service: Arc<dyn RecipeService>,
    config: Arc<MaintConfig>,
    order: Vec<StageName>,
    inputs: Arc<StageInputs>,
    categorizer: Option<Arc<dyn Categorizer>>,
}

impl Pipeline {
    /// Validate the configuration and load stage input files
    pub fn new(service: Arc<dyn RecipeService>, config: MaintConfig) -> Result<Self> {
        let order = config.validate()?;
        let inputs = StageInputs::load(&config, &order)?;
        Ok(Self {
            service,
            config: Arc::new(config),
            order,
            inputs: Arc::new(inputs),
            categorizer: None,
        })
    }

    /// Replace the keyword categorizer
    pub fn with_categorizer(mut self, categorizer: Arc<dyn Categorizer>) -> Self {
        self.categorizer = Some(categorizer);
        self
    }

    pub fn order(&self) -> &[StageName] {
        &self.order
    }

    pub fn config(&self) -> &MaintConfig {
        &self.config
    }

    /// Run every stage and write the run report
    ///
    /// Cancelling `cancel` (or reaching the configured deadline) stops new
    /// actions from starting; stages after that point are not run.
    pub async fn run(&self, cancel: CancellationToken) -> RunReport {
        let pipeline = &self.config.pipeline;
        let run_cancel = cancel.child_token();
        // Stops the deadline timer when the run ends
        let _guard = run_cancel.clone().drop_guard();
        if let Some(seconds) = pipeline.deadline_seconds {
            spawn_deadline(run_cancel.clone(), Duration::from_secs(seconds));
        }

        let mut report = RunReport::new(pipeline.audit_only);
        report.state = PipelineState::Running;
        tracing::info!(
            run_id = %report.run_id,
            stages = ?self.order,
            audit_only = pipeline.audit_only,
            max_actions = pipeline.max_actions_per_stage,
            "Starting maintenance run"
        );

        for (index, &name) in self.order.iter().enumerate() {
            let mode = self.config.mode_for(name);
            if run_cancel.is_cancelled() {
                tracing::warn!(stage = %name, "Run cancelled, remaining stages not run");
                self.mark_not_run(&mut report, &self.order[index..]);
                report.state = PipelineState::Halted;
                break;
            }

            let ctx = StageContext {
                service: self.service.clone(),
                config: self.config.clone(),
                inputs: self.inputs.clone(),
                mode,
                cancel: run_cancel.clone(),
            };

            tracing::info!(stage = %name, mode = %mode, "Stage started");
            let started_at = Utc::now();
            let stage = build_stage(name, self.categorizer.clone());
            let mut stage_report = match stage.run(&ctx).await {
                Ok(stage_report) => stage_report,
                Err(StageError::Cancelled) => {
                    tracing::warn!(stage = %name, "Stage cancelled");
                    StageReport::failed(name, mode, StageError::Cancelled.to_string())
                }
                Err(err) => {
                    tracing::error!(stage = %name, error = %err, "Stage failed");
                    StageReport::failed(name, mode, err.to_string())
                }
            };
            stage_report.started_at = Some(started_at);
            stage_report.finished_at = Some(Utc::now());

            tracing::info!(
                stage = %name,
                status = %stage_report.status,
                proposed = stage_report.counts.proposed,
                applied = stage_report.counts.applied,
                failed = stage_report.counts.failed,
                elapsed_ms = stage_report.duration_ms().unwrap_or_default(),
                "Stage finished"
            );

            let failed = stage_report.status == StageStatus::Failed;
            report.stages.push(stage_report);

            if failed && !pipeline.continue_on_error {
                tracing::error!(
                    stage = %name,
                    "Stage failed and continue_on_error is off, halting pipeline"
                );
                self.mark_not_run(&mut report, &self.order[index + 1..]);
                report.state = PipelineState::Halted;
                break;
            }
        }

        if report.state == PipelineState::Running {
            report.state = PipelineState::Completed;
        }
        report.finished_at = Some(Utc::now());

        match report.write_json(&pipeline.report_dir) {
            Ok(path) => tracing::info!(path = %path.display(), "Run report written"),
            Err(e) => tracing::warn!(error = %e, "Failed to write run report"),
        }
        report.log_summary();
        report
    }

    fn mark_not_run(&self, report: &mut RunReport, remaining: &[StageName]) {
        report.stages.extend(
            remaining
                .iter()
                .map(|&name| StageReport::not_run(name, self.config.mode_for(name))),
        );
    }
}

fn spawn_deadline(token: CancellationToken, deadline: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(deadline) => {
                tracing::warn!(deadline_secs = deadline.as_secs(), "Run deadline reached, cancelling");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
}
