//! Linear five-stage run with a per-stage retry budget.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use taxi_core::{
    PipelineRun, RunPeriod, RunState, StageError, StageKind, StageOutcome, StageReport,
    StageStatus,
};
use taxi_storage::write_atomic;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StageContext {
    pub run_id: Uuid,
    pub period: RunPeriod,
}

/// One step of the pipeline. Each call runs the step from scratch; retries
/// rely on the step overwriting its own output.
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn run(&self, ctx: &StageContext) -> Result<StageReport, StageError>;
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    retry: RetryPolicy,
    run_log_dir: Option<PathBuf>,
}

impl Pipeline {
    /// Stages must be given in pipeline order, one of each.
    pub fn new(stages: Vec<Box<dyn Stage>>, retry: RetryPolicy) -> Result<Self> {
        let kinds: Vec<StageKind> = stages.iter().map(|s| s.kind()).collect();
        if kinds != StageKind::PIPELINE_ORDER {
            bail!(
                "stages must run in order {:?}, got {:?}",
                StageKind::PIPELINE_ORDER,
                kinds
            );
        }
        Ok(Self {
            stages,
            retry,
            run_log_dir: None,
        })
    }

    pub fn with_run_log(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_log_dir = Some(dir.into());
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn stage(&self, kind: StageKind) -> Option<&dyn Stage> {
        self.stages.iter().find(|s| s.kind() == kind).map(|s| s.as_ref())
    }

    /// Runs every stage for `period`. A stage failure ends the run; later
    /// stages are recorded as skipped and never started.
    pub async fn run(&self, period: RunPeriod) -> Result<PipelineRun> {
        let mut run = PipelineRun::new(period);
        let ctx = StageContext {
            run_id: run.run_id,
            period,
        };
        info!(run_id = %run.run_id, %period, "pipeline run started");

        for stage in &self.stages {
            if run.state == RunState::Failed {
                run.record(StageOutcome::skipped(stage.kind()));
                continue;
            }
            run.transition(stage.kind().running_state())?;
            let outcome = self.run_with_retries(stage.as_ref(), &ctx).await;
            if outcome.status == StageStatus::Failed {
                run.transition(RunState::Failed)?;
            }
            run.record(outcome);
        }
        if run.state != RunState::Failed {
            run.transition(RunState::Succeeded)?;
        }

        match run.failed_stage() {
            None => info!(run_id = %run.run_id, %period, "pipeline run succeeded"),
            Some(stage) => error!(run_id = %run.run_id, %period, %stage, "pipeline run failed"),
        }
        if let Err(err) = self.write_run_log(&run).await {
            warn!(run_id = %run.run_id, error = %format!("{err:#}"), "could not write run log");
        }
        Ok(run)
    }

    /// Runs a single stage once, outside any run and without retries.
    pub async fn run_single(&self, kind: StageKind, period: RunPeriod) -> Result<StageReport, StageError> {
        let stage = self
            .stage(kind)
            .ok_or_else(|| StageError::InputMissing(format!("no {kind} stage configured")))?;
        let ctx = StageContext {
            run_id: Uuid::new_v4(),
            period,
        };
        stage
            .run(&ctx)
            .instrument(info_span!("stage", run_id = %ctx.run_id, stage = %kind, attempt = 1u32))
            .await
    }

    async fn run_with_retries(&self, stage: &dyn Stage, ctx: &StageContext) -> StageOutcome {
        let kind = stage.kind();
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 1;
        loop {
            let span = info_span!("stage", run_id = %ctx.run_id, stage = %kind, attempt);
            match stage.run(ctx).instrument(span.clone()).await {
                Ok(report) => {
                    info!(
                        parent: &span,
                        rows = report.rows,
                        location = report.location.as_deref().unwrap_or(""),
                        summary = %report.summary,
                        "stage succeeded"
                    );
                    return StageOutcome::succeeded(kind, attempt, report);
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    warn!(
                        parent: &span,
                        error = %err,
                        retry_in_secs = self.retry.delay.as_secs(),
                        "stage failed, retrying"
                    );
                }
                Err(err) => {
                    error!(parent: &span, error = %err, kind = err.kind_label(), "stage failed");
                    return StageOutcome::failed(kind, attempt, &err);
                }
            }
            tokio::time::sleep(self.retry.delay).await;
            attempt += 1;
        }
    }

    async fn write_run_log(&self, run: &PipelineRun) -> Result<()> {
        let Some(dir) = &self.run_log_dir else {
            return Ok(());
        };
        let path = dir.join(format!("{}.json", run.run_id));
        let bytes = serde_json::to_vec_pretty(run).context("serializing run log")?;
        write_atomic(&path, &bytes).await?;
        Ok(())
    }
}

/// Daily trigger. Each firing derives its period from the wall clock at that
/// moment, so periods missed while the scheduler was down are never replayed.
pub async fn build_scheduler(pipeline: Arc<Pipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            let period = RunPeriod::current();
            match pipeline.run(period).await {
                Ok(run) if run.succeeded() => {}
                Ok(run) => warn!(run_id = %run.run_id, %period, "scheduled run failed"),
                Err(err) => error!(%period, error = %format!("{err:#}"), "scheduled run aborted"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
