//! Pipeline runner: the run state machine.
//!
//! ```text
//! pending ──run()──► running ──last step ok──► completed
//!                       │
//!                       ├──step failed──────► failed
//!                       └──cancel signal────► cancelled
//! ```
//!
//! Steps execute strictly in the configured order, one at a time. A failed
//! step ends the run; nothing is skipped or re-prompted. Callers wanting to
//! retry build a fresh run, optionally seeding its context with outputs that
//! are still valid.

use crate::cancel::CancelSignal;
use crate::context::{GenerationInput, PipelineContext};
use crate::error::{ErrorKind, Result};
use crate::events::{emit, Event, EventHandler};
use crate::executor::{ExecutorOptions, StepExecutor, StepResult};
use crate::step::StepId;
use crate::usage::TokenUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Lifecycle state of a [`PipelineRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// `completed`, `failed` and `cancelled` are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Summed usage over a run's history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTotals {
    pub tokens: TokenUsage,
    pub cost: f64,
}

impl RunTotals {
    fn add(&mut self, result: &StepResult) {
        self.tokens += result.token_usage;
        self.cost += result.estimated_cost;
    }
}

/// The terminal error of a failed run: which step broke and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub step: StepId,
    pub display_name: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl RunError {
    fn from_result(result: &StepResult) -> Self {
        Self {
            step: result.step,
            display_name: result.display_name.clone(),
            kind: result.error_kind.unwrap_or(ErrorKind::Transport),
            message: result.error.clone().unwrap_or_default(),
        }
    }

    /// Short message fit for end users. Never contains raw model text.
    pub fn summary(&self) -> String {
        let reason = match self.kind {
            ErrorKind::Auth => "the AI provider rejected the API key",
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::Provider => {
                "the AI provider is unavailable"
            }
            ErrorKind::UnparsableResponse | ErrorKind::ContractViolation => {
                "the AI returned an unusable result"
            }
            ErrorKind::Cancelled => "the run was cancelled",
            _ => "the pipeline is misconfigured",
        };
        format!("{} failed: {}", self.display_name, reason)
    }
}

/// One end-to-end execution of the step sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Steps this run executes, in order.
    pub steps: Vec<StepId>,
    /// Index into `steps` of the next step to execute.
    pub current_step_index: usize,
    pub context: PipelineContext,
    /// One result per executed step, in execution order.
    pub history: Vec<StepResult>,
    pub totals: RunTotals,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<RunError>,
    #[serde(skip)]
    cancel: CancelSignal,
}

impl PipelineRun {
    fn new(steps: &[StepId], context: PipelineContext) -> Self {
        // Seeded outputs stand in for their steps.
        let steps = steps
            .iter()
            .copied()
            .filter(|step| !context.contains(*step))
            .collect();
        Self {
            run_id: Uuid::new_v4(),
            status: RunStatus::Pending,
            steps,
            current_step_index: 0,
            context,
            history: Vec::new(),
            totals: RunTotals::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            cancel: CancelSignal::new(),
        }
    }

    /// The signal that cancels this run. Clones share state.
    pub fn cancel_handle(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Output of the last configured step, once completed.
    pub fn final_output(&self) -> Option<&serde_json::Value> {
        if self.status != RunStatus::Completed {
            return None;
        }
        self.steps.last().and_then(|step| self.context.get(*step))
    }

    /// The step currently executing, if running.
    pub fn current_step(&self) -> Option<StepId> {
        if self.status != RunStatus::Running {
            return None;
        }
        self.steps.get(self.current_step_index).copied()
    }

    fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

/// Executes [`PipelineRun`]s over a fixed step sequence.
pub struct PipelineRunner {
    executor: Arc<StepExecutor>,
    steps: Vec<StepId>,
    options: ExecutorOptions,
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("steps", &self.steps)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl PipelineRunner {
    /// Create a runner. The step sequence must pass
    /// [`StepRegistry::check_sequence`](crate::step::StepRegistry::check_sequence).
    pub fn new(executor: Arc<StepExecutor>, steps: Vec<StepId>, options: ExecutorOptions) -> Result<Self> {
        executor.registry().check_sequence(&steps)?;
        options.validate()?;
        Ok(Self {
            executor,
            steps,
            options,
        })
    }

    pub fn steps(&self) -> &[StepId] {
        &self.steps
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    pub fn create_run(&self, input: GenerationInput) -> PipelineRun {
        PipelineRun::new(&self.steps, PipelineContext::new(input))
    }

    /// Create a run whose context already holds outputs of earlier steps.
    /// Those steps are not executed again.
    pub fn create_run_with_context(&self, context: PipelineContext) -> PipelineRun {
        PipelineRun::new(&self.steps, context)
    }

    /// Drive `run` to a terminal state.
    pub async fn run(&self, run: PipelineRun) -> PipelineRun {
        self.run_with(run, None, None).await
    }

    /// [`run`](Self::run), emitting events to `events` and publishing a
    /// snapshot to `snapshots` after every transition.
    pub async fn run_with(
        &self,
        run: PipelineRun,
        events: Option<Arc<dyn EventHandler>>,
        snapshots: Option<&watch::Sender<PipelineRun>>,
    ) -> PipelineRun {
        let span = info_span!("run", run_id = %run.run_id);
        self.drive(run, events, snapshots).instrument(span).await
    }

    async fn drive(
        &self,
        mut run: PipelineRun,
        events: Option<Arc<dyn EventHandler>>,
        snapshots: Option<&watch::Sender<PipelineRun>>,
    ) -> PipelineRun {
        let publish = |run: &PipelineRun| {
            if let Some(tx) = snapshots {
                tx.send_replace(run.clone());
            }
        };

        if run.status != RunStatus::Pending {
            warn!(status = %run.status, "Run already started");
            return run;
        }

        let signal = run.cancel_handle();
        if signal.is_cancelled() {
            info!("Run cancelled before start");
            run.finish(RunStatus::Cancelled);
            publish(&run);
            emit(
                events.as_ref(),
                Event::RunFinished { run_id: run.run_id, status: run.status },
            );
            return run;
        }

        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        info!(steps = run.steps.len(), "Run started");
        publish(&run);
        emit(
            events.as_ref(),
            Event::RunStarted { run_id: run.run_id, steps: run.steps.clone() },
        );

        let mut options = self.options.clone();
        options.cancel = Some(signal.clone());
        options.events = events.clone();

        let status = loop {
            let Some(&step) = run.steps.get(run.current_step_index) else {
                break RunStatus::Completed;
            };
            if signal.is_cancelled() {
                break RunStatus::Cancelled;
            }

            let result = self.executor.execute(step, &run.context, &options).await;

            if result.success {
                let data = result.data.clone().unwrap_or_default();
                if let Err(err) = run.context.record(step, data) {
                    warn!(error = %err, "Could not record step output");
                    run.error = Some(RunError {
                        step,
                        display_name: result.display_name.clone(),
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                    run.totals.add(&result);
                    run.history.push(result);
                    run.current_step_index += 1;
                    break RunStatus::Failed;
                }
                run.totals.add(&result);
                run.history.push(result);
                run.current_step_index += 1;
                publish(&run);
                continue;
            }

            // A cancelled attempt leaves no result behind; its partial text
            // is discarded.
            if result.error_kind == Some(ErrorKind::Cancelled) || signal.is_cancelled() {
                break RunStatus::Cancelled;
            }

            run.error = Some(RunError::from_result(&result));
            run.totals.add(&result);
            run.history.push(result);
            run.current_step_index += 1;
            break RunStatus::Failed;
        };

        run.finish(status);
        match status {
            RunStatus::Failed => warn!(
                step = ?run.error.as_ref().map(|e| e.step),
                error = ?run.error.as_ref().map(|e| &e.message),
                "Run failed"
            ),
            _ => info!(
                status = %status,
                tokens = run.totals.tokens.total,
                cost = run.totals.cost,
                "Run finished"
            ),
        }
        publish(&run);
        emit(
            events.as_ref(),
            Event::RunFinished { run_id: run.run_id, status },
        );
        run
    }
}
