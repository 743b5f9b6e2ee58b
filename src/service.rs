//! Caller-facing API: start, observe and cancel runs by id.

use crate::cancel::CancelSignal;
use crate::context::{GenerationInput, PipelineContext};
use crate::error::{GenerationError, Result};
use crate::events::{Event, EventHandler, FnEventHandler, Subscribers};
use crate::runner::{PipelineRun, PipelineRunner};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

struct RunEntry {
    snapshots: watch::Receiver<PipelineRun>,
    cancel: CancelSignal,
    subscribers: Arc<Subscribers>,
}

/// Owns in-flight and finished runs for one [`PipelineRunner`].
///
/// Each started run executes on its own tokio task. The service keeps the
/// latest snapshot of every run until the caller takes it with
/// [`take_run`](Self::take_run).
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use webgen_pipeline::{GenerationInput, GenerationService, PipelineRunner};
///
/// # async fn demo(runner: PipelineRunner) -> webgen_pipeline::Result<()> {
/// let service = GenerationService::new(Arc::new(runner));
/// let id = service.start_run(GenerationInput::new("A portfolio for a ceramicist"));
/// service.on_step_progress(id, |event| println!("{:?}", event))?;
/// let run = service.wait_for_run(id).await?;
/// println!("{}", run.status);
/// # Ok(())
/// # }
/// ```
pub struct GenerationService {
    runner: Arc<PipelineRunner>,
    runs: Mutex<HashMap<Uuid, RunEntry>>,
}

impl GenerationService {
    pub fn new(runner: Arc<PipelineRunner>) -> Self {
        Self {
            runner,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn runner(&self) -> &PipelineRunner {
        &self.runner
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<Uuid, RunEntry>> {
        match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start a run in the background and return its id.
    ///
    /// Must be called within a tokio runtime.
    pub fn start_run(&self, input: GenerationInput) -> Uuid {
        self.spawn(self.runner.create_run(input))
    }

    /// Start a run whose context is seeded with earlier outputs.
    pub fn start_run_with_context(&self, context: PipelineContext) -> Uuid {
        self.spawn(self.runner.create_run_with_context(context))
    }

    fn spawn(&self, run: PipelineRun) -> Uuid {
        let run_id = run.run_id;
        let (tx, rx) = watch::channel(run.clone());
        let subscribers = Arc::new(Subscribers::new());
        self.runs().insert(
            run_id,
            RunEntry {
                snapshots: rx,
                cancel: run.cancel_handle(),
                subscribers: Arc::clone(&subscribers),
            },
        );

        let runner = Arc::clone(&self.runner);
        let events: Arc<dyn EventHandler> = subscribers;
        tokio::spawn(async move {
            runner.run_with(run, Some(events), Some(&tx)).await;
        });
        info!(run_id = %run_id, "Run scheduled");
        run_id
    }

    /// Latest snapshot of a run.
    pub fn run_status(&self, run_id: Uuid) -> Result<PipelineRun> {
        let runs = self.runs();
        let entry = runs.get(&run_id).ok_or(GenerationError::UnknownRun(run_id))?;
        let snapshot = entry.snapshots.borrow().clone();
        Ok(snapshot)
    }

    /// Request cancellation. Idempotent; a finished run is unaffected.
    pub fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        let runs = self.runs();
        let entry = runs.get(&run_id).ok_or(GenerationError::UnknownRun(run_id))?;
        debug!(run_id = %run_id, "Cancellation requested");
        entry.cancel.cancel();
        Ok(())
    }

    /// Subscribe to a run's events from now on, including streamed tokens.
    pub fn on_step_progress<F>(&self, run_id: Uuid, callback: F) -> Result<()>
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.subscribe(run_id, Arc::new(FnEventHandler(callback)))
    }

    /// [`on_step_progress`](Self::on_step_progress) with a handler object.
    pub fn subscribe(&self, run_id: Uuid, handler: Arc<dyn EventHandler>) -> Result<()> {
        let runs = self.runs();
        let entry = runs.get(&run_id).ok_or(GenerationError::UnknownRun(run_id))?;
        entry.subscribers.subscribe(handler);
        Ok(())
    }

    /// Wait until the run reaches a terminal state and return that snapshot.
    pub async fn wait_for_run(&self, run_id: Uuid) -> Result<PipelineRun> {
        let mut rx = {
            let runs = self.runs();
            let entry = runs.get(&run_id).ok_or(GenerationError::UnknownRun(run_id))?;
            entry.snapshots.clone()
        };
        let waited = rx
            .wait_for(|run| run.status.is_terminal())
            .await
            .map(|run| run.clone());
        match waited {
            Ok(run) => Ok(run),
            // The task is gone; the last snapshot is all there is.
            Err(_) => Ok(rx.borrow().clone()),
        }
    }

    /// Start a run and wait for it.
    pub async fn generate(&self, input: GenerationInput) -> Result<PipelineRun> {
        let run_id = self.start_run(input);
        self.wait_for_run(run_id).await
    }

    /// Remove a finished run and return its final snapshot.
    ///
    /// Returns `Ok(None)` while the run is still pending or running; it stays
    /// registered in that case.
    pub fn take_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>> {
        let mut runs = self.runs();
        let entry = runs.get(&run_id).ok_or(GenerationError::UnknownRun(run_id))?;
        let snapshot = entry.snapshots.borrow().clone();
        if !snapshot.status.is_terminal() {
            return Ok(None);
        }
        runs.remove(&run_id);
        Ok(Some(snapshot))
    }

    /// Ids of every registered run.
    pub fn run_ids(&self) -> Vec<Uuid> {
        self.runs().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockReply};
    use crate::executor::{ExecutorOptions, StepExecutor};
    use crate::resilience::ResiliencePolicy;
    use crate::runner::RunStatus;
    use crate::step::{StepId, StepRegistry};
    use serde_json::json;
    use std::time::Duration;

    fn service(mock: MockBackend) -> GenerationService {
        let executor = StepExecutor::new(Arc::new(mock), Arc::new(StepRegistry::standard()))
            .with_policy(ResiliencePolicy::none());
        let runner = PipelineRunner::new(
            Arc::new(executor),
            vec![StepId::Architecture],
            ExecutorOptions::default(),
        )
        .unwrap();
        GenerationService::new(Arc::new(runner))
    }

    #[tokio::test]
    async fn test_start_and_wait() {
        let service = service(MockBackend::fixed(
            json!({"sitemap": ["home"], "pages": []}).to_string(),
        ));
        let id = service.start_run(GenerationInput::new("bakery"));
        let run = service.wait_for_run(id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(service.run_status(id).unwrap().status, RunStatus::Completed);

        let taken = service.take_run(id).unwrap().unwrap();
        assert_eq!(taken.run_id, id);
        assert!(matches!(service.run_status(id), Err(GenerationError::UnknownRun(_))));
    }

    #[tokio::test]
    async fn test_seeded_run_makes_no_calls() {
        let mock = Arc::new(MockBackend::fixed("{}"));
        let executor = StepExecutor::new(mock.clone(), Arc::new(StepRegistry::standard()));
        let runner =
            PipelineRunner::new(Arc::new(executor), vec![StepId::Architecture], ExecutorOptions::default())
                .unwrap();
        let service = GenerationService::new(Arc::new(runner));

        let context = PipelineContext::new(GenerationInput::new("bakery"))
            .with_output(StepId::Architecture, json!({"sitemap": ["home"], "pages": []}));
        let id = service.start_run_with_context(context);
        let run = service.wait_for_run(id).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.history.is_empty());
        assert!(run.context.contains(StepId::Architecture));
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let service = service(MockBackend::fixed("{}"));
        let id = Uuid::new_v4();
        assert!(service.run_status(id).is_err());
        assert!(service.cancel_run(id).is_err());
        assert!(service.on_step_progress(id, |_| {}).is_err());
        assert!(service.take_run(id).is_err());
    }

    #[tokio::test]
    async fn test_cancel_running() {
        let service = service(MockBackend::new(vec![MockReply::Hang]));
        let id = service.start_run(GenerationInput::new("bakery"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.run_status(id).unwrap().status, RunStatus::Running);
        assert!(service.take_run(id).unwrap().is_none());

        service.cancel_run(id).unwrap();
        let run = service.wait_for_run(id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.history.is_empty());
    }
}
