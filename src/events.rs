//! Run lifecycle and streaming events.
//!
//! Provides an optional, non-intrusive way to observe a generation run. The
//! runner emits events when a run starts and finishes, the executor when a
//! step starts, retries, streams a token and finishes. Implement
//! [`EventHandler`] to receive them for progress screens or streaming UIs.

use crate::runner::RunStatus;
use crate::step::StepId;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Events emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The run left `pending`.
    RunStarted { run_id: Uuid, steps: Vec<StepId> },

    /// A step's completion call is about to be made.
    StepStarted {
        step: StepId,
        /// Correlation id shared with the step's result.
        trace_id: u64,
    },

    /// A streamed fragment arrived.
    Token {
        step: StepId,
        delta: String,
        /// All text received so far for the current attempt.
        accumulated: String,
    },

    /// A transport-level retry is about to sleep.
    TransportRetry {
        step: StepId,
        /// 1-indexed retry number.
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },

    StepFinished {
        step: StepId,
        success: bool,
        latency_ms: u64,
    },

    /// The run reached a terminal state.
    RunFinished { run_id: Uuid, status: RunStatus },
}

/// Handler for run events.
///
/// # Example
///
/// ```
/// use webgen_pipeline::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         match event {
///             Event::Token { delta, .. } => print!("{}", delta),
///             Event::StepStarted { step, .. } => println!("[start] {}", step),
///             Event::StepFinished { step, success, .. } => println!("[end] {} ok={}", step, success),
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: Option<&Arc<dyn EventHandler>>, event: Event) {
    if let Some(h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use webgen_pipeline::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     if let Event::Token { accumulated, .. } = event {
///         println!("{} chars so far", accumulated.len());
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}

/// Forwards every event to a changing set of subscribers.
///
/// Subscribers may be added while the run is in progress; they see events
/// from that point on.
#[derive(Default)]
pub struct Subscribers {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        match self.handlers.write() {
            Ok(mut guard) => guard.push(handler),
            Err(poisoned) => poisoned.into_inner().push(handler),
        }
    }

    pub fn len(&self) -> usize {
        match self.handlers.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventHandler for Subscribers {
    fn on_event(&self, event: Event) {
        // Clone the list so handlers may subscribe others without deadlocking.
        let handlers = match self.handlers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for handler in handlers {
            handler.on_event(event.clone());
        }
    }
}
