use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::types::{Inputs, TaskId, TaskOutput};

/// Tag used to register handlers for one family of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CrewKickoffStarted,
    CrewKickoffCompleted,
    CrewKickoffFailed,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskSkipped,
    AgentExecutionStarted,
    AgentExecutionCompleted,
    AgentExecutionFailed,
    ToolUsageStarted,
    ToolUsageFinished,
    ToolUsageFailed,
    CrewTrainStarted,
    CrewTrainCompleted,
    CrewTestStarted,
    CrewTestCompleted,
}

/// Lifecycle notification published by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrewEvent {
    CrewKickoffStarted {
        crew: String,
        inputs: Inputs,
    },
    CrewKickoffCompleted {
        crew: String,
        output: String,
        total_tokens: u64,
    },
    CrewKickoffFailed {
        crew: String,
        error: String,
    },
    TaskStarted {
        task_id: TaskId,
        description: String,
        agent: String,
    },
    TaskCompleted {
        task_id: TaskId,
        output: TaskOutput,
        elapsed_ms: u64,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    TaskSkipped {
        task_id: TaskId,
        description: String,
    },
    AgentExecutionStarted {
        agent: String,
        task_id: TaskId,
    },
    AgentExecutionCompleted {
        agent: String,
        task_id: TaskId,
        output: String,
    },
    AgentExecutionFailed {
        agent: String,
        task_id: TaskId,
        error: String,
    },
    ToolUsageStarted {
        agent: String,
        tool: String,
        input: serde_json::Value,
    },
    ToolUsageFinished {
        agent: String,
        tool: String,
        from_cache: bool,
    },
    ToolUsageFailed {
        agent: String,
        tool: String,
        error: String,
    },
    CrewTrainStarted {
        crew: String,
        n_iterations: usize,
    },
    CrewTrainCompleted {
        crew: String,
        n_iterations: usize,
    },
    CrewTestStarted {
        crew: String,
        n_iterations: usize,
    },
    CrewTestCompleted {
        crew: String,
        n_iterations: usize,
    },
}

impl CrewEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CrewEvent::CrewKickoffStarted { .. } => EventKind::CrewKickoffStarted,
            CrewEvent::CrewKickoffCompleted { .. } => EventKind::CrewKickoffCompleted,
            CrewEvent::CrewKickoffFailed { .. } => EventKind::CrewKickoffFailed,
            CrewEvent::TaskStarted { .. } => EventKind::TaskStarted,
            CrewEvent::TaskCompleted { .. } => EventKind::TaskCompleted,
            CrewEvent::TaskFailed { .. } => EventKind::TaskFailed,
            CrewEvent::TaskSkipped { .. } => EventKind::TaskSkipped,
            CrewEvent::AgentExecutionStarted { .. } => EventKind::AgentExecutionStarted,
            CrewEvent::AgentExecutionCompleted { .. } => EventKind::AgentExecutionCompleted,
            CrewEvent::AgentExecutionFailed { .. } => EventKind::AgentExecutionFailed,
            CrewEvent::ToolUsageStarted { .. } => EventKind::ToolUsageStarted,
            CrewEvent::ToolUsageFinished { .. } => EventKind::ToolUsageFinished,
            CrewEvent::ToolUsageFailed { .. } => EventKind::ToolUsageFailed,
            CrewEvent::CrewTrainStarted { .. } => EventKind::CrewTrainStarted,
            CrewEvent::CrewTrainCompleted { .. } => EventKind::CrewTrainCompleted,
            CrewEvent::CrewTestStarted { .. } => EventKind::CrewTestStarted,
            CrewEvent::CrewTestCompleted { .. } => EventKind::CrewTestCompleted,
        }
    }
}

/// Handler invoked with the emitting source and the event.
pub type Handler = Arc<dyn Fn(&str, &CrewEvent) + Send + Sync>;

/// Deregistration handle returned by [`EventBus::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<(HandlerId, EventKind, Handler)>,
}

/// Synchronous publish/subscribe registry for lifecycle events.
///
/// Handlers run on the emitting control flow, in registration order. The bus
/// is constructed explicitly and shared by `Arc`; `clear` resets it between
/// independent runs.
#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a handler for one event kind.
    pub fn register<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&str, &CrewEvent) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = HandlerId(registry.next_id);
        registry.handlers.push((id, kind, Arc::new(handler)));
        id
    }

    /// Register the same handler for several kinds. Returns one handle per kind.
    pub fn register_many<F>(&self, kinds: &[EventKind], handler: F) -> Vec<HandlerId>
    where
        F: Fn(&str, &CrewEvent) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let mut registry = self.lock();
        kinds
            .iter()
            .map(|kind| {
                registry.next_id += 1;
                let id = HandlerId(registry.next_id);
                registry.handlers.push((id, *kind, handler.clone()));
                id
            })
            .collect()
    }

    /// Remove a registration. Returns false if it was already gone.
    pub fn deregister(&self, id: HandlerId) -> bool {
        let mut registry = self.lock();
        let before = registry.handlers.len();
        registry.handlers.retain(|(hid, _, _)| *hid != id);
        registry.handlers.len() != before
    }

    /// Invoke every handler registered for the event's kind.
    pub fn emit(&self, source: &str, event: CrewEvent) {
        let kind = event.kind();
        // Snapshot so handlers may register or deregister while running.
        let handlers: Vec<Handler> = self
            .lock()
            .handlers
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, h)| h.clone())
            .collect();

        for handler in handlers {
            handler(source, &event);
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.lock()
            .handlers
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .count()
    }

    pub fn clear(&self) {
        self.lock().handlers.clear();
    }

    /// Enter a scope with an empty registration set.
    ///
    /// Handlers registered while the guard lives are discarded on drop and
    /// the previous set is restored.
    pub fn scoped(&self) -> ScopedHandlers<'_> {
        let saved = std::mem::take(&mut self.lock().handlers);
        ScopedHandlers { bus: self, saved }
    }
}

/// Guard returned by [`EventBus::scoped`].
pub struct ScopedHandlers<'a> {
    bus: &'a EventBus,
    saved: Vec<(HandlerId, EventKind, Handler)>,
}

impl Drop for ScopedHandlers<'_> {
    fn drop(&mut self) {
        let saved = std::mem::take(&mut self.saved);
        self.bus.lock().handlers = saved;
    }
}
