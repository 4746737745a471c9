use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crewforge_core::error::{CrewError, Result};
use crewforge_core::event::{CrewEvent, EventBus, EventKind, HandlerId};
use crewforge_core::types::AgentProfile;

/// Assessment of one agent's outputs across training iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingFeedback {
    /// Instructions the agent should follow in future runs.
    pub suggestions: Vec<String>,
    /// Quality score from 0 to 10.
    pub quality: f64,
    pub final_summary: String,
}

/// Judges an agent's training outputs.
pub trait TrainingEvaluator: Send + Sync {
    /// `outputs` holds the agent's raw outputs, one entry per iteration in order.
    fn evaluate<'a>(
        &'a self,
        agent: &'a AgentProfile,
        outputs: &'a [Vec<String>],
    ) -> BoxFuture<'a, Result<TrainingFeedback>>;
}

/// Everything learned about one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedAgent {
    pub role: String,
    /// Iteration number -> outputs produced in that iteration.
    pub iterations: BTreeMap<usize, Vec<String>>,
    pub feedback: TrainingFeedback,
}

/// Persisted result of [`Crew::train`](crate::Crew::train), keyed by agent role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingData {
    pub crew: String,
    pub n_iterations: usize,
    pub agents: BTreeMap<String, TrainedAgent>,
}

impl TrainingData {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CrewError::Storage(format!("Failed to read training data {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn suggestions_for(&self, role: &str) -> &[String] {
        self.agents
            .get(role)
            .map(|a| a.feedback.suggestions.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Default)]
struct Collected {
    iteration: usize,
    /// role -> iteration -> outputs
    outputs: BTreeMap<String, BTreeMap<usize, Vec<String>>>,
}

/// Collects each agent's task outputs from the event bus during training.
#[derive(Default)]
pub struct TrainingCollector {
    state: Mutex<Collected>,
}

impl TrainingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, Collected> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> HandlerId {
        let collector = Arc::clone(self);
        bus.register(EventKind::TaskCompleted, move |_, event| {
            if let CrewEvent::TaskCompleted { output, .. } = event {
                let mut state = collector.state();
                let iteration = state.iteration;
                state
                    .outputs
                    .entry(output.agent.clone())
                    .or_default()
                    .entry(iteration)
                    .or_default()
                    .push(output.raw.clone());
            }
        })
    }

    pub fn set_iteration(&self, iteration: usize) {
        self.state().iteration = iteration;
    }

    /// Outputs of `role`, iteration number -> outputs.
    pub fn outputs_for(&self, role: &str) -> BTreeMap<usize, Vec<String>> {
        self.state().outputs.get(role).cloned().unwrap_or_default()
    }
}
