use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crewforge_core::agent::Agent;
use crewforge_core::error::{CrewError, Result};
use crewforge_core::event::{CrewEvent, EventBus, EventKind, HandlerId};
use crewforge_core::task::Task;
use crewforge_core::traits::CompletionClient;
use crewforge_core::types::{ChatMessage, CompletionRequest, TaskId, TaskOutput};

use crate::runtime::extract_json;

/// Score returned by the evaluator agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskEvaluation {
    quality: f64,
}

#[derive(Debug, Clone)]
struct TaskInfo {
    id: TaskId,
    description: String,
    expected_output: String,
    agent_goal: String,
}

/// Per-task scores across test iterations.
#[derive(Debug, Clone, Serialize)]
pub struct TaskScores {
    pub task_index: usize,
    pub agent: String,
    /// Score per iteration, in iteration order.
    pub scores: Vec<f64>,
}

impl TaskScores {
    pub fn average(&self) -> f64 {
        average(&self.scores)
    }
}

/// Result of [`Crew::test`](crate::Crew::test).
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub iterations: usize,
    pub tasks: Vec<TaskScores>,
    /// Mean task score per iteration.
    pub crew_scores: Vec<f64>,
    /// Wall-clock duration of each kickoff, in milliseconds.
    pub execution_times_ms: Vec<u64>,
}

impl EvaluationReport {
    pub fn crew_average(&self) -> f64 {
        average(&self.crew_scores)
    }
}

fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Tasks Scores (1-10 Higher is better)")?;
        write!(f, "{:<14}", "Tasks/Crew")?;
        for run in 1..=self.iterations {
            write!(f, "{:>8}", format!("Run {}", run))?;
        }
        writeln!(f, "{:>12}  Agents", "Avg. Total")?;

        for task in &self.tasks {
            write!(f, "{:<14}", format!("Task {}", task.task_index + 1))?;
            for score in &task.scores {
                write!(f, "{:>8.1}", score)?;
            }
            writeln!(f, "{:>12.1}  {}", task.average(), task.agent)?;
        }

        write!(f, "{:<14}", "Crew")?;
        for score in &self.crew_scores {
            write!(f, "{:>8.2}", score)?;
        }
        writeln!(f, "{:>12.1}", self.crew_average())?;

        write!(f, "{:<14}", "Execution Time (s)")?;
        for ms in &self.execution_times_ms {
            write!(f, "{:>8}", ms / 1000)?;
        }
        let avg_secs = average(
            &self
                .execution_times_ms
                .iter()
                .map(|ms| *ms as f64 / 1000.0)
                .collect::<Vec<_>>(),
        );
        writeln!(f, "{:>12.0}", avg_secs)
    }
}

#[derive(Default)]
struct Collected {
    iteration: usize,
    /// (iteration, task id) -> output awaiting a score.
    outputs: Vec<(usize, TaskId, TaskOutput)>,
    /// (task index) -> iteration -> score
    scores: BTreeMap<usize, BTreeMap<usize, f64>>,
    /// (task index) -> role that produced the output
    agents: BTreeMap<usize, String>,
    execution_times_ms: BTreeMap<usize, u64>,
}

/// Scores task outputs produced during test runs.
///
/// Registers on the event bus for `TaskCompleted` and collects outputs; each
/// iteration's outputs are then scored 1-10 by an evaluator agent.
pub struct CrewEvaluator {
    llm: Arc<dyn CompletionClient>,
    agent: Agent,
    tasks: Vec<TaskInfo>,
    state: Mutex<Collected>,
}

impl CrewEvaluator {
    pub fn new(llm: Arc<dyn CompletionClient>, tasks: &[Task], roster: &[Agent]) -> Self {
        let tasks = tasks
            .iter()
            .map(|t| TaskInfo {
                id: t.id,
                description: t.description().to_string(),
                expected_output: t.expected_output().to_string(),
                agent_goal: t
                    .agent
                    .and_then(|id| roster.iter().find(|a| a.id == id))
                    .map(|a| a.goal().to_string())
                    .unwrap_or_default(),
            })
            .collect();

        let agent = Agent::new(
            "Task Execution Evaluator",
            "Your goal is to evaluate the performance of the agents in the crew based on the tasks \
             they have performed using score from 1 to 10 evaluating on completion, quality, and overall performance.",
            "Evaluator agent for crew evaluation with precise capabilities to evaluate the performance \
             of the agents in the crew based on the tasks they have performed",
        )
        .with_llm(llm.clone());

        Self {
            llm,
            agent,
            tasks,
            state: Mutex::new(Collected::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, Collected> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start collecting task outputs from the bus.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> HandlerId {
        let evaluator = Arc::clone(self);
        bus.register(EventKind::TaskCompleted, move |_, event| {
            if let CrewEvent::TaskCompleted { task_id, output, .. } = event {
                let mut state = evaluator.state();
                let iteration = state.iteration;
                state.outputs.push((iteration, *task_id, output.clone()));
            }
        })
    }

    pub fn set_iteration(&self, iteration: usize) {
        self.state().iteration = iteration;
    }

    pub fn record_execution_time(&self, iteration: usize, elapsed_ms: u64) {
        self.state().execution_times_ms.insert(iteration, elapsed_ms);
    }

    /// Score every output collected for `iteration`.
    pub async fn evaluate_iteration(&self, iteration: usize) -> Result<()> {
        let pending: Vec<(TaskId, TaskOutput)> = {
            let mut state = self.state();
            let (current, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.outputs)
                .into_iter()
                .partition(|(it, _, _)| *it == iteration);
            state.outputs = rest;
            current.into_iter().map(|(_, id, out)| (id, out)).collect()
        };

        for (task_id, output) in pending {
            let Some(index) = self.tasks.iter().position(|t| t.id == task_id) else {
                continue;
            };
            let score = self.score(&self.tasks[index], &output).await?;
            debug!(task_index = index, iteration, score, "Task output evaluated");
            let mut state = self.state();
            state.scores.entry(index).or_default().insert(iteration, score);
            state.agents.insert(index, output.agent.clone());
        }
        Ok(())
    }

    async fn score(&self, task: &TaskInfo, output: &TaskOutput) -> Result<f64> {
        let prompt = format!(
            "Based on the task description and the expected output, compare and evaluate the \
             performance of the agents in the crew based on the Task Output they have performed \
             using score from 1 to 10 evaluating on completion, quality, and overall performance.\n\
             task_description: {}\n\
             task_expected_output: {}\n\
             agent: {}\n\
             agent_goal: {}\n\
             Task Output: {}\n\n\
             Respond with ONLY valid JSON in this format: {{\"quality\": <score from 1 to 10>}}",
            task.description, task.expected_output, output.agent, task.agent_goal, output.raw
        );

        let request = CompletionRequest {
            agent: self.agent.profile(),
            messages: vec![
                ChatMessage::system(self.agent.system_prompt()),
                ChatMessage::user(prompt),
            ],
            tools: vec![],
        };
        let completion = self.llm.complete(request).await?;

        match serde_json::from_str::<TaskEvaluation>(extract_json(&completion.content)) {
            Ok(eval) => Ok(eval.quality.clamp(1.0, 10.0)),
            Err(e) => {
                warn!(error = %e, response = %completion.content, "Failed to parse evaluation score");
                Err(CrewError::OutputFormat {
                    task: task.description.clone(),
                    message: format!("Evaluation result is not in the expected format: {}", e),
                })
            }
        }
    }

    pub fn report(&self, iterations: usize) -> EvaluationReport {
        let state = self.state();
        let tasks: Vec<TaskScores> = state
            .scores
            .iter()
            .map(|(index, by_iteration)| TaskScores {
                task_index: *index,
                agent: state.agents.get(index).cloned().unwrap_or_default(),
                scores: by_iteration.values().copied().collect(),
            })
            .collect();

        let crew_scores = (1..=iterations)
            .map(|it| {
                let scores: Vec<f64> = state
                    .scores
                    .values()
                    .filter_map(|by_iteration| by_iteration.get(&it).copied())
                    .collect();
                average(&scores)
            })
            .collect();

        EvaluationReport {
            iterations,
            tasks,
            crew_scores,
            execution_times_ms: state.execution_times_ms.values().copied().collect(),
        }
    }
}
