use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use crewforge_core::agent::Agent;
use crewforge_core::error::Result;
use crewforge_core::event::EventKind;
use crewforge_core::task::Task;
use crewforge_core::types::{AgentProfile, Completion, Inputs};
use serde_json::json;
use crewforge_engine::{Crew, TrainingData, TrainingEvaluator, TrainingFeedback};
use crewforge_test_utils::MockLlm;

fn crew() -> Crew {
    let researcher = Agent::new("Researcher", "Find facts", "Digs.")
        .with_llm(MockLlm::fixed("notes").into_arc())
        .with_delegation(true);
    let writer = Agent::new("Writer", "Write", "Writes.")
        .with_llm(MockLlm::fixed("article").into_arc());
    let tasks = vec![
        Task::new("Research", "Notes").with_agent(&researcher),
        Task::new("Write", "Article").with_agent(&writer),
    ];
    Crew::builder()
        .name("research")
        .agents(vec![researcher, writer])
        .tasks(tasks)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_test_mode_scores_every_iteration() {
    let evaluator_llm = MockLlm::scripted(vec![
        Completion::text(r#"{"quality": 8}"#),
        Completion::text(r#"{"quality": 6}"#),
        Completion::text(r#"{"quality": 10}"#),
        Completion::text(r#"{"quality": 8}"#),
    ])
    .into_arc();
    let mut crew = crew();

    let report = crew.test(2, evaluator_llm.clone(), Inputs::new()).await.unwrap();
    assert_eq!(report.iterations, 2);
    assert_eq!(report.tasks.len(), 2);
    assert_eq!(report.tasks[0].scores, vec![8.0, 10.0]);
    assert_eq!(report.tasks[0].agent, "Researcher");
    assert_eq!(report.tasks[1].scores, vec![6.0, 8.0]);
    assert_eq!(report.crew_scores, vec![7.0, 9.0]);
    assert_eq!(report.execution_times_ms.len(), 2);
    assert_eq!(evaluator_llm.calls(), 4);

    // The evaluator's registration is gone once the test ends.
    assert_eq!(crew.event_bus().handler_count(EventKind::TaskCompleted), 0);
}

#[tokio::test]
async fn test_test_mode_scores_interpolated_tasks() {
    let researcher = Agent::new("Researcher", "Find facts about {topic}", "Digs.")
        .with_llm(MockLlm::fixed("notes").into_arc());
    let task = Task::new("Research {topic}", "Notes on {topic}").with_agent(&researcher);
    let mut crew = Crew::builder().agent(researcher).task(task).build().unwrap();
    let evaluator_llm = MockLlm::fixed(r#"{"quality": 9}"#).into_arc();

    let inputs = Inputs::from([("topic".to_string(), json!("Rust"))]);
    crew.test(1, evaluator_llm.clone(), inputs).await.unwrap();

    let prompt = &evaluator_llm.prompts()[0];
    assert!(prompt.contains("task_description: Research Rust\n"));
    assert!(prompt.contains("task_expected_output: Notes on Rust\n"));
    assert!(prompt.contains("agent_goal: Find facts about Rust\n"));
    assert!(!prompt.contains("{topic}"));
}

#[tokio::test]
async fn test_test_mode_rejects_unparseable_score() {
    let mut crew = crew();
    let evaluator_llm = MockLlm::fixed("looks good to me").into_arc();
    let err = crew.test(1, evaluator_llm, Inputs::new()).await.unwrap_err();
    assert!(err.to_string().contains("not in the expected format"));
    assert_eq!(crew.event_bus().handler_count(EventKind::TaskCompleted), 0);
}

struct RecordingEvaluator {
    seen: Mutex<Vec<(String, Vec<Vec<String>>)>>,
}

impl TrainingEvaluator for RecordingEvaluator {
    fn evaluate<'a>(
        &'a self,
        agent: &'a AgentProfile,
        outputs: &'a [Vec<String>],
    ) -> BoxFuture<'a, Result<TrainingFeedback>> {
        Box::pin(async move {
            self.seen
                .lock()
                .unwrap()
                .push((agent.role.clone(), outputs.to_vec()));
            Ok(TrainingFeedback {
                suggestions: vec![format!("{} should cite sources", agent.role)],
                quality: 7.0,
                final_summary: format!("{} did fine", agent.role),
            })
        })
    }
}

#[tokio::test]
async fn test_train_collects_outputs_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("training").join("research.json");
    let evaluator = RecordingEvaluator {
        seen: Mutex::new(Vec::new()),
    };
    let mut crew = crew();

    let data = crew
        .train(2, Inputs::new(), &path, &evaluator)
        .await
        .unwrap();

    assert_eq!(data.n_iterations, 2);
    assert_eq!(data.agents.len(), 2);
    let researcher = &data.agents["Researcher"];
    assert_eq!(researcher.iterations.len(), 2);
    assert_eq!(researcher.iterations[&0], vec!["notes".to_string()]);
    assert_eq!(researcher.feedback.quality, 7.0);

    let seen = evaluator.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].1, vec![vec!["notes".to_string()], vec!["notes".to_string()]]);

    let loaded = TrainingData::load(&path).unwrap();
    assert_eq!(loaded, data);
    assert_eq!(
        loaded.suggestions_for("Writer"),
        ["Writer should cite sources".to_string()]
    );

    // Delegation is restored after training.
    assert!(crew.agents()[0].allow_delegation);
}

#[tokio::test]
async fn test_train_disables_delegation_during_runs() {
    let researcher_llm = MockLlm::fixed("notes").into_arc();
    let researcher = Agent::new("Researcher", "Find facts", "Digs.")
        .with_llm(researcher_llm.clone())
        .with_delegation(true);
    let writer = Agent::new("Writer", "Write", "Writes.")
        .with_llm(MockLlm::fixed("article").into_arc());
    let task = Task::new("Research", "Notes").with_agent(&researcher);
    let mut crew = Crew::builder()
        .agents(vec![researcher, writer])
        .task(task)
        .build()
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let evaluator = RecordingEvaluator {
        seen: Mutex::new(Vec::new()),
    };

    crew.train(1, Inputs::new(), dir.path().join("t.json"), &evaluator)
        .await
        .unwrap();
    assert!(researcher_llm.requests()[0].tools.is_empty());

    crew.kickoff(Inputs::new()).await.unwrap();
    assert_eq!(researcher_llm.requests()[1].tools.len(), 2);
}

#[tokio::test]
async fn test_failed_test_run_deregisters_evaluator() {
    let failing = Agent::new("Researcher", "Find facts", "Digs.")
        .with_llm(MockLlm::failing("offline").into_arc());
    let task = Task::new("Research", "Notes").with_agent(&failing);
    let mut crew = Crew::builder().agent(failing).task(task).build().unwrap();

    let evaluator_llm: Arc<MockLlm> = MockLlm::fixed(r#"{"quality": 5}"#).into_arc();
    assert!(crew.test(1, evaluator_llm, Inputs::new()).await.is_err());
    assert_eq!(crew.event_bus().handler_count(EventKind::TaskCompleted), 0);
}
