use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use crewforge_core::agent::Agent;
use crewforge_core::error::{CrewError, ErrorKind};
use crewforge_core::event::{CrewEvent, EventBus, EventKind};
use crewforge_core::task::{Condition, Task};
use crewforge_core::traits::Tool;
use crewforge_core::types::{Completion, Inputs};
use crewforge_engine::{Crew, CONTEXT_SEPARATOR};
use crewforge_test_utils::{FnTool, MockLlm};

fn agent(role: &str, llm: Arc<MockLlm>) -> Agent {
    Agent::new(role, format!("{} goal", role), format!("{} backstory", role)).with_llm(llm)
}

fn record_kinds(bus: &EventBus) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.register_many(
        &[
            EventKind::CrewKickoffStarted,
            EventKind::TaskStarted,
            EventKind::TaskCompleted,
            EventKind::TaskSkipped,
            EventKind::TaskFailed,
            EventKind::CrewKickoffCompleted,
            EventKind::CrewKickoffFailed,
        ],
        move |_, event| {
            let tag = serde_json::to_value(event).unwrap()["type"]
                .as_str()
                .unwrap()
                .to_string();
            sink.lock().unwrap().push(tag);
        },
    );
    seen
}

#[tokio::test]
async fn test_identical_tool_calls_across_tasks_invoke_once() {
    let tool = FnTool::multiplier().into_arc();
    let call = || Completion::tool("multiplier", json!({"first_number": 2, "second_number": 6}));
    let llm = MockLlm::scripted(vec![
        call(),
        Completion::text("12"),
        call(),
        Completion::text("still 12"),
    ])
    .into_arc();
    let calculator = agent("Calculator", llm).with_tools(vec![tool.clone() as Arc<dyn Tool>]);
    let first = Task::new("What is 2 times 6?", "A number").with_agent(&calculator);
    let second = Task::new("Check 2 times 6 again", "A number").with_agent(&calculator);
    let mut crew = Crew::builder()
        .agent(calculator)
        .tasks(vec![first, second])
        .build()
        .unwrap();

    let output = crew.kickoff(Inputs::new()).await.unwrap();
    assert_eq!(output.raw, "still 12");
    assert_eq!(tool.calls(), 1);
}

#[tokio::test]
async fn test_cache_reset_between_kickoffs() {
    let tool = FnTool::multiplier().into_arc();
    let llm = MockLlm::new(|req| {
        if req.prompt().contains("Observation:") {
            Ok(Completion::text("6"))
        } else {
            Ok(Completion::tool("multiplier", json!({"first_number": 2, "second_number": 3})))
        }
    })
    .into_arc();
    let calculator = agent("Calculator", llm).with_tools(vec![tool.clone() as Arc<dyn Tool>]);
    let task = Task::new("2 times 3", "A number").with_agent(&calculator);
    let mut crew = Crew::builder().agent(calculator).task(task).build().unwrap();

    crew.kickoff(Inputs::new()).await.unwrap();
    crew.kickoff(Inputs::new()).await.unwrap();
    assert_eq!(tool.calls(), 2);
}

#[tokio::test]
async fn test_crew_cache_disabled() {
    let tool = FnTool::multiplier().into_arc();
    let call = || Completion::tool("multiplier", json!({"first_number": 1, "second_number": 1}));
    let llm = MockLlm::scripted(vec![call(), call(), Completion::text("1")]).into_arc();
    let calculator = agent("Calculator", llm).with_tools(vec![tool.clone() as Arc<dyn Tool>]);
    let task = Task::new("1 times 1", "A number").with_agent(&calculator);
    let mut crew = Crew::builder()
        .agent(calculator)
        .task(task)
        .cache(false)
        .build()
        .unwrap();

    crew.kickoff(Inputs::new()).await.unwrap();
    assert_eq!(tool.calls(), 2);
}

#[tokio::test]
async fn test_conditional_false_never_executes() {
    let first_llm = MockLlm::fixed("task one output").into_arc();
    let second_llm = MockLlm::fixed("task two output").into_arc();
    let researcher = agent("Researcher", first_llm);
    let writer = agent("Writer", second_llm.clone());
    let task1 = Task::new("Task one", "Output").with_agent(&researcher);
    let task2 = Task::new("Task two", "Output")
        .with_agent(&writer)
        .with_condition(Condition::from_fn(|_| false));
    let mut crew = Crew::builder()
        .agents(vec![researcher, writer])
        .tasks(vec![task1, task2])
        .build()
        .unwrap();
    let kinds = record_kinds(crew.event_bus());

    let output = crew.kickoff(Inputs::new()).await.unwrap();
    assert_eq!(output.raw, "task one output");
    assert_eq!(output.tasks_output.len(), 1);
    assert!(crew.tasks()[1].output().is_none());
    assert_eq!(second_llm.calls(), 0);
    assert_eq!(
        *kinds.lock().unwrap(),
        vec![
            "crew_kickoff_started",
            "task_started",
            "task_completed",
            "task_skipped",
            "crew_kickoff_completed"
        ]
    );
}

#[tokio::test]
async fn test_conditional_true_executes_once_after_previous() {
    let first_llm = MockLlm::fixed("needs follow-up").into_arc();
    let second_llm = MockLlm::fixed("follow-up done").into_arc();
    let researcher = agent("Researcher", first_llm);
    let writer = agent("Writer", second_llm.clone());
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let task1 = Task::new("Task one", "Output").with_agent(&researcher);
    let task2 = Task::new("Task two", "Output")
        .with_agent(&writer)
        .with_condition(Condition::from_fn(move |previous| {
            *sink.lock().unwrap() = Some(previous.raw.clone());
            previous.raw.contains("follow-up")
        }));
    let mut crew = Crew::builder()
        .agents(vec![researcher, writer])
        .tasks(vec![task1, task2])
        .build()
        .unwrap();

    let output = crew.kickoff(Inputs::new()).await.unwrap();
    assert_eq!(output.raw, "follow-up done");
    assert_eq!(second_llm.calls(), 1);
    assert_eq!(seen.lock().unwrap().as_deref(), Some("needs follow-up"));
}

#[tokio::test]
async fn test_conditional_gates_on_async_output() {
    let async_llm = MockLlm::fixed("from async")
        .with_delay(Duration::from_millis(20))
        .into_arc();
    let sync_llm = MockLlm::fixed("from sync").into_arc();
    let fast = agent("Fast", sync_llm.clone());
    let slow = agent("Slow", async_llm);
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();

    let t1 = Task::new("Sync first", "x").with_agent(&fast);
    let t2 = Task::new("Async second", "y").with_agent(&slow).asynchronous();
    let t3 = Task::new("Gated third", "z")
        .with_agent(&fast)
        .with_condition(Condition::from_fn(move |previous| {
            *sink.lock().unwrap() = Some(previous.raw.clone());
            true
        }));
    let mut crew = Crew::builder()
        .agents(vec![fast, slow])
        .tasks(vec![t1, t2, t3])
        .build()
        .unwrap();

    crew.kickoff(Inputs::new()).await.unwrap();
    // The pending async task is resolved before the gate runs.
    assert_eq!(seen.lock().unwrap().as_deref(), Some("from async"));
    assert!(crew.tasks()[1].output().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_async_tasks_run_concurrently_and_feed_context() {
    let alpha = agent(
        "Alpha",
        MockLlm::fixed("alpha").with_delay(Duration::from_millis(100)).into_arc(),
    );
    let beta = agent(
        "Beta",
        MockLlm::fixed("beta").with_delay(Duration::from_millis(100)).into_arc(),
    );
    let summary_llm = MockLlm::fixed("summary").into_arc();
    let writer = agent("Writer", summary_llm.clone());

    let a = Task::new("Research alpha", "notes").with_agent(&alpha).asynchronous();
    let b = Task::new("Research beta", "notes").with_agent(&beta).asynchronous();
    let c = Task::new("Summarize", "summary")
        .with_agent(&writer)
        .with_context(&[&a, &b]);
    let mut crew = Crew::builder()
        .agents(vec![alpha, beta, writer])
        .tasks(vec![a, b, c])
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    let output = crew.kickoff(Inputs::new()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(output.raw, "summary");
    assert!(elapsed < Duration::from_millis(150), "elapsed {:?}", elapsed);
    assert_eq!(
        crew.tasks()[2].prompt_context(),
        Some(format!("alpha{}beta", CONTEXT_SEPARATOR).as_str())
    );
    assert!(summary_llm.prompts()[0].contains("alpha\n\n----------\n\nbeta"));
    assert_eq!(output.tasks_output.len(), 3);
}

#[tokio::test]
async fn test_trailing_async_task_resolved_at_end() {
    let researcher = agent("Researcher", MockLlm::fixed("notes").into_arc());
    let reporter = agent(
        "Reporter",
        MockLlm::fixed("final report").with_delay(Duration::from_millis(10)).into_arc(),
    );
    let t1 = Task::new("Research", "notes").with_agent(&researcher);
    let t2 = Task::new("Report", "report").with_agent(&reporter).asynchronous();
    let mut crew = Crew::builder()
        .agents(vec![researcher, reporter])
        .tasks(vec![t1, t2])
        .build()
        .unwrap();

    let output = crew.kickoff(Inputs::new()).await.unwrap();
    assert_eq!(output.raw, "final report");
    assert_eq!(crew.tasks()[1].prompt_context(), Some("notes"));
    assert_eq!(crew.output_store().load().unwrap().len(), 2);
}

#[tokio::test]
async fn test_agent_failure_aborts_and_keeps_prior_records() {
    let good = agent("Researcher", MockLlm::fixed("notes").into_arc());
    let bad = agent("Writer", MockLlm::failing("service unavailable").into_arc());
    let t1 = Task::new("Research", "notes").with_agent(&good);
    let t2 = Task::new("Write", "article").with_agent(&bad);
    let t3 = Task::new("Publish", "post").with_agent(&good);
    let mut crew = Crew::builder()
        .agents(vec![good, bad])
        .tasks(vec![t1, t2, t3])
        .build()
        .unwrap();
    let kinds = record_kinds(crew.event_bus());

    let err = crew.kickoff(Inputs::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(matches!(err, CrewError::Completion { ref agent, .. } if agent == "Writer"));
    assert!(crew.tasks()[0].output().is_some());
    assert!(crew.tasks()[2].output().is_none());
    assert_eq!(crew.output_store().load().unwrap().len(), 1);

    let kinds = kinds.lock().unwrap();
    assert_eq!(kinds[kinds.len() - 2], "task_failed");
    assert_eq!(kinds[kinds.len() - 1], "crew_kickoff_failed");
}

#[tokio::test]
async fn test_usage_aggregated_and_reset_per_kickoff() {
    let llm = MockLlm::new(|_| Ok(Completion::text("ok").with_usage(10, 5))).into_arc();
    let worker = agent("Worker", llm);
    let t1 = Task::new("One", "x").with_agent(&worker);
    let t2 = Task::new("Two", "y").with_agent(&worker);
    let mut crew = Crew::builder()
        .agent(worker)
        .tasks(vec![t1, t2])
        .build()
        .unwrap();

    let first = crew.kickoff(Inputs::new()).await.unwrap();
    assert_eq!(first.token_usage.total_tokens, 30);
    assert_eq!(first.token_usage.prompt_tokens, 20);
    assert_eq!(first.token_usage.successful_requests, 2);

    let second = crew.kickoff(Inputs::new()).await.unwrap();
    assert_eq!(second.token_usage.total_tokens, 30);
}

#[tokio::test]
async fn test_kickoff_for_each_interpolates_every_input() {
    let llm = MockLlm::new(|req| {
        let first_line = req.messages[1].content.lines().next().unwrap_or_default();
        Ok(Completion::text(format!("about: {}", first_line)))
    })
    .into_arc();
    let researcher = agent("Researcher", llm);
    let task = Task::new("Research {topic}", "notes").with_agent(&researcher);
    let mut crew = Crew::builder().agent(researcher).task(task).build().unwrap();

    let inputs: Vec<Inputs> = ["Rust", "Go"]
        .iter()
        .map(|topic| Inputs::from([("topic".to_string(), json!(topic))]))
        .collect();
    let outputs = crew.kickoff_for_each(inputs).await.unwrap();

    let raws: Vec<&str> = outputs.iter().map(|o| o.raw.as_str()).collect();
    assert_eq!(raws, vec!["about: Research Rust", "about: Research Go"]);
}

#[tokio::test]
async fn test_json_output_surfaces_structured_form() {
    let llm = MockLlm::fixed("```json\n{\"title\": \"Rust\", \"score\": 9}\n```").into_arc();
    let critic = agent("Critic", llm);
    let task = Task::new("Score the article", "JSON").with_agent(&critic).with_output_json();
    let mut crew = Crew::builder().agent(critic).task(task).build().unwrap();

    let output = crew.kickoff(Inputs::new()).await.unwrap();
    assert_eq!(output.structured, Some(json!({"title": "Rust", "score": 9})));
    assert_eq!(output.to_string(), r#"{"score":9,"title":"Rust"}"#);
}

#[tokio::test]
async fn test_completed_events_carry_outputs() {
    let researcher = agent("Researcher", MockLlm::fixed("notes").into_arc());
    let task = Task::new("Research", "notes").with_agent(&researcher);
    let bus = Arc::new(EventBus::new());
    let outputs = Arc::new(Mutex::new(Vec::new()));
    let sink = outputs.clone();
    bus.register(EventKind::TaskCompleted, move |source, event| {
        if let CrewEvent::TaskCompleted { output, .. } = event {
            sink.lock().unwrap().push((source.to_string(), output.raw.clone()));
        }
    });

    let mut crew = Crew::builder()
        .name("research-crew")
        .event_bus(bus)
        .agent(researcher)
        .task(task)
        .build()
        .unwrap();
    crew.kickoff(Inputs::new()).await.unwrap();

    assert_eq!(
        *outputs.lock().unwrap(),
        vec![("research-crew".to_string(), "notes".to_string())]
    );
}

#[tokio::test]
async fn test_scoped_handlers_do_not_leak() {
    let researcher = agent("Researcher", MockLlm::fixed("notes").into_arc());
    let task = Task::new("Research", "notes").with_agent(&researcher);
    let mut crew = Crew::builder().agent(researcher).task(task).build().unwrap();
    let bus = crew.event_bus().clone();

    let outer = Arc::new(Mutex::new(0));
    let outer_sink = outer.clone();
    bus.register(EventKind::TaskCompleted, move |_, _| *outer_sink.lock().unwrap() += 1);

    let inner = Arc::new(Mutex::new(0));
    {
        let _scope = bus.scoped();
        let inner_sink = inner.clone();
        bus.register(EventKind::TaskCompleted, move |_, _| *inner_sink.lock().unwrap() += 1);
        crew.kickoff(Inputs::new()).await.unwrap();
    }
    crew.kickoff(Inputs::new()).await.unwrap();

    assert_eq!(*inner.lock().unwrap(), 1);
    assert_eq!(*outer.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_misordered_braces_fail_json_task() {
    let writer = agent("Writer", MockLlm::fixed("Sorry } I cannot { comply").into_arc());
    let task = Task::new("Summarize as JSON", "JSON")
        .with_agent(&writer)
        .with_output_json();
    let mut crew = Crew::builder().agent(writer).task(task).build().unwrap();
    let kinds = record_kinds(crew.event_bus());

    let err = crew.kickoff(Inputs::new()).await.unwrap_err();
    assert!(matches!(err, CrewError::OutputFormat { .. }));
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(kinds.lock().unwrap().contains(&"crew_kickoff_failed".to_string()));
}
