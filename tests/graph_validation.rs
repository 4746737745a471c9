use crewforge_core::agent::Agent;
use crewforge_core::error::{CrewError, ErrorKind};
use crewforge_core::task::{Condition, Task};
use crewforge_engine::{Crew, CrewBuilder};
use crewforge_test_utils::MockLlm;

fn agent() -> Agent {
    Agent::new("Researcher", "Research", "Digs.").with_llm(MockLlm::fixed("ok").into_arc())
}

fn builder(agent: &Agent, tasks: Vec<Task>) -> CrewBuilder {
    Crew::builder().agent(agent.clone()).tasks(tasks)
}

fn graph_error(result: crewforge_core::error::Result<Crew>) -> String {
    match result {
        Err(e) => {
            assert_eq!(e.kind(), ErrorKind::GraphValidation, "unexpected error: {}", e);
            e.to_string()
        }
        Ok(_) => panic!("expected a graph validation error"),
    }
}

#[test]
fn test_context_on_later_task_rejected() {
    let a = agent();
    let later = Task::new("Later", "x").with_agent(&a).with_name("later");
    let early = Task::new("Early", "y")
        .with_agent(&a)
        .with_name("early")
        .with_context(&[&later]);
    let message = graph_error(builder(&a, vec![early, later]).build());
    assert!(message.contains("context dependency on a future task"));
}

#[test]
fn test_context_on_itself_rejected() {
    let a = agent();
    let mut task = Task::new("Loop", "x").with_agent(&a);
    task.context = vec![task.id];
    graph_error(builder(&a, vec![task]).build());
}

#[test]
fn test_two_trailing_async_tasks_rejected() {
    let a = agent();
    let tasks = vec![
        Task::new("Sync", "x").with_agent(&a),
        Task::new("Async one", "y").with_agent(&a).asynchronous(),
        Task::new("Async two", "z").with_agent(&a).asynchronous(),
    ];
    let message = graph_error(builder(&a, tasks).build());
    assert!(message.contains("at most one asynchronous task"));
}

#[test]
fn test_single_trailing_async_task_accepted() {
    let a = agent();
    let tasks = vec![
        Task::new("Sync", "x").with_agent(&a),
        Task::new("Async", "y").with_agent(&a).asynchronous(),
    ];
    assert!(builder(&a, tasks).build().is_ok());
}

#[test]
fn test_async_context_on_adjacent_async_rejected() {
    let a = agent();
    let first = Task::new("Async one", "x").with_agent(&a).asynchronous();
    let second = Task::new("Async two", "y")
        .with_agent(&a)
        .asynchronous()
        .with_context(&[&first]);
    let tasks = vec![first, second, Task::new("Sync", "z").with_agent(&a)];
    let message = graph_error(builder(&a, tasks).build());
    assert!(message.contains("cannot include other sequential asynchronous tasks"));
}

#[test]
fn test_async_context_separated_by_sync_accepted() {
    let a = agent();
    let first = Task::new("Async one", "x").with_agent(&a).asynchronous();
    let middle = Task::new("Sync", "y").with_agent(&a);
    let last = Task::new("Async two", "z")
        .with_agent(&a)
        .asynchronous()
        .with_context(&[&first]);
    assert!(builder(&a, vec![first, middle, last]).build().is_ok());
}

#[test]
fn test_conditional_first_task_rejected() {
    let a = agent();
    let only = Task::new("Only", "x")
        .with_agent(&a)
        .with_condition(Condition::from_fn(|_| true));
    let message = graph_error(builder(&a, vec![only]).build());
    assert!(message.contains("first task cannot be a conditional task"));
}

#[test]
fn test_async_conditional_task_rejected() {
    let a = agent();
    let tasks = vec![
        Task::new("First", "x").with_agent(&a),
        Task::new("Gated", "y")
            .with_agent(&a)
            .asynchronous()
            .with_condition(Condition::from_fn(|_| true)),
        Task::new("Last", "z").with_agent(&a),
    ];
    let message = graph_error(builder(&a, tasks).build());
    assert!(message.contains("cannot be executed asynchronously"));
}

#[test]
fn test_empty_task_list_rejected() {
    let a = agent();
    graph_error(builder(&a, vec![]).build());
}

#[test]
fn test_agent_outside_roster_rejected() {
    let a = agent();
    let stranger = agent();
    let task = Task::new("Research", "x").with_agent(&stranger);
    let err = builder(&a, vec![task]).build().err().unwrap();
    assert!(matches!(err, CrewError::GraphValidation(_)));
}
