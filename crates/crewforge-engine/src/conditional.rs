use tracing::debug;

use crewforge_core::error::{CrewError, Result};
use crewforge_core::task::Task;
use crewforge_core::types::TaskOutput;

/// Terminal state of a gated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Execute,
    Skip,
}

/// Decide whether `task` runs, given the most recent prior output.
///
/// Unconditional tasks always execute. A conditional task with nothing to
/// gate on also executes; construction-time validation makes that case
/// unreachable for the first task.
pub fn evaluate(task: &Task, previous: Option<&TaskOutput>) -> Result<Gate> {
    let Some(condition) = &task.condition else {
        return Ok(Gate::Execute);
    };
    let Some(previous) = previous else {
        debug!(task = %task.label(), "No previous output to gate on; executing");
        return Ok(Gate::Execute);
    };

    let run = condition
        .evaluate(previous)
        .map_err(|message| CrewError::Condition {
            task: task.label().to_string(),
            message,
        })?;
    Ok(if run { Gate::Execute } else { Gate::Skip })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewforge_core::error::ErrorKind;
    use crewforge_core::task::Condition;

    fn previous() -> TaskOutput {
        TaskOutput::new("Say Hi", "Task 1 output", "Researcher")
    }

    #[test]
    fn test_unconditional_executes() {
        let task = Task::new("d", "e");
        assert_eq!(evaluate(&task, None).unwrap(), Gate::Execute);
    }

    #[test]
    fn test_predicate_decides() {
        let yes = Task::new("d", "e").with_condition(Condition::from_fn(|o| o.raw == "Task 1 output"));
        let no = Task::new("d", "e").with_condition(Condition::from_fn(|_| false));
        assert_eq!(evaluate(&yes, Some(&previous())).unwrap(), Gate::Execute);
        assert_eq!(evaluate(&no, Some(&previous())).unwrap(), Gate::Skip);
    }

    #[test]
    fn test_predicate_failure_is_execution_error() {
        let task = Task::new("d", "e")
            .with_name("gated")
            .with_condition(Condition::new(|_| Err("cannot decide".into())));
        let err = evaluate(&task, Some(&previous())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(err.to_string().contains("gated"));
    }

    #[test]
    fn test_missing_previous_executes() {
        let task = Task::new("d", "e").with_condition(Condition::from_fn(|_| false));
        assert_eq!(evaluate(&task, None).unwrap(), Gate::Execute);
    }
}
