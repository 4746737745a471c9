use std::collections::{HashMap, HashSet};

use crewforge_core::agent::Agent;
use crewforge_core::error::{CrewError, Result};
use crewforge_core::task::Task;
use crewforge_core::types::{Process, TaskId};

/// Check the static structure of a task list.
///
/// Pure predicate: runs once at crew construction and never mutates.
pub fn validate_tasks(tasks: &[Task], agents: &[Agent], process: Process) -> Result<()> {
    if tasks.is_empty() {
        return Err(CrewError::graph("A crew must have at least one task."));
    }

    validate_agents(tasks, agents, process)?;
    validate_context_order(tasks)?;
    validate_trailing_async(tasks)?;
    validate_async_context(tasks)?;
    validate_conditionals(tasks)?;
    Ok(())
}

fn validate_agents(tasks: &[Task], agents: &[Agent], process: Process) -> Result<()> {
    let roster: HashSet<_> = agents.iter().map(|a| a.id).collect();
    for task in tasks {
        match task.agent {
            None if process == Process::Sequential => {
                return Err(CrewError::graph(format!(
                    "Agent is missing in the task with the following description: {}",
                    task.description()
                )));
            }
            Some(id) if !roster.contains(&id) => {
                return Err(CrewError::graph(format!(
                    "Task '{}' is bound to an agent that is not part of the crew.",
                    task.label()
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_context_order(tasks: &[Task]) -> Result<()> {
    let positions: HashMap<TaskId, usize> =
        tasks.iter().enumerate().map(|(i, t)| (t.id, i)).collect();

    for (i, task) in tasks.iter().enumerate() {
        for ctx in &task.context {
            match positions.get(ctx) {
                Some(&j) if j < i => {}
                Some(&j) => {
                    return Err(CrewError::graph(format!(
                        "Task '{}' has a context dependency on a future task '{}', which is not allowed.",
                        task.label(),
                        tasks[j].label()
                    )));
                }
                None => {
                    return Err(CrewError::graph(format!(
                        "Task '{}' has a context dependency on task {} which is not part of the crew.",
                        task.label(),
                        ctx
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_trailing_async(tasks: &[Task]) -> Result<()> {
    let trailing = tasks
        .iter()
        .rev()
        .take_while(|t| t.async_execution)
        .count();
    if trailing > 1 {
        return Err(CrewError::graph(
            "The crew must end with at most one asynchronous task.",
        ));
    }
    Ok(())
}

fn validate_async_context(tasks: &[Task]) -> Result<()> {
    for (i, task) in tasks.iter().enumerate() {
        if !task.async_execution || task.context.is_empty() {
            continue;
        }
        // Only async tasks not separated from this one by a sync task matter.
        for previous in tasks[..i].iter().rev().take_while(|t| t.async_execution) {
            if task.context.contains(&previous.id) {
                return Err(CrewError::graph(format!(
                    "Task '{}' is asynchronous and cannot include other sequential asynchronous tasks in its context.",
                    task.label()
                )));
            }
        }
    }
    Ok(())
}

fn validate_conditionals(tasks: &[Task]) -> Result<()> {
    if tasks[0].is_conditional() {
        return Err(CrewError::graph(
            "The first task cannot be a conditional task.",
        ));
    }
    if let Some(task) = tasks.iter().find(|t| t.is_conditional() && t.async_execution) {
        return Err(CrewError::graph(format!(
            "Conditional task '{}' cannot be executed asynchronously.",
            task.label()
        )));
    }
    Ok(())
}
