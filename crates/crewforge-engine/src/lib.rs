pub mod cache;
pub mod conditional;
pub mod crew;
pub mod delegation;
pub mod evaluator;
pub mod output_store;
pub mod rate_limit;
pub mod run_log;
pub mod runtime;
pub mod scheduler;
pub mod training;
pub mod validator;

pub use cache::CacheHandler;
pub use conditional::Gate;
pub use crew::{Crew, CrewBuilder, CrewOutput, TaskCallback, CONTEXT_SEPARATOR};
pub use delegation::{delegation_tools, manager_tool_descriptors, ASK_QUESTION, DELEGATE_WORK};
pub use evaluator::{CrewEvaluator, EvaluationReport, TaskScores};
pub use output_store::{OutputStore, StoredOutputRecord};
pub use rate_limit::RpmLimiter;
pub use run_log::{RunLogAttachment, RunLogger};
pub use runtime::AgentRuntime;
pub use scheduler::AsyncScheduler;
pub use training::{TrainedAgent, TrainingData, TrainingEvaluator, TrainingFeedback};
pub use validator::validate_tasks;
