//! Training jobs: one remote command per subclass, run strictly in order.

pub mod job;
pub mod orchestrator;
pub mod runner;
pub mod template;

pub use job::{
    JobStatus, LogEntry, LogLevel, TaskStatus, TrainingJob, TrainingJobInput, TrainingTask,
};
pub use orchestrator::TrainingOrchestrator;
pub use runner::CommandRunner;
pub use template::{DEFAULT_COMMAND_TEMPLATE, render_command, slug};
