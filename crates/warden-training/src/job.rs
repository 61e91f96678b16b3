use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_shell::{ShellOptions, ShellOutput};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJobInput {
    pub profile: String,
    pub dataset_path: String,
    /// Falls back to `DEFAULT_COMMAND_TEMPLATE`.
    #[serde(default)]
    pub command_template: Option<String>,
    pub subclasses: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
    /// Applied to every task's command.
    #[serde(default)]
    pub options: ShellOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingTask {
    pub subclass: String,
    pub command: String,
    pub dry_run: bool,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ShellOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logs: Vec<LogEntry>,
}

impl TrainingTask {
    #[must_use]
    pub fn new(subclass: impl Into<String>, command: impl Into<String>, dry_run: bool) -> Self {
        Self {
            subclass: subclass.into(),
            command: command.into(),
            dry_run,
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            logs: Vec::new(),
        }
    }

    /// Append a log entry and emit the matching tracing event.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => tracing::info!(subclass = %self.subclass, "{message}"),
            LogLevel::Warn => tracing::warn!(subclass = %self.subclass, "{message}"),
            LogLevel::Error => tracing::error!(subclass = %self.subclass, "{message}"),
        }
        self.logs.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        });
    }

    pub(crate) fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        let message = format!("running `{}`", self.command);
        self.log(LogLevel::Info, message);
    }

    pub(crate) fn finish(&mut self, status: TaskStatus, level: LogLevel, message: String) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.log(level, message);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJob {
    pub id: String,
    pub profile: String,
    pub dataset_path: String,
    pub command_template: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub tasks: Vec<TrainingTask>,
}

impl TrainingJob {
    /// Failed if any task failed, else cancelled if any was cancelled, else succeeded.
    #[must_use]
    pub fn aggregate_status(tasks: &[TrainingTask]) -> JobStatus {
        if tasks.iter().any(|t| t.status == TaskStatus::Failed) {
            JobStatus::Failed
        } else if tasks.iter().any(|t| t.status == TaskStatus::Cancelled) {
            JobStatus::Cancelled
        } else {
            JobStatus::Succeeded
        }
    }
}
