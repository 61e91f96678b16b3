use chrono::Utc;
use warden_core::{BrokerError, CancelToken, ProgressReporter};
use warden_shell::{ShellOutput, ShellRequest};

use crate::job::{
    JobStatus, LogLevel, TaskStatus, TrainingJob, TrainingJobInput, TrainingTask,
};
use crate::runner::CommandRunner;
use crate::template::{DEFAULT_COMMAND_TEMPLATE, render_command};

/// Runs one command per subclass, strictly in input order.
#[derive(Debug, Clone)]
pub struct TrainingOrchestrator<R> {
    runner: R,
}

impl<R: CommandRunner> TrainingOrchestrator<R> {
    #[must_use]
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    #[must_use]
    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run every task and return the finished job record.
    ///
    /// A failed task never stops later ones; only job-level cancellation does.
    #[tracing::instrument(
        name = "training",
        skip_all,
        fields(profile = %input.profile, tasks = input.subclasses.len(), dry_run = input.dry_run)
    )]
    pub async fn run(
        &self,
        input: TrainingJobInput,
        cancel: &CancelToken,
        progress: &ProgressReporter,
    ) -> TrainingJob {
        let template = input
            .command_template
            .clone()
            .unwrap_or_else(|| DEFAULT_COMMAND_TEMPLATE.to_owned());
        let tasks = input
            .subclasses
            .iter()
            .map(|subclass| {
                let command = render_command(&template, subclass, &input.dataset_path);
                TrainingTask::new(subclass.as_str(), command, input.dry_run)
            })
            .collect::<Vec<_>>();

        let mut job = TrainingJob {
            id: uuid::Uuid::new_v4().to_string(),
            profile: input.profile.clone(),
            dataset_path: input.dataset_path.clone(),
            command_template: template,
            status: JobStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            tasks,
        };
        tracing::info!(job_id = %job.id, "training job started");
        progress.report(0.0, Some("training job started"));

        let total = job.tasks.len();
        for (index, task) in job.tasks.iter_mut().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let window = progress.scaled(index as f64 / total as f64, 1.0 / total as f64);

            if cancel.is_cancelled() {
                let reason = cancel.reason().unwrap_or_else(|| "job cancelled".to_owned());
                task.finish(
                    TaskStatus::Cancelled,
                    LogLevel::Warn,
                    format!("cancelled before start: {reason}"),
                );
                task.error = Some(BrokerError::cancelled_by(cancel).to_string());
                continue;
            }

            if input.dry_run {
                let message = format!("dry run: skipped `{}`", task.command);
                task.finish(TaskStatus::Succeeded, LogLevel::Info, message);
                window.report(1.0, Some(task.subclass.as_str()));
                continue;
            }

            task.start();
            let request = ShellRequest {
                profile: input.profile.clone(),
                command: task.command.clone(),
                options: input.options.clone(),
            };
            let outcome = self.runner.run_command(&request, cancel, &window).await;
            settle(task, outcome);
            window.report(1.0, Some(task.subclass.as_str()));
        }

        job.status = TrainingJob::aggregate_status(&job.tasks);
        job.completed_at = Some(Utc::now());
        tracing::info!(job_id = %job.id, status = ?job.status, "training job finished");
        progress.report(1.0, Some("training job finished"));
        job
    }
}

fn settle(task: &mut TrainingTask, outcome: Result<ShellOutput, BrokerError>) {
    match outcome {
        Ok(output) if output.succeeded() => {
            let message = format!("completed in {}ms", output.duration_ms);
            task.result = Some(output);
            task.finish(TaskStatus::Succeeded, LogLevel::Info, message);
        }
        Ok(output) => {
            let error = match (&output.signal, output.exit_code) {
                (Some(signal), _) => format!("command terminated by signal {signal}"),
                (None, Some(code)) => format!("command exited with status {code}"),
                (None, None) => "command finished without an exit status".to_owned(),
            };
            task.result = Some(output);
            task.error = Some(error.clone());
            task.finish(TaskStatus::Failed, LogLevel::Error, error);
        }
        Err(e) if e.is_cancelled() => {
            task.error = Some(e.to_string());
            task.finish(TaskStatus::Cancelled, LogLevel::Warn, e.to_string());
        }
        Err(e) => {
            task.error = Some(e.to_string());
            task.finish(TaskStatus::Failed, LogLevel::Error, e.to_string());
        }
    }
}
