use std::future::Future;

use warden_core::{BrokerError, CancelToken, ProgressReporter};
use warden_shell::{ShellConnector, ShellExecutor, ShellOutput, ShellRequest};

/// Executes a single shell request on behalf of a training task.
pub trait CommandRunner: Send + Sync {
    fn run_command(
        &self,
        request: &ShellRequest,
        cancel: &CancelToken,
        progress: &ProgressReporter,
    ) -> impl Future<Output = Result<ShellOutput, BrokerError>> + Send;
}

impl<C: ShellConnector> CommandRunner for ShellExecutor<C> {
    fn run_command(
        &self,
        request: &ShellRequest,
        cancel: &CancelToken,
        progress: &ProgressReporter,
    ) -> impl Future<Output = Result<ShellOutput, BrokerError>> + Send {
        self.execute(request, cancel, progress)
    }
}
