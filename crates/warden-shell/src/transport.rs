use std::collections::BTreeMap;
use std::future::Future;

use warden_core::{BrokerError, ShellAuth};

/// Where and as whom to connect. Built from a resolved profile.
#[derive(Debug, Clone)]
pub struct ShellTarget {
    pub profile: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: ShellAuth,
}

/// Command to run on an established session.
#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub command: String,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl ExecSpec {
    /// Command line with the working directory change folded in.
    #[must_use]
    pub fn command_line(&self) -> String {
        match self.cwd.as_deref() {
            Some(dir) if !dir.is_empty() => format!("cd {} && {}", shell_quote(dir), self.command),
            _ => self.command.clone(),
        }
    }
}

/// POSIX single-quote escaping.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Output and status frames read from a running command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    ExitSignal(String),
}

/// Opens authenticated sessions to remote hosts.
pub trait ShellConnector: Send + Sync {
    type Session: ShellSession;

    fn connect(
        &self,
        target: &ShellTarget,
    ) -> impl Future<Output = Result<Self::Session, BrokerError>> + Send;
}

/// One connection running at most one command.
pub trait ShellSession: Send {
    fn exec(&mut self, spec: &ExecSpec) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Next frame from the command; `None` once the channel has closed.
    fn next_event(
        &mut self,
    ) -> impl Future<Output = Result<Option<SessionEvent>, BrokerError>> + Send;

    /// Graceful teardown after the command settled.
    fn close(self) -> impl Future<Output = ()> + Send;

    /// Immediate teardown on timeout or cancellation.
    fn abort(self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_without_cwd() {
        let spec = ExecSpec {
            command: "nvidia-smi".into(),
            ..ExecSpec::default()
        };
        assert_eq!(spec.command_line(), "nvidia-smi");
    }

    #[test]
    fn command_line_with_cwd_is_quoted() {
        let spec = ExecSpec {
            command: "ls".into(),
            cwd: Some("/data/it's here".into()),
            env: BTreeMap::new(),
        };
        assert_eq!(spec.command_line(), r"cd '/data/it'\''s here' && ls");
    }

    #[test]
    fn empty_cwd_ignored() {
        let spec = ExecSpec {
            command: "ls".into(),
            cwd: Some(String::new()),
            env: BTreeMap::new(),
        };
        assert_eq!(spec.command_line(), "ls");
    }
}
