//! SSH transport backed by `russh`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use russh_keys::key::PublicKey;
use warden_core::{BrokerError, ShellAuth};

use crate::transport::{ExecSpec, SessionEvent, ShellConnector, ShellSession, ShellTarget};

const CLOSE_GRACE: Duration = Duration::from_secs(2);
const STDERR_EXT: u32 = 1;

/// Client handler. Host keys are logged and accepted.
#[derive(Debug, Clone)]
pub struct HostKeyLogger {
    host: String,
}

#[async_trait]
impl client::Handler for HostKeyLogger {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        tracing::debug!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "accepting server host key"
        );
        Ok(true)
    }
}

/// Opens one SSH connection per command.
#[derive(Clone)]
pub struct RusshConnector {
    config: Arc<client::Config>,
}

impl std::fmt::Debug for RusshConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshConnector").finish_non_exhaustive()
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RusshConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            ..Default::default()
        })
    }

    #[must_use]
    pub fn with_config(config: client::Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl ShellConnector for RusshConnector {
    type Session = RusshSession;

    async fn connect(&self, target: &ShellTarget) -> Result<RusshSession, BrokerError> {
        let handler = HostKeyLogger {
            host: target.host.clone(),
        };
        let mut handle = client::connect(
            Arc::clone(&self.config),
            (target.host.as_str(), target.port),
            handler,
        )
        .await
        .map_err(|e| BrokerError::transport(format!("ssh connect to {}: {e}", target.host)))?;

        let accepted = match &target.auth {
            ShellAuth::PrivateKey { key, passphrase } => {
                let pair = russh_keys::decode_secret_key(
                    key.expose(),
                    passphrase.as_ref().map(warden_core::Secret::expose),
                )
                .map_err(|e| BrokerError::transport(format!("invalid private key: {e}")))?;
                handle
                    .authenticate_publickey(target.username.as_str(), Arc::new(pair))
                    .await
            }
            ShellAuth::Password(password) => {
                handle
                    .authenticate_password(target.username.as_str(), password.expose())
                    .await
            }
        }
        .map_err(|e| BrokerError::transport(format!("ssh authentication: {e}")))?;

        if !accepted {
            return Err(BrokerError::transport(format!(
                "ssh authentication rejected for {}@{}",
                target.username, target.host
            )));
        }
        tracing::debug!(host = %target.host, port = target.port, "ssh session established");

        Ok(RusshSession {
            handle,
            channel: None,
        })
    }
}

pub struct RusshSession {
    handle: Handle<HostKeyLogger>,
    channel: Option<Channel<Msg>>,
}

impl ShellSession for RusshSession {
    async fn exec(&mut self, spec: &ExecSpec) -> Result<(), BrokerError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| BrokerError::transport(format!("open channel: {e}")))?;
        for (name, value) in &spec.env {
            // Servers commonly refuse env requests; the command still runs.
            if let Err(e) = channel.set_env(false, name.as_str(), value.as_str()).await {
                tracing::debug!(variable = %name, "set_env failed: {e}");
            }
        }
        channel
            .exec(true, spec.command_line())
            .await
            .map_err(|e| BrokerError::transport(format!("exec: {e}")))?;
        self.channel = Some(channel);
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<SessionEvent>, BrokerError> {
        let Some(channel) = self.channel.as_mut() else {
            return Err(BrokerError::transport("no command running on session"));
        };
        loop {
            let Some(msg) = channel.wait().await else {
                return Ok(None);
            };
            let event = match msg {
                ChannelMsg::Data { data } => SessionEvent::Stdout(data.to_vec()),
                ChannelMsg::ExtendedData { data, ext } if ext == STDERR_EXT => {
                    SessionEvent::Stderr(data.to_vec())
                }
                ChannelMsg::ExitStatus { exit_status } => SessionEvent::ExitStatus(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    SessionEvent::ExitSignal(signal_label(signal_name))
                }
                ChannelMsg::Close => return Ok(None),
                _ => continue,
            };
            return Ok(Some(event));
        }
    }

    async fn close(self) {
        let Self { handle, channel } = self;
        let shutdown = async move {
            if let Some(channel) = channel {
                if let Err(e) = channel.close().await {
                    tracing::debug!("channel close: {e}");
                }
            }
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                tracing::debug!("ssh disconnect: {e}");
            }
        };
        if tokio::time::timeout(CLOSE_GRACE, shutdown).await.is_err() {
            tracing::warn!("ssh graceful close timed out");
        }
    }

    fn abort(self) {
        // Dropping the handle ends the connection task.
        drop(self);
    }
}

fn signal_label(sig: Sig) -> String {
    match sig {
        Sig::Custom(name) => name,
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_signals_use_short_names() {
        assert_eq!(signal_label(Sig::TERM), "TERM");
        assert_eq!(signal_label(Sig::KILL), "KILL");
    }

    #[test]
    fn custom_signal_passes_through() {
        assert_eq!(signal_label(Sig::Custom("XCPU".into())), "XCPU");
    }

    #[tokio::test]
    async fn unreachable_host_is_transport_error() {
        let connector = RusshConnector::new();
        let target = ShellTarget {
            profile: "dead".into(),
            host: "127.0.0.1".into(),
            port: 1,
            username: "nobody".into(),
            auth: ShellAuth::Password(warden_core::Secret::new("x")),
        };
        let err = connector.connect(&target).await.err().unwrap();
        assert!(matches!(err, BrokerError::Transport(_)));
    }
}
