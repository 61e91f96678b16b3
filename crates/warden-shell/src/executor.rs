use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use warden_core::{
    BrokerError, CancelToken, ConcurrencyLimiter, PolicyGate, ProfileStore, ProgressReporter,
    TruncatingBuffer, tighten,
};

use crate::transport::{ExecSpec, SessionEvent, ShellConnector, ShellSession, ShellTarget};

/// Per-call overrides. Ceilings may only be tightened.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellOptions {
    /// Zero is treated as unset.
    pub timeout_ms: Option<u64>,
    pub max_output_bytes: Option<usize>,
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellRequest {
    pub profile: String,
    pub command: String,
    #[serde(default, flatten)]
    pub options: ShellOptions,
}

impl ShellRequest {
    pub fn new(profile: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            command: command.into(),
            options: ShellOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TruncationFlags {
    pub stdout: bool,
    pub stderr: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub truncated: TruncationFlags,
    pub exit_code: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    pub duration_ms: u64,
}

impl ShellOutput {
    /// Exited with status zero and no signal.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }
}

#[derive(Debug)]
struct Capture {
    stdout: TruncatingBuffer,
    stderr: TruncatingBuffer,
    exit_code: Option<u32>,
    signal: Option<String>,
}

/// Runs one command per call on a profile's host, under its policy.
#[derive(Debug, Clone)]
pub struct ShellExecutor<C> {
    connector: C,
    profiles: ProfileStore,
    limiter: ConcurrencyLimiter,
}

impl<C: ShellConnector> ShellExecutor<C> {
    #[must_use]
    pub fn new(connector: C, profiles: ProfileStore) -> Self {
        Self {
            connector,
            profiles,
            limiter: ConcurrencyLimiter::new(),
        }
    }

    #[must_use]
    pub fn with_limiter(mut self, limiter: ConcurrencyLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    #[must_use]
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Execute `request.command` under the named profile.
    ///
    /// The session is torn down and the slot released exactly once on every path.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `PolicyViolation`, `MissingCredentials`, `Timeout`,
    /// `Cancelled` or `Transport`.
    #[tracing::instrument(name = "shell", skip_all, fields(profile = %request.profile, command = %request.command))]
    pub async fn execute(
        &self,
        request: &ShellRequest,
        cancel: &CancelToken,
        progress: &ProgressReporter,
    ) -> Result<ShellOutput, BrokerError> {
        let snapshot = self.profiles.load();
        let profile = snapshot.ssh(&request.profile)?;

        if snapshot.bypasses_policy(profile) {
            tracing::warn!("allowlist bypassed for loopback profile in local test mode");
        } else {
            PolicyGate::check_allowlist(&profile.policy.allowed_command_patterns, &request.command)?;
        }

        let target = ShellTarget {
            profile: request.profile.clone(),
            host: profile.host.clone(),
            port: profile.port,
            username: profile.username.clone(),
            auth: profile.auth(&request.profile)?,
        };
        let spec = ExecSpec {
            command: request.command.clone(),
            cwd: request.options.cwd.clone(),
            env: request.options.env.clone(),
        };
        let timeout_ms = tighten(
            request.options.timeout_ms.filter(|ms| *ms > 0),
            profile.policy.max_execution_ms,
        );
        let max_output = tighten(
            request.options.max_output_bytes,
            profile.policy.max_output_bytes,
        );
        let max_concurrent = profile.policy.max_concurrent;

        progress.report(0.0, Some("waiting for capacity"));
        let mut slot = self
            .limiter
            .acquire(&request.profile, max_concurrent, cancel)
            .await?;
        // A grant racing with cancellation must not start any work.
        if cancel.is_cancelled() {
            slot.release();
            return Err(BrokerError::cancelled_by(cancel));
        }

        let started = Instant::now();
        let mut session: Option<C::Session> = None;
        let mut capture = Capture {
            stdout: TruncatingBuffer::new(max_output),
            stderr: TruncatingBuffer::new(max_output),
            exit_code: None,
            signal: None,
        };

        let outcome = {
            let work = self.drive(&target, &spec, &mut session, &mut capture, progress);
            // Completion is polled first: a result that already settled wins a race
            // with cancellation or the timer.
            tokio::select! {
                biased;
                res = work => res,
                () = cancel.cancelled() => Err(BrokerError::cancelled_by(cancel)),
                () = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                    Err(BrokerError::Timeout { timeout_ms })
                }
            }
        }
        .map_err(|e| e.superseded_by(cancel));

        if let Some(session) = session.take() {
            if !matches!(
                outcome,
                Err(BrokerError::Timeout { .. } | BrokerError::Cancelled { .. })
            ) {
                session.close().await;
            } else {
                session.abort();
            }
        }
        slot.release();

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                tracing::info!(
                    exit_code = ?capture.exit_code,
                    signal = ?capture.signal,
                    duration_ms,
                    stdout_bytes = capture.stdout.len(),
                    stderr_bytes = capture.stderr.len(),
                    "command completed"
                );
                progress.report(1.0, Some("completed"));
                Ok(ShellOutput {
                    stdout: capture.stdout.as_string(),
                    stderr: capture.stderr.as_string(),
                    truncated: TruncationFlags {
                        stdout: capture.stdout.is_truncated(),
                        stderr: capture.stderr.is_truncated(),
                    },
                    exit_code: capture.exit_code,
                    signal: capture.signal,
                    duration_ms,
                })
            }
            Err(e @ (BrokerError::Timeout { .. } | BrokerError::Cancelled { .. })) => {
                tracing::warn!(duration_ms, "command aborted: {e}");
                Err(e)
            }
            Err(e) => {
                tracing::info!(duration_ms, "command failed: {e}");
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        target: &ShellTarget,
        spec: &ExecSpec,
        session: &mut Option<C::Session>,
        capture: &mut Capture,
        progress: &ProgressReporter,
    ) -> Result<(), BrokerError> {
        progress.report(0.1, Some("connecting"));
        let session = session.insert(self.connector.connect(target).await?);

        progress.report(0.2, Some("executing"));
        session.exec(spec).await?;

        while let Some(event) = session.next_event().await? {
            match event {
                SessionEvent::Stdout(bytes) => capture.stdout.push(&bytes),
                SessionEvent::Stderr(bytes) => capture.stderr.push(&bytes),
                SessionEvent::ExitStatus(code) => capture.exit_code = Some(code),
                SessionEvent::ExitSignal(signal) => capture.signal = Some(signal),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use warden_core::{AllowPattern, ProfileSnapshot, Secret, ShellAuth, ShellPolicy, ShellProfile};

    use super::*;

    #[derive(Debug, Default)]
    struct Counters {
        connects: AtomicUsize,
        closes: AtomicUsize,
        aborts: AtomicUsize,
        last_command: Mutex<Option<String>>,
        last_env: Mutex<BTreeMap<String, String>>,
        last_auth: Mutex<Option<ShellAuth>>,
    }

    #[derive(Debug, Clone, Default)]
    struct ScriptedConnector {
        events: Vec<SessionEvent>,
        hang: bool,
        hang_connect: bool,
        /// Fired by the session right before it reports end of stream.
        cancel_on_finish: Option<CancelToken>,
        counters: Arc<Counters>,
    }

    struct ScriptedSession {
        events: VecDeque<SessionEvent>,
        hang: bool,
        cancel_on_finish: Option<CancelToken>,
        counters: Arc<Counters>,
    }

    impl ShellConnector for ScriptedConnector {
        type Session = ScriptedSession;

        async fn connect(&self, target: &ShellTarget) -> Result<ScriptedSession, BrokerError> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            *self.counters.last_auth.lock().unwrap() = Some(target.auth.clone());
            if self.hang_connect {
                std::future::pending::<()>().await;
            }
            Ok(ScriptedSession {
                events: self.events.clone().into(),
                hang: self.hang,
                cancel_on_finish: self.cancel_on_finish.clone(),
                counters: Arc::clone(&self.counters),
            })
        }
    }

    impl ShellSession for ScriptedSession {
        async fn exec(&mut self, spec: &ExecSpec) -> Result<(), BrokerError> {
            *self.counters.last_command.lock().unwrap() = Some(spec.command_line());
            self.counters.last_env.lock().unwrap().clone_from(&spec.env);
            Ok(())
        }

        async fn next_event(&mut self) -> Result<Option<SessionEvent>, BrokerError> {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            if let Some(token) = &self.cancel_on_finish {
                token.cancel_with_reason("late stop");
            }
            Ok(None)
        }

        async fn close(self) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn abort(self) {
            self.counters.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn profile(patterns: &[&str]) -> ShellProfile {
        ShellProfile {
            host: "10.0.0.5".into(),
            port: 22,
            username: "trainer".into(),
            password: Some(Secret::new("pw")),
            private_key: None,
            passphrase: None,
            policy: ShellPolicy {
                allowed_command_patterns: patterns
                    .iter()
                    .map(|p| AllowPattern::new(p).unwrap())
                    .collect(),
                max_execution_ms: 2_000,
                max_output_bytes: 8,
                max_concurrent: 1,
                unrestricted_local: false,
            },
        }
    }

    fn executor(
        profile: ShellProfile,
        events: Vec<SessionEvent>,
        hang: bool,
    ) -> (ShellExecutor<ScriptedConnector>, Arc<Counters>) {
        scripted(
            profile,
            ScriptedConnector {
                events,
                hang,
                ..ScriptedConnector::default()
            },
        )
    }

    fn scripted(
        profile: ShellProfile,
        connector: ScriptedConnector,
    ) -> (ShellExecutor<ScriptedConnector>, Arc<Counters>) {
        let counters = Arc::clone(&connector.counters);
        let mut ssh_profiles = HashMap::new();
        ssh_profiles.insert("gpu".to_owned(), profile);
        let store = ProfileStore::new(ProfileSnapshot {
            ssh_profiles,
            ..ProfileSnapshot::default()
        });
        (ShellExecutor::new(connector, store), counters)
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let (exec, counters) = executor(
            profile(&[]),
            vec![
                SessionEvent::Stdout(b"hello\n".to_vec()),
                SessionEvent::Stderr(b"warn\n".to_vec()),
                SessionEvent::ExitStatus(0),
            ],
            false,
        );
        let out = exec
            .execute(
                &ShellRequest::new("gpu", "echo hello"),
                &CancelToken::new(),
                &ProgressReporter::disabled(),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "warn\n");
        assert_eq!(out.exit_code, Some(0));
        assert!(out.succeeded());
        assert_eq!(out.truncated, TruncationFlags::default());
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.aborts.load(Ordering::SeqCst), 0);
        assert_eq!(exec.limiter().tracked_keys(), 0);
    }

    #[tokio::test]
    async fn streams_truncate_independently() {
        let (exec, _) = executor(
            profile(&[]),
            vec![
                SessionEvent::Stdout(b"0123456789".to_vec()),
                SessionEvent::Stderr(b"err".to_vec()),
                SessionEvent::ExitSignal("TERM".into()),
            ],
            false,
        );
        let out = exec
            .execute(
                &ShellRequest::new("gpu", "yes"),
                &CancelToken::new(),
                &ProgressReporter::disabled(),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, "01234567");
        assert!(out.truncated.stdout);
        assert!(!out.truncated.stderr);
        assert_eq!(out.signal.as_deref(), Some("TERM"));
        assert!(!out.succeeded());
    }

    #[tokio::test]
    async fn output_override_cannot_loosen() {
        let (exec, _) = executor(
            profile(&[]),
            vec![SessionEvent::Stdout(b"0123456789".to_vec())],
            false,
        );
        let mut request = ShellRequest::new("gpu", "cat big");
        request.options.max_output_bytes = Some(1_000_000);
        let out = exec
            .execute(&request, &CancelToken::new(), &ProgressReporter::disabled())
            .await
            .unwrap();
        assert_eq!(out.stdout.len(), 8);

        request.options.max_output_bytes = Some(3);
        let out = exec
            .execute(&request, &CancelToken::new(), &ProgressReporter::disabled())
            .await
            .unwrap();
        assert_eq!(out.stdout, "012");
    }

    #[tokio::test]
    async fn policy_violation_makes_no_connection() {
        let (exec, counters) = executor(profile(&["nvidia-smi"]), vec![], false);
        let err = exec
            .execute(
                &ShellRequest::new("gpu", "rm -rf /"),
                &CancelToken::new(),
                &ProgressReporter::disabled(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PolicyViolation));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_profile_not_found() {
        let (exec, counters) = executor(profile(&[]), vec![], false);
        let err = exec
            .execute(
                &ShellRequest::new("missing", "ls"),
                &CancelToken::new(),
                &ProgressReporter::disabled(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound { .. }));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_credentials_surfaced() {
        let mut p = profile(&[]);
        p.password = None;
        let (exec, counters) = executor(p, vec![], false);
        let err = exec
            .execute(
                &ShellRequest::new("gpu", "ls"),
                &CancelToken::new(),
                &ProgressReporter::disabled(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::MissingCredentials { .. }));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn key_preferred_when_both_present() {
        let mut p = profile(&[]);
        p.private_key = Some(Secret::new("KEY"));
        let (exec, counters) = executor(p, vec![], false);
        exec.execute(
            &ShellRequest::new("gpu", "ls"),
            &CancelToken::new(),
            &ProgressReporter::disabled(),
        )
        .await
        .unwrap();
        let auth = counters.last_auth.lock().unwrap().clone().unwrap();
        assert!(matches!(auth, ShellAuth::PrivateKey { .. }));
    }

    #[tokio::test]
    async fn timeout_aborts_session() {
        let (exec, counters) = executor(profile(&[]), vec![], true);
        let mut request = ShellRequest::new("gpu", "sleep 100");
        request.options.timeout_ms = Some(50);
        let started = Instant::now();
        let err = exec
            .execute(&request, &CancelToken::new(), &ProgressReporter::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout { timeout_ms: 50 }));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert_eq!(counters.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);
        assert_eq!(exec.limiter().tracked_keys(), 0);
    }

    #[tokio::test]
    async fn cancel_while_executing_aborts() {
        let (exec, counters) = executor(profile(&[]), vec![], true);
        let token = CancelToken::new();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            t.cancel_with_reason("stop");
        });
        let err = exec
            .execute(
                &ShellRequest::new("gpu", "sleep 100"),
                &token,
                &ProgressReporter::disabled(),
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(counters.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(exec.limiter().tracked_keys(), 0);
    }

    #[tokio::test]
    async fn cwd_and_env_forwarded() {
        let (exec, counters) = executor(profile(&[]), vec![], false);
        let mut request = ShellRequest::new("gpu", "ls");
        request.options.cwd = Some("/data".into());
        request.options.env.insert("CUDA_VISIBLE_DEVICES".into(), "0,1".into());
        exec.execute(&request, &CancelToken::new(), &ProgressReporter::disabled())
            .await
            .unwrap();
        assert_eq!(
            counters.last_command.lock().unwrap().as_deref(),
            Some("cd '/data' && ls")
        );
        let env = counters.last_env.lock().unwrap().clone();
        assert_eq!(env.len(), 1);
        assert_eq!(env["CUDA_VISIBLE_DEVICES"], "0,1");
    }

    #[tokio::test]
    async fn completion_wins_over_simultaneous_cancel() {
        let token = CancelToken::new();
        let (exec, counters) = scripted(
            profile(&[]),
            ScriptedConnector {
                events: vec![SessionEvent::ExitStatus(0)],
                cancel_on_finish: Some(token.clone()),
                ..ScriptedConnector::default()
            },
        );
        let out = exec
            .execute(
                &ShellRequest::new("gpu", "true"),
                &token,
                &ProgressReporter::disabled(),
            )
            .await
            .unwrap();
        assert!(token.is_cancelled());
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.aborts.load(Ordering::SeqCst), 0);
        assert_eq!(exec.limiter().tracked_keys(), 0);
    }

    #[tokio::test]
    async fn cancel_during_connect_leaves_nothing_behind() {
        let (exec, counters) = scripted(
            profile(&[]),
            ScriptedConnector {
                hang_connect: true,
                ..ScriptedConnector::default()
            },
        );
        let token = CancelToken::new();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            t.cancel_with_reason("stop");
        });
        let err = exec
            .execute(
                &ShellRequest::new("gpu", "ls"),
                &token,
                &ProgressReporter::disabled(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Cancelled { reason: Some(ref r) } if r == "stop"));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        assert!(counters.last_command.lock().unwrap().is_none());
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);
        assert_eq!(counters.aborts.load(Ordering::SeqCst), 0);
        assert_eq!(exec.limiter().tracked_keys(), 0);
    }

    #[test]
    fn request_deserializes_flat_options() {
        let json = serde_json::json!({
            "profile": "gpu",
            "command": "ls",
            "timeoutMs": 500,
            "cwd": "/tmp",
            "env": {"A": "1"}
        });
        let req: ShellRequest = serde_json::from_value(json).unwrap();
        assert_eq!(req.options.timeout_ms, Some(500));
        assert_eq!(req.options.cwd.as_deref(), Some("/tmp"));
        assert_eq!(req.options.env["A"], "1");
    }

    #[test]
    fn output_serializes_camel_case() {
        let out = ShellOutput {
            stdout: "x".into(),
            stderr: String::new(),
            truncated: TruncationFlags::default(),
            exit_code: Some(0),
            signal: None,
            duration_ms: 3,
        };
        let json = serde_json::to_string(&out).unwrap();
        assert!(json.contains("\"exitCode\":0"));
        assert!(json.contains("\"durationMs\":3"));
        assert!(!json.contains("signal"));
    }
}
