//! Policy-gated broker for remote shell commands, relational queries and
//! sequential training jobs.
//!
//! Every call resolves a named profile from the live [`ProfileStore`], checks
//! it against the profile's allowlist, waits for a per-profile concurrency
//! slot and then runs under a timeout and a caller-supplied [`CancelToken`].

pub use warden_core::{
    BrokerError, CancelToken, ConfigError, ErrorKind, ProfileSnapshot, ProfileStore,
    ProfilesConfig, ProgressEvent, ProgressReporter, ProgressSink,
};
pub use warden_shell::{
    RusshConnector, ShellConnector, ShellExecutor, ShellOptions, ShellOutput, ShellRequest,
};
pub use warden_sql::{PgConnector, QueryConnector, QueryExecutor, QueryOutput, QueryRequest};
pub use warden_training::{TrainingJob, TrainingJobInput, TrainingOrchestrator};

/// The three executors over one shared profile store.
///
/// Training commands go through a clone of the shell executor, so they count
/// against the same per-profile slots as direct shell calls.
#[derive(Debug, Clone)]
pub struct Broker<S = RusshConnector, Q = PgConnector> {
    profiles: ProfileStore,
    shell: ShellExecutor<S>,
    query: QueryExecutor<Q>,
    training: TrainingOrchestrator<ShellExecutor<S>>,
}

impl Broker {
    /// Broker with the SSH and PostgreSQL transports.
    #[must_use]
    pub fn new(snapshot: ProfileSnapshot) -> Self {
        Self::with_connectors(snapshot, RusshConnector::new(), PgConnector)
    }

    /// # Errors
    ///
    /// Returns `ConfigError` if any allowlist pattern fails to compile.
    pub fn from_config(config: ProfilesConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(ProfileSnapshot::try_from(config)?))
    }
}

impl<S, Q> Broker<S, Q>
where
    S: ShellConnector + Clone,
    Q: QueryConnector,
{
    #[must_use]
    pub fn with_connectors(snapshot: ProfileSnapshot, shell: S, query: Q) -> Self {
        let profiles = ProfileStore::new(snapshot);
        let shell = ShellExecutor::new(shell, profiles.clone());
        let training = TrainingOrchestrator::new(shell.clone());
        Self {
            query: QueryExecutor::new(query, profiles.clone()),
            shell,
            training,
            profiles,
        }
    }

    /// Swap the whole snapshot. Calls already in flight keep the one they loaded.
    pub fn replace_profiles(&self, snapshot: ProfileSnapshot) {
        self.profiles.replace(snapshot);
    }

    #[must_use]
    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    #[must_use]
    pub fn shell(&self) -> &ShellExecutor<S> {
        &self.shell
    }

    #[must_use]
    pub fn query(&self) -> &QueryExecutor<Q> {
        &self.query
    }

    #[must_use]
    pub fn training(&self) -> &TrainingOrchestrator<ShellExecutor<S>> {
        &self.training
    }
}

/// Install a `fmt` subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Does nothing if a global subscriber is already set.
pub fn init_subscriber() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("global tracing subscriber already installed");
    }
}
