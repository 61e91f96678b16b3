use crate::cancel::CancelToken;

/// Coarse classification of a [`BrokerError`], stable across message changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    PolicyViolation,
    MissingCredentials,
    Timeout,
    Cancelled,
    Transport,
}

/// Errors returned by the shell and query executors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("profile not found: {profile}")]
    NotFound { profile: String },

    /// Never names the rule that rejected the input.
    #[error("operation not permitted by profile policy")]
    PolicyViolation,

    #[error("profile {profile} has neither a password nor a private key")]
    MissingCredentials { profile: String },

    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("operation cancelled{}", .reason.as_deref().map_or_else(String::new, |r| format!(": {r}")))]
    Cancelled { reason: Option<String> },

    #[error("{0}")]
    Transport(String),
}

impl BrokerError {
    /// Cancelled error carrying the token's reason, if one was given.
    #[must_use]
    pub fn cancelled_by(token: &CancelToken) -> Self {
        Self::Cancelled {
            reason: token.reason(),
        }
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::PolicyViolation => ErrorKind::PolicyViolation,
            Self::MissingCredentials { .. } => ErrorKind::MissingCredentials,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Transport(_) => ErrorKind::Transport,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Cancellation supersedes an ordinary failure surfaced by an aborted operation.
    #[must_use]
    pub fn superseded_by(self, token: &CancelToken) -> Self {
        if token.is_cancelled() && !self.is_cancelled() {
            tracing::debug!(error = %self, "error superseded by cancellation");
            Self::cancelled_by(token)
        } else {
            self
        }
    }
}

/// Errors raised while compiling a [`crate::ProfilesConfig`] into a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid pattern {pattern:?} in profile {profile}: {source}")]
    InvalidPattern {
        profile: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("profile {profile} sets max_concurrent to 0")]
    ZeroConcurrency { profile: String },
}
