use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Deserialize;

use crate::error::BrokerError;
use crate::policy::AllowPattern;

/// Wrapper for sensitive strings with redacted Debug/Display.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Limits applied to every command run under a shell profile.
#[derive(Debug, Clone)]
pub struct ShellPolicy {
    pub allowed_command_patterns: Vec<AllowPattern>,
    pub max_execution_ms: u64,
    pub max_output_bytes: usize,
    pub max_concurrent: usize,
    /// Opt-in policy bypass, honoured only for loopback hosts in local test mode.
    pub unrestricted_local: bool,
}

#[derive(Debug, Clone)]
pub struct ShellProfile {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<Secret>,
    pub private_key: Option<Secret>,
    pub passphrase: Option<Secret>,
    pub policy: ShellPolicy,
}

/// The single auth method used for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellAuth {
    PrivateKey {
        key: Secret,
        passphrase: Option<Secret>,
    },
    Password(Secret),
}

impl ShellProfile {
    /// Pick exactly one auth method, preferring the private key.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::MissingCredentials` when neither secret is set.
    pub fn auth(&self, name: &str) -> Result<ShellAuth, BrokerError> {
        if let Some(key) = &self.private_key {
            return Ok(ShellAuth::PrivateKey {
                key: key.clone(),
                passphrase: self.passphrase.clone(),
            });
        }
        if let Some(password) = &self.password {
            return Ok(ShellAuth::Password(password.clone()));
        }
        Err(BrokerError::MissingCredentials {
            profile: name.to_owned(),
        })
    }

    #[must_use]
    pub fn is_loopback(&self) -> bool {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        host.eq_ignore_ascii_case("localhost")
            || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseProfile {
    pub connection_string: Secret,
    pub allowed_statement_patterns: Vec<AllowPattern>,
    pub max_rows: usize,
    pub max_execution_ms: u64,
    pub max_concurrent: usize,
}

/// Resolved, read-only view of every profile.
#[derive(Debug, Clone, Default)]
pub struct ProfileSnapshot {
    pub ssh_profiles: HashMap<String, ShellProfile>,
    pub database_profiles: HashMap<String, DatabaseProfile>,
    pub local_test_mode: bool,
}

impl ProfileSnapshot {
    /// # Errors
    ///
    /// Returns `BrokerError::NotFound` for an unknown name.
    pub fn ssh(&self, name: &str) -> Result<&ShellProfile, BrokerError> {
        self.ssh_profiles.get(name).ok_or_else(|| BrokerError::NotFound {
            profile: name.to_owned(),
        })
    }

    /// # Errors
    ///
    /// Returns `BrokerError::NotFound` for an unknown name.
    pub fn database(&self, name: &str) -> Result<&DatabaseProfile, BrokerError> {
        self.database_profiles
            .get(name)
            .ok_or_else(|| BrokerError::NotFound {
                profile: name.to_owned(),
            })
    }

    /// Whether commands under this profile skip the allowlist.
    #[must_use]
    pub fn bypasses_policy(&self, profile: &ShellProfile) -> bool {
        self.local_test_mode && profile.policy.unrestricted_local && profile.is_loopback()
    }
}

/// Holder of the live snapshot. Replacement swaps the whole map at once.
#[derive(Debug, Clone, Default)]
pub struct ProfileStore {
    current: Arc<RwLock<Arc<ProfileSnapshot>>>,
}

impl ProfileStore {
    #[must_use]
    pub fn new(snapshot: ProfileSnapshot) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    /// Current snapshot. In-flight calls keep the one they loaded.
    #[must_use]
    pub fn load(&self) -> Arc<ProfileSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn replace(&self, snapshot: ProfileSnapshot) {
        let ssh = snapshot.ssh_profiles.len();
        let db = snapshot.database_profiles.len();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
        tracing::info!(ssh_profiles = ssh, database_profiles = db, "profile snapshot replaced");
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::shell_profile;
    use super::*;

    #[test]
    fn secret_is_redacted() {
        let s = Secret::new("hunter2");
        assert_eq!(format!("{s:?}"), "[REDACTED]");
        assert_eq!(s.to_string(), "[REDACTED]");
        assert_eq!(s.expose(), "hunter2");
    }

    #[test]
    fn private_key_preferred_over_password() {
        let mut p = shell_profile("10.0.0.5");
        p.password = Some(Secret::new("pw"));
        p.private_key = Some(Secret::new("KEY"));
        p.passphrase = Some(Secret::new("phrase"));
        let auth = p.auth("gpu").unwrap();
        assert_eq!(
            auth,
            ShellAuth::PrivateKey {
                key: Secret::new("KEY"),
                passphrase: Some(Secret::new("phrase")),
            }
        );
    }

    #[test]
    fn password_used_without_key() {
        let mut p = shell_profile("10.0.0.5");
        p.password = Some(Secret::new("pw"));
        assert_eq!(p.auth("gpu").unwrap(), ShellAuth::Password(Secret::new("pw")));
    }

    #[test]
    fn missing_credentials() {
        let p = shell_profile("10.0.0.5");
        let err = p.auth("gpu").unwrap_err();
        assert!(matches!(err, BrokerError::MissingCredentials { profile } if profile == "gpu"));
    }

    #[test]
    fn loopback_detection() {
        assert!(shell_profile("localhost").is_loopback());
        assert!(shell_profile("127.0.0.1").is_loopback());
        assert!(shell_profile("127.8.0.3").is_loopback());
        assert!(shell_profile("::1").is_loopback());
        assert!(shell_profile("[::1]").is_loopback());
        assert!(!shell_profile("10.0.0.5").is_loopback());
        assert!(!shell_profile("localhost.example.com").is_loopback());
    }

    #[test]
    fn bypass_requires_all_three_gates() {
        let mut local = shell_profile("127.0.0.1");
        local.policy.unrestricted_local = true;
        let mut snapshot = ProfileSnapshot::default();
        assert!(!snapshot.bypasses_policy(&local));

        snapshot.local_test_mode = true;
        assert!(snapshot.bypasses_policy(&local));

        let mut remote = shell_profile("10.0.0.5");
        remote.policy.unrestricted_local = true;
        assert!(!snapshot.bypasses_policy(&remote));

        local.policy.unrestricted_local = false;
        assert!(!snapshot.bypasses_policy(&local));
    }

    #[test]
    fn unknown_profile_not_found() {
        let snapshot = ProfileSnapshot::default();
        assert!(matches!(
            snapshot.ssh("nope"),
            Err(BrokerError::NotFound { .. })
        ));
        assert!(matches!(
            snapshot.database("nope"),
            Err(BrokerError::NotFound { .. })
        ));
    }

    #[test]
    fn store_replaces_whole_snapshot() {
        let mut first = ProfileSnapshot::default();
        first
            .ssh_profiles
            .insert("a".into(), shell_profile("10.0.0.1"));
        let store = ProfileStore::new(first);
        let held = store.load();

        let mut second = ProfileSnapshot::default();
        second
            .ssh_profiles
            .insert("b".into(), shell_profile("10.0.0.2"));
        store.replace(second);

        assert!(held.ssh("a").is_ok());
        let now = store.load();
        assert!(now.ssh("a").is_err());
        assert!(now.ssh("b").is_ok());
    }
}
