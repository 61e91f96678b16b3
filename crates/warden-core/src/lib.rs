//! Shared core of the warden broker: cancellation, errors, output truncation,
//! per-profile concurrency limits, allowlist policy and profile snapshots.

pub mod buffer;
pub mod cancel;
pub mod config;
pub mod error;
pub mod limiter;
pub mod policy;
pub mod profile;
pub mod progress;

pub use buffer::TruncatingBuffer;
pub use cancel::CancelToken;
pub use config::{DatabaseProfileConfig, ProfilesConfig, ShellPolicyConfig, ShellProfileConfig};
pub use error::{BrokerError, ConfigError, ErrorKind};
pub use limiter::{ConcurrencyLimiter, SlotGuard};
pub use policy::{AllowPattern, PolicyGate, tighten};
pub use profile::{
    DatabaseProfile, ProfileSnapshot, ProfileStore, Secret, ShellAuth, ShellPolicy, ShellProfile,
};
pub use progress::{ProgressError, ProgressEvent, ProgressReporter, ProgressSink};
