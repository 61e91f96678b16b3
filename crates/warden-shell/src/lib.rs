//! Remote shell execution: policy check, slot acquisition, SSH transport,
//! bounded capture, timeout and cancellation.

pub mod executor;
pub mod ssh;
pub mod transport;

pub use executor::{ShellExecutor, ShellOptions, ShellOutput, ShellRequest, TruncationFlags};
pub use ssh::RusshConnector;
pub use transport::{ExecSpec, SessionEvent, ShellConnector, ShellSession, ShellTarget};
