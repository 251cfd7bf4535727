//! Running a shell script on a scale set instance through the ARM runCommand
//! operation.

pub mod executor;
pub mod response;

pub use executor::{shell_quote, wrap_script, RemoteCommandExecutor, RunCommandRequest};
pub use response::{parse_run_command_message, RunCommandResult};

/// The runCommand API keeps at most this many bytes of output.
pub const BYTES_LIMIT: usize = 4096;

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Status code of a successful run.
pub const SUCCESS_CODE: &str = "ProvisioningState/succeeded";

pub const TRUNCATED_SUFFIX: &str = "... (truncated)";

/// Which end of an oversized output to drop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputTruncate {
    /// Keep the first [`BYTES_LIMIT`] bytes. Most diagnostic tools print a
    /// header first, so this is the default.
    #[default]
    Tail,
    /// Keep the last [`BYTES_LIMIT`] bytes, which is what the API does on its own.
    Head,
}
