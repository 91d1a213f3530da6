//! Types shared between the opsipxeconfd daemon library and the CLI.

pub mod errors;

pub use errors::{OpsipxeconfdError, OpsipxeconfdResult};

/// Marker prefix for failure replies on the control socket.
///
/// Any reply starting with this string must be treated as an error by
/// callers; every other non-empty reply is a success.
pub const ERROR_MARKER: &str = "(ERROR)";
