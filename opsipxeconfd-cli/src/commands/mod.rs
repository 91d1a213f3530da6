pub mod start;
pub mod status;
pub mod stop;
pub mod update;

use std::time::Duration;

/// Timeout for one control-socket round trip.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
