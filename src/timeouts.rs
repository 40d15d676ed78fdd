//! Default verb timeouts and scheduling windows.
//!
//! These are the values `MetaConfig` falls back to when a field is omitted.

use std::time::Duration;

/// A replicated write older than this is no longer worth applying.
pub const MUTATION_TIMEOUT: Duration = Duration::from_millis(2_000);
/// Budget for a request/response round trip, including the callback.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFINITIONS_UPDATE_TIMEOUT: Duration = REQUEST_TIMEOUT;
pub const MIGRATION_REQUEST_TIMEOUT: Duration = REQUEST_TIMEOUT;

/// Anti-storm window before pulling schema from a peer that disagrees with us,
/// and the uptime below which pulls are issued immediately.
pub const MIGRATION_DELAY: Duration = Duration::from_millis(60_000);

/// Worker count for the mutation and response stages.
pub const MUTATION_WORKERS: usize = 4;
