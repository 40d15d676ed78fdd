//! Miscellaneous shared helpers (error types, write clock).

pub mod clock;
pub mod error;

pub use clock::{now_seconds, timestamp_micros};
pub use error::{ConfigurationError, MetaError, StorageError};
