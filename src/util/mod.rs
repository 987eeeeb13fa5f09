//! Miscellaneous shared helpers (error taxonomy, retry policies).

pub mod error;
pub mod retry;

pub use error::{BranchedData, BrokerError, ComError, ErrorKind, HaError, StorageError};
pub use retry::{RetryHandle, RetryPolicy};
