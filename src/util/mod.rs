pub mod backoff;

pub use backoff::{BackoffConfig, ConnectionBackoff, MAX_BACKOFF_MILLIS, RANDOM_FACTOR};
