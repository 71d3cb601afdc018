//! Concurrency building blocks used by the cache and edge protocols.

/// Single-resolution promise for pairing two tasks.
pub mod promise;

/// Edge conflict scheduler.
///
/// Dispatches attach requests so that no two in-flight requests share a node.
pub mod scheduler;

/// Admission throttle.
///
/// Bounds the number of concurrently active tasks per named class.
pub mod throttle;
