//! Stream permit accounting for replication tools
//!
//! A storage endpoint exposes a limited number of replication streams and the user further caps
//! how many of those a single run may hold. This crate provides [`StreamLimit`], a counting
//! limiter that hands out [`StreamPermit`]s. Each permit represents one stream held by one
//! transfer and is returned automatically when dropped, so the number of concurrently held
//! streams can never exceed the configured cap.
//!
//! # Usage
//!
//! ```rust
//! use throttle::StreamLimit;
//!
//! let limit = StreamLimit::new(2);
//! let first = limit.try_acquire().unwrap();
//! let _second = limit.try_acquire().unwrap();
//! assert!(limit.try_acquire().is_none());
//! drop(first);
//! assert_eq!(limit.held(), 1);
//! assert_eq!(limit.peak(), 2);
//! ```
//!
//! Permits are never waited for. The scheduler polls [`StreamLimit::available`] on every tick and
//! only starts as many transfers as there are free permits.

mod semaphore;

pub use semaphore::{StreamLimit, StreamPermit};
