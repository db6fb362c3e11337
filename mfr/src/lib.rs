//! Managed file replication of backup sets between two storage endpoints
//!
//! A backup set is the group of files written by one backup run. This crate moves whole backup
//! sets between the `local` storage endpoint of a cluster and a `remote` one, using a bounded
//! number of the endpoints' replication streams.
//!
//! # Modules
//!
//! - [`endpoint`] - the contract a storage endpoint offers, and its errors
//! - [`ddboost`] - endpoint implementation driving the DD Boost command line helper
//! - [`backup`] - backup timestamps, files and sets, parsed from endpoint listings
//! - [`transfer`] - transfer of one file by a helper process, as a state machine
//! - [`scheduler`] - replication of a backup set under a stream budget
//! - [`delete`] - batched deletion of many files
//! - [`ops`] - the operations of the `mfr` tool
//!
//! # Stream budget
//!
//! Each endpoint limits how many streams can send (outbound) and receive (inbound) files, and
//! other applications share these streams. A replication never uses more streams than the cap
//! given by the user, and the cap may not exceed the ceilings of either endpoint. New transfers
//! are only started while the live capacity of both endpoints allows it.
//!
//! # Cancellation
//!
//! An interrupt from the user cancels the replication: running helpers are asked to stop, and
//! files that may have been written to the destination are deleted. A failed transfer aborts the
//! replication the same way.

pub mod backup;
pub mod ddboost;
pub mod delete;
pub mod endpoint;
pub mod ops;
pub mod scheduler;
pub mod transfer;

pub use scheduler::Settings;
pub use transfer::StopSignal;
