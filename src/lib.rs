//! clusterperf library
//!
//! Orchestrates a fleet of remote machines running database server
//! processes: starting, stopping, and wiping clusters over SSH, pushing
//! binaries with per-node progress, and driving resumable benchmark sweeps
//! whose captured results can be parsed, aligned, and compared across
//! binary versions.
//!
//! # Components
//!
//! - [`ssh`] - one pooled connection per `user@host`, agent authentication,
//!   and the scp-style push/fetch sub-protocol
//! - [`parallel`] - concurrent per-node fan-out with a live, in-place
//!   status display
//! - [`cluster`] - cluster topology and the operations fanned out across it
//! - [`server`] - the per-flavor capability interface for the server
//!   processes under test
//! - [`bench`] - the resumable concurrency-sweep driver
//! - [`results`] - capture parsing and run-set alignment for comparison

pub mod bench;
pub mod cluster;
pub mod hosts;
pub mod install;
pub mod parallel;
pub mod results;
pub mod server;
pub mod ssh;
