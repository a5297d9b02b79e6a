//! # tug-id
//!
//! Typed identifiers for the tug cluster.
//!
//! ## ID Formats
//!
//! Resources created by the platform use a prefixed ULID: `{prefix}_{ulid}`.
//!
//! - `app_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `rel_01HV4Z4NYPLTRS0JTUA8XDME5F`
//! - `job_01HV4Z5PZQMVST1KVWB9YENF6G`
//!
//! ULIDs sort by creation time, which the scheduler relies on when it has to
//! pick between otherwise equivalent jobs.
//!
//! Hosts are named by operators rather than generated, so [`HostId`] wraps a
//! validated string. Queue rows are keyed by a database sequence, so
//! [`QueueJobId`] wraps an `i64`.

mod error;
#[doc(hidden)]
pub mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
