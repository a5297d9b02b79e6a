//! # tug-events
//!
//! Records shared by every tug service.
//!
//! ## Desired state
//!
//! The controller owns apps, releases, artifacts, formations, scale requests
//! and deployments. A formation maps `(app, release)` to per-process-type
//! replica counts and placement tags; an [`ExpandedFormation`] joins it with
//! its release and artifacts so the scheduler can build job specs without
//! further lookups.
//!
//! ## Running state
//!
//! Hosts report [`ActiveJob`]s and stream [`HostEvent`]s. The scheduler
//! mirrors job transitions back to the controller as [`JobRecord`]s, which
//! the deployer watches while it rolls a formation forward.
//!
//! ## Wire format
//!
//! Everything is JSON. Long-lived streams are newline-delimited JSON, decoded
//! with [`ndjson::decode`].

mod deployment;
mod error;
mod formation;
mod job;
pub mod ndjson;
mod types;

pub use deployment::*;
pub use error::EventError;
pub use formation::*;
pub use job::*;
pub use types::*;
