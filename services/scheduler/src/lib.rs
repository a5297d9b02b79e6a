//! Cluster scheduler.
//!
//! Converges the jobs running on hosts to the formations recorded in the
//! controller. The scheduler follows formation changes, host membership and
//! every host's job events, and rectifies each formation whenever one of
//! them changes. A periodic anti-entropy pass repairs anything the event
//! streams missed.
//!
//! Several schedulers may run; the oldest one registered in discovery leads
//! and the others keep warm state until promoted.

pub mod config;
pub mod error;
pub mod events;
pub mod formation;
pub mod host;
pub mod monitor;
pub mod rectify;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use events::{RemovalReason, SchedulerEvent};
pub use formation::{FormationSnapshot, FormationTable, TrackedJob, TrackedState};
pub use host::{
    host_attrs, Host, HostClient, HostConnector, HostError, HostPool, HttpConnector, MockCluster,
    MockHost, PoolEvent, HOST_SERVICE,
};
pub use scheduler::{Election, Scheduler, SchedulerConfig, SCHEDULER_SERVICE};
