//! Deployment worker.
//!
//! Deployments are queued as `deployment` jobs. A worker takes one, scales
//! the new release up and the old release down according to the
//! deployment's strategy, and watches the job transitions the scheduler
//! reports to the controller. Each step must finish within the
//! deployment's timeout; a timeout or a crashing new job rolls the app back
//! to its old formation.

pub mod config;
mod deployer;
pub mod error;
pub mod handler;
pub mod http;
mod job_events;
mod rollout;
pub mod strategy;

pub use deployer::{Deployer, DeployerConfig, DEFAULT_ROLLBACK_WAIT};
pub use error::{DeployError, DeployResult};
pub use handler::{DeploymentArgs, DeploymentHandler, JobSink, DEPLOYMENT_JOB};
pub use job_events::{JobEvents, Transition};
pub use rollout::Rollout;
