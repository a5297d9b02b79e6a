//! Rollout strategies.
//!
//! A strategy only decides the order of scale steps and what to wait for
//! between them. Rolling back is the deployer's job.

mod all_at_once;
mod one_by_one;

use tug_events::DeploymentStrategy;

use crate::rollout::Rollout;
use crate::DeployResult;

pub use all_at_once::all_at_once;
pub use one_by_one::one_by_one;

/// Drives `rollout` to completion with `strategy`.
pub async fn perform(strategy: DeploymentStrategy, rollout: &mut Rollout) -> DeployResult<()> {
    match strategy {
        DeploymentStrategy::OneByOne => one_by_one(rollout).await,
        DeploymentStrategy::AllAtOnce => all_at_once(rollout).await,
    }
}
