use tug_events::Processes;

use crate::rollout::Rollout;
use crate::DeployResult;

/// Brings the new formation to its target, waits for every new job, then
/// scales the old formation to zero and waits for every old job to stop.
pub async fn all_at_once(rollout: &mut Rollout) -> DeployResult<()> {
    let types = rollout.process_types();

    let starting: Processes = types
        .iter()
        .map(|t| (t.clone(), rollout.target(t).saturating_sub(rollout.new_count(t))))
        .collect();
    let targets: Processes = types.iter().map(|t| (t.clone(), rollout.target(t))).collect();
    rollout.scale_new_to(targets).await?;
    rollout.wait_new_up(&starting).await?;

    let stopping: Processes = types
        .iter()
        .map(|t| (t.clone(), rollout.old_count(t)))
        .collect();
    if stopping.values().any(|n| *n > 0) {
        let zeros = types.iter().map(|t| (t.clone(), 0)).collect();
        rollout.scale_old_to(zeros).await?;
    }
    rollout.wait_old_down(&stopping).await
}
