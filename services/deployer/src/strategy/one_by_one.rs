use tracing::debug;
use tug_events::Processes;

use crate::rollout::Rollout;
use crate::DeployResult;

/// Replaces jobs one at a time, per process type: start a new job and wait
/// for it to come up, then stop an old job and wait for it to go down.
pub async fn one_by_one(rollout: &mut Rollout) -> DeployResult<()> {
    for process_type in rollout.process_types() {
        let target = rollout.target(&process_type);
        debug!(
            deployment_id = %rollout.deployment.id,
            process_type = %process_type,
            target,
            old = rollout.old_count(&process_type),
            "Rolling process type"
        );

        while rollout.new_count(&process_type) < target || rollout.old_count(&process_type) > 0 {
            let one = Processes::from([(process_type.clone(), 1)]);

            let new = rollout.new_count(&process_type);
            if new < target {
                rollout.scale_new(&process_type, new + 1).await?;
                rollout.wait_new_up(&one).await?;
            }

            let old = rollout.old_count(&process_type);
            if old > 0 {
                rollout.scale_old(&process_type, old - 1).await?;
                rollout.wait_old_down(&one).await?;
            }
        }
    }
    Ok(())
}
