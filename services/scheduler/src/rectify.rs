//! Placement and stop decisions.
//!
//! Everything here is pure: given the hosts and a formation's tracked jobs
//! it decides where new jobs go and which jobs to stop. The scheduler
//! applies the decisions.

use std::collections::{BTreeMap, HashMap};

use tug_events::{attrs, ExpandedFormation, JobSpec, Processes};
use tug_id::{HostId, JobId};

use crate::formation::{FormationState, TrackedJob, TrackedState};
use crate::host::Host;
use crate::{SchedulerError, SchedulerResult};

/// Per-type change needed: positive to start jobs, negative to stop them.
pub fn plan(state: &FormationState) -> BTreeMap<String, i64> {
    tug_reconcile::diff_processes(&state.desired(), &state.live_counts())
}

/// Live jobs of one type per host.
pub fn type_load(state: &FormationState, process_type: &str) -> HashMap<HostId, usize> {
    let mut load = HashMap::new();
    for job in state
        .jobs_of(process_type)
        .filter(|j| j.state != TrackedState::Stopping)
    {
        *load.entry(job.host_id.clone()).or_default() += 1;
    }
    load
}

/// Picks the host for one new job: among hosts carrying every required
/// tag, the one with the fewest jobs of the same type, then the smallest
/// host id.
pub fn select_host<'a>(
    hosts: &'a [Host],
    process_type: &str,
    tags: Option<&BTreeMap<String, String>>,
    load: &HashMap<HostId, usize>,
) -> SchedulerResult<&'a Host> {
    if hosts.is_empty() {
        return Err(SchedulerError::NoHosts);
    }
    hosts
        .iter()
        .filter(|h| h.satisfies(tags))
        .min_by(|a, b| {
            let la = load.get(&a.id).copied().unwrap_or(0);
            let lb = load.get(&b.id).copied().unwrap_or(0);
            la.cmp(&lb).then_with(|| a.id.cmp(&b.id))
        })
        .ok_or_else(|| SchedulerError::NoMatchingHosts {
            process_type: process_type.to_string(),
            tags: tags.cloned().unwrap_or_default(),
        })
}

/// Chooses `n` jobs to stop: from the most loaded host first, and the
/// largest job id among equals.
pub fn select_stops(jobs: &[&TrackedJob], n: usize) -> Vec<JobId> {
    let mut load: HashMap<&HostId, usize> = HashMap::new();
    for job in jobs {
        *load.entry(&job.host_id).or_default() += 1;
    }

    let mut candidates: Vec<&TrackedJob> = jobs.to_vec();
    let mut chosen = Vec::with_capacity(n.min(jobs.len()));
    while chosen.len() < n {
        let Some((idx, _)) = candidates.iter().enumerate().max_by(|(_, a), (_, b)| {
            let la = load.get(&a.host_id).copied().unwrap_or(0);
            let lb = load.get(&b.host_id).copied().unwrap_or(0);
            la.cmp(&lb).then_with(|| a.job_id.cmp(&b.job_id))
        }) else {
            break;
        };
        let job = candidates.swap_remove(idx);
        if let Some(l) = load.get_mut(&job.host_id) {
            *l = l.saturating_sub(1);
        }
        chosen.push(job.job_id);
    }
    chosen
}

/// Live jobs whose host no longer satisfies their type's tags. Jobs on
/// hosts missing from `hosts` are left alone.
pub fn mismatched_jobs(state: &FormationState, hosts: &[Host]) -> Vec<JobId> {
    let Some(formation) = &state.formation else {
        return Vec::new();
    };
    let hosts: HashMap<&HostId, &Host> = hosts.iter().map(|h| (&h.id, h)).collect();
    state
        .jobs()
        .filter(|j| j.state != TrackedState::Stopping)
        .filter(|j| {
            hosts
                .get(&j.host_id)
                .is_some_and(|h| !h.satisfies(formation.tags_for(&j.process_type)))
        })
        .map(|j| j.job_id)
        .collect()
}

/// Builds the spec for a new job of `process_type`.
pub fn job_spec(formation: &ExpandedFormation, process_type: &str) -> SchedulerResult<JobSpec> {
    let artifact = formation
        .artifacts
        .first()
        .ok_or(SchedulerError::MissingArtifact(formation.release.id))?;
    let process = formation
        .release
        .processes
        .get(process_type)
        .cloned()
        .unwrap_or_default();

    let mut env = formation.release.env.clone();
    env.extend(process.env);

    let attributes = BTreeMap::from([
        (attrs::APP_ID.to_string(), formation.app.id.to_string()),
        (attrs::RELEASE_ID.to_string(), formation.release.id.to_string()),
        (attrs::PROCESS_TYPE.to_string(), process_type.to_string()),
    ]);

    Ok(JobSpec {
        id: JobId::new(),
        image_ref: artifact.uri.clone(),
        entrypoint: process.entrypoint,
        args: process.args,
        env,
        mounts: process.mounts,
        ports: process.ports,
        attributes,
        resources: process.resources,
    })
}

/// True when the formation's pending scale request has been carried out.
pub fn scale_request_done(state: &FormationState) -> bool {
    state
        .formation
        .as_ref()
        .and_then(|f| f.pending_scale_request.as_ref())
        .is_some_and(|r| r.is_pending())
        && state.is_converged()
}

/// Desired counts of a formation with degraded and blocked types held at
/// their live counts, for reporting.
pub fn effective_desired(state: &FormationState) -> Processes {
    let live = state.live_counts();
    state
        .desired()
        .into_iter()
        .map(|(t, n)| {
            if state.degraded.contains(&t) || state.blocked.contains_key(&t) {
                let have = live.get(&t).copied().unwrap_or(0);
                (t, have.min(n))
            } else {
                (t, n)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::rstest;
    use tug_events::{App, Artifact, ProcessType, Release, Tags};
    use tug_id::{AppId, ArtifactId, ReleaseId};

    fn host(id: &str, tags: &[(&str, &str)]) -> Host {
        Host {
            id: HostId::new(id).unwrap(),
            addr: format!("{id}:1113"),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn tracked(host: &str, n: u64) -> TrackedJob {
        // Fixed ids so ordering is predictable.
        let id: JobId = format!("job_01HV4Z2WQXKJNM8GPQY6VBK{:03}", n)
            .parse()
            .unwrap();
        TrackedJob {
            job_id: id,
            host_id: HostId::new(host).unwrap(),
            process_type: "web".to_string(),
            state: TrackedState::Running,
        }
    }

    fn formation() -> ExpandedFormation {
        let app_id = AppId::new();
        ExpandedFormation {
            app: App {
                id: app_id,
                name: "web".to_string(),
                release_id: None,
                meta: BTreeMap::new(),
            },
            release: Release {
                id: ReleaseId::new(),
                app_id: Some(app_id),
                artifact_ids: vec![],
                env: BTreeMap::from([
                    ("LOG".to_string(), "info".to_string()),
                    ("PORT".to_string(), "80".to_string()),
                ]),
                processes: BTreeMap::from([(
                    "web".to_string(),
                    ProcessType {
                        args: vec!["serve".to_string()],
                        env: BTreeMap::from([("PORT".to_string(), "8080".to_string())]),
                        ..ProcessType::default()
                    },
                )]),
                created_at: None,
            },
            artifacts: vec![Artifact {
                id: ArtifactId::new(),
                kind: "docker".to_string(),
                uri: "registry.local/web:2".to_string(),
                created_at: None,
            }],
            processes: Processes::from([("web".to_string(), 3)]),
            tags: Tags::new(),
            pending_scale_request: None,
            updated_at: Utc::now(),
            deleted: false,
        }
    }

    #[test]
    fn test_three_jobs_over_two_hosts() {
        let hosts = vec![host("h2", &[]), host("h1", &[])];
        let mut load = HashMap::new();
        let mut placed = Vec::new();
        for _ in 0..3 {
            let h = select_host(&hosts, "web", None, &load).unwrap();
            *load.entry(h.id.clone()).or_default() += 1;
            placed.push(h.id.to_string());
        }
        assert_eq!(placed, vec!["h1", "h2", "h1"]);
    }

    #[rstest]
    #[case(&[("disk", "ssd")], "h2")]
    #[case(&[("disk", "ssd"), ("zone", "b")], "h3")]
    fn test_tags_filter_candidates(#[case] want: &[(&str, &str)], #[case] expected: &str) {
        let hosts = vec![
            host("h1", &[("disk", "hdd")]),
            host("h2", &[("disk", "ssd"), ("zone", "a")]),
            host("h3", &[("disk", "ssd"), ("zone", "b")]),
        ];
        let tags: BTreeMap<String, String> = want
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let chosen = select_host(&hosts, "web", Some(&tags), &HashMap::new()).unwrap();
        assert_eq!(chosen.id.as_str(), expected);
    }

    #[test]
    fn test_no_hosts_is_transient_and_no_match_is_permanent() {
        let err = select_host(&[], "web", None, &HashMap::new()).unwrap_err();
        assert!(err.is_transient());

        let tags = BTreeMap::from([("gpu".to_string(), "yes".to_string())]);
        let err = select_host(&[host("h1", &[])], "web", Some(&tags), &HashMap::new()).unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_stops_flatten_the_most_loaded_host() {
        let jobs = [
            tracked("h1", 1),
            tracked("h1", 2),
            tracked("h1", 3),
            tracked("h2", 4),
            tracked("h2", 5),
        ];
        let refs: Vec<&TrackedJob> = jobs.iter().collect();

        let stops = select_stops(&refs, 3);
        // h1 (3) -> job 3; h1 and h2 tie at 2 -> largest id, job 5; then
        // h1 has 2 against h2's 1 -> job 2.
        assert_eq!(stops, vec![jobs[2].job_id, jobs[4].job_id, jobs[1].job_id]);

        assert_eq!(select_stops(&refs, 10).len(), 5);
        assert!(select_stops(&refs, 0).is_empty());
    }

    #[test]
    fn test_job_spec_carries_owner_and_merged_env() {
        let f = formation();
        let spec = job_spec(&f, "web").unwrap();

        let owner = spec.owner().unwrap();
        assert_eq!(owner.key, f.key());
        assert_eq!(owner.process_type, "web");
        assert_eq!(spec.image_ref, "registry.local/web:2");
        assert_eq!(spec.args, vec!["serve"]);
        assert_eq!(spec.env["PORT"], "8080");
        assert_eq!(spec.env["LOG"], "info");

        let mut bare = f;
        bare.artifacts.clear();
        assert!(job_spec(&bare, "web").unwrap_err().is_permanent());
    }
}
