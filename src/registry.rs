//! Job storage owned by the scheduler core.
//!
//! A map keyed by job id plus an insertion-order list. The order list breaks
//! ties when several jobs share the same due instant, so dispatch order is
//! stable across runs.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::job::{Job, JobHandle};

#[derive(Default)]
pub(crate) struct Registry {
    jobs: std::collections::HashMap<Uuid, Job>,
    order: Vec<Uuid>,
}

impl Registry {
    pub fn insert(&mut self, job: Job) -> Uuid {
        let id = job.id;
        self.jobs.insert(id, job);
        self.order.push(id);
        id
    }

    /// Swap in a replacement job under an existing id, keeping the original
    /// insertion position.
    pub fn replace(&mut self, id: Uuid, mut job: Job) {
        job.id = id;
        self.jobs.insert(id, job);
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<Job> {
        let job = self.jobs.remove(id)?;
        self.order.retain(|o| o != id);
        Some(job)
    }

    /// Remove every job carrying `tag`. Returns the removed ids.
    pub fn remove_by_tag(&mut self, tag: &str) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self
            .order
            .iter()
            .filter(|id| {
                self.jobs
                    .get(id)
                    .is_some_and(|j| j.tags.iter().any(|t| t == tag))
            })
            .copied()
            .collect();
        for id in &ids {
            self.jobs.remove(id);
        }
        self.order.retain(|id| !ids.contains(id));
        ids
    }

    pub fn get(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.values_mut()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Snapshots of all jobs, in insertion order.
    pub fn snapshots(&self) -> Vec<JobHandle> {
        self.order
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .map(Job::snapshot)
            .collect()
    }

    /// Ids of jobs due at `now`, ordered by due instant then insertion order.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut due: Vec<(DateTime<Utc>, usize, Uuid)> = self
            .order
            .iter()
            .enumerate()
            .filter_map(|(idx, id)| {
                let next = self.jobs.get(id)?.next_run?;
                (next <= now).then_some((next, idx, *id))
            })
            .collect();
        due.sort();
        due.into_iter().map(|(_, _, id)| id).collect()
    }

    /// Earliest pending due instant across all jobs, if any.
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.jobs.values().filter_map(|j| j.next_run).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobOptions, JobSpec, Task};
    use crate::schedule::Schedule;
    use chrono::TimeZone;
    use std::time::Duration;

    fn make_job(tags: &[&str]) -> Job {
        let spec = JobSpec::new(
            Schedule::every(Duration::from_secs(60)),
            Task::new(|| async { Ok(()) }),
        )
        .with_options(JobOptions::new().with_tags(tags.iter().copied()));
        Job::build(spec, &JobOptions::default(), chrono_tz::UTC).unwrap()
    }

    #[test]
    fn snapshots_preserve_insertion_order() {
        let mut reg = Registry::default();
        let a = reg.insert(make_job(&[]));
        let b = reg.insert(make_job(&[]));
        let c = reg.insert(make_job(&[]));
        reg.remove(&b);
        let ids: Vec<Uuid> = reg.snapshots().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![a, c]);
    }

    #[test]
    fn remove_by_tag_removes_all_matches() {
        let mut reg = Registry::default();
        let a = reg.insert(make_job(&["batch", "nightly"]));
        let b = reg.insert(make_job(&["interactive"]));
        let c = reg.insert(make_job(&["batch"]));

        let removed = reg.remove_by_tag("batch");
        assert_eq!(removed, vec![a, c]);
        assert_eq!(reg.len(), 1);
        assert!(reg.get(&b).is_some());

        // No matches removes nothing and is not an error.
        assert!(reg.remove_by_tag("batch").is_empty());
    }

    #[test]
    fn due_orders_by_instant_then_insertion() {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        let mut reg = Registry::default();
        let a = reg.insert(make_job(&[]));
        let b = reg.insert(make_job(&[]));
        let c = reg.insert(make_job(&[]));

        reg.get_mut(&a).unwrap().next_run = Some(now);
        reg.get_mut(&b).unwrap().next_run = Some(now - chrono::Duration::seconds(5));
        reg.get_mut(&c).unwrap().next_run = Some(now);

        // b is earliest; a and c tie and fall back to insertion order.
        assert_eq!(reg.due(now), vec![b, a, c]);
        assert_eq!(reg.next_wake(), Some(now - chrono::Duration::seconds(5)));
    }

    #[test]
    fn due_skips_parked_and_future_jobs() {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        let mut reg = Registry::default();
        let parked = reg.insert(make_job(&[]));
        let future = reg.insert(make_job(&[]));
        reg.get_mut(&parked).unwrap().next_run = None;
        reg.get_mut(&future).unwrap().next_run = Some(now + chrono::Duration::seconds(1));
        assert!(reg.due(now).is_empty());
    }
}
