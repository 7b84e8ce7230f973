//! Job definitions: the work to perform, per-job options, and the internal
//! job state owned by the scheduler core.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, JobError};
use crate::schedule::{Compiled, Schedule};

pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), JobError>> + Send>>;

/// The work a job performs. The closure captures its arguments at creation,
/// so there is nothing to type-check at call time.
#[derive(Clone)]
pub struct Task(Arc<dyn Fn() -> JobFuture + Send + Sync>);

impl Task {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        Self(Arc::new(move || Box::pin(f())))
    }

    pub(crate) fn call(&self) -> JobFuture {
        (self.0)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Task")
    }
}

/// Hook invoked around a job run, on the executing task.
pub type JobHook = Arc<dyn Fn(Uuid, &str) + Send + Sync>;
/// Hook invoked when a run (or the election gate) fails.
pub type JobErrorHook = Arc<dyn Fn(Uuid, &str, &JobError) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub before: Option<JobHook>,
    pub after: Option<JobHook>,
    pub after_error: Option<JobErrorHook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hooks")
    }
}

impl Hooks {
    fn merged(&self, defaults: &Hooks) -> Hooks {
        Hooks {
            before: self.before.clone().or_else(|| defaults.before.clone()),
            after: self.after.clone().or_else(|| defaults.after.clone()),
            after_error: self.after_error.clone().or_else(|| defaults.after_error.clone()),
        }
    }
}

/// Policy for a due instant that arrives while a previous execution of the
/// same job is still running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SingletonMode {
    /// Overlapping executions are allowed.
    #[default]
    Disabled,
    /// The due instant is skipped; the next occurrence stands.
    SkipIfRunning,
    /// The due instant is remembered and replayed once the running execution
    /// completes.
    QueueIfRunning,
}

/// Per-job options. Every unset field falls back to the scheduler's default
/// options, field by field; tags are a full override, never merged.
#[derive(Clone, Default)]
pub struct JobOptions {
    pub(crate) name: Option<String>,
    pub(crate) tags: Option<Vec<String>>,
    pub(crate) singleton: Option<SingletonMode>,
    pub(crate) run_limit: Option<u64>,
    pub(crate) start_at: Option<DateTime<Utc>>,
    pub(crate) timezone: Option<Tz>,
    pub(crate) hooks: Hooks,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_singleton(mut self, mode: SingletonMode) -> Self {
        self.singleton = Some(mode);
        self
    }

    /// Remove the job after it has executed `limit` times.
    pub fn with_run_limit(mut self, limit: u64) -> Self {
        self.run_limit = Some(limit);
        self
    }

    /// Earliest instant the job may first fire. Before it, the job is parked.
    pub fn with_start_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_at = Some(at);
        self
    }

    /// Timezone for calendar schedule computation, overriding the
    /// scheduler's default location.
    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.timezone = Some(tz);
        self
    }

    pub fn with_before_hook<F>(mut self, f: F) -> Self
    where
        F: Fn(Uuid, &str) + Send + Sync + 'static,
    {
        self.hooks.before = Some(Arc::new(f));
        self
    }

    pub fn with_after_hook<F>(mut self, f: F) -> Self
    where
        F: Fn(Uuid, &str) + Send + Sync + 'static,
    {
        self.hooks.after = Some(Arc::new(f));
        self
    }

    pub fn with_after_error_hook<F>(mut self, f: F) -> Self
    where
        F: Fn(Uuid, &str, &JobError) + Send + Sync + 'static,
    {
        self.hooks.after_error = Some(Arc::new(f));
        self
    }

    fn merged(&self, defaults: &JobOptions) -> JobOptions {
        JobOptions {
            name: self.name.clone().or_else(|| defaults.name.clone()),
            tags: self.tags.clone().or_else(|| defaults.tags.clone()),
            singleton: self.singleton.or(defaults.singleton),
            run_limit: self.run_limit.or(defaults.run_limit),
            start_at: self.start_at.or(defaults.start_at),
            timezone: self.timezone.or(defaults.timezone),
            hooks: self.hooks.merged(&defaults.hooks),
        }
    }
}

/// Everything needed to create (or replace) a job: the recurrence rule, the
/// work, and the options.
#[derive(Clone)]
pub struct JobSpec {
    pub schedule: Schedule,
    pub task: Task,
    pub options: JobOptions,
}

impl JobSpec {
    pub fn new(schedule: Schedule, task: Task) -> Self {
        Self { schedule, task, options: JobOptions::default() }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

/// Read-only snapshot of a job, taken at a single point in the registry's
/// mutation order. Accessors are pure reads of that snapshot.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub(crate) id: Uuid,
    pub(crate) name: String,
    pub(crate) tags: Vec<String>,
    pub(crate) last_run: Option<DateTime<Utc>>,
    pub(crate) next_run: Option<DateTime<Utc>>,
    pub(crate) run_count: u64,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.last_run
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.next_run
    }

    pub fn run_count(&self) -> u64 {
        self.run_count
    }
}

/// Full per-job state. Owned exclusively by the scheduler core task; the rest
/// of the crate only ever sees snapshots.
#[derive(Debug)]
pub(crate) struct Job {
    pub id: Uuid,
    pub name: String,
    pub tags: Vec<String>,
    pub compiled: Compiled,
    pub task: Task,
    pub hooks: Hooks,
    pub singleton: SingletonMode,
    pub run_limit: Option<u64>,
    pub start_at: Option<DateTime<Utc>>,
    pub tz: Tz,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    /// In-flight executions of this job.
    pub running: u32,
    /// Due instants deferred by `SingletonMode::QueueIfRunning`.
    pub queued: u32,
}

impl Job {
    /// Validate and build a job from a spec, applying the scheduler's default
    /// options and timezone. `next_run` is left unset; the core schedules it
    /// when (or if) the scheduler is started.
    pub(crate) fn build(
        spec: JobSpec,
        defaults: &JobOptions,
        scheduler_tz: Tz,
    ) -> Result<Job, Error> {
        let compiled = Compiled::compile(&spec.schedule)?;
        let opts = spec.options.merged(defaults);
        if opts.run_limit == Some(0) {
            return Err(Error::InvalidSchedule("run limit must be >= 1".into()));
        }
        Ok(Job {
            id: Uuid::new_v4(),
            name: opts.name.unwrap_or_default(),
            tags: opts.tags.unwrap_or_default(),
            compiled,
            task: spec.task,
            hooks: opts.hooks,
            singleton: opts.singleton.unwrap_or_default(),
            run_limit: opts.run_limit,
            start_at: opts.start_at,
            tz: opts.timezone.unwrap_or(scheduler_tz),
            last_run: None,
            next_run: None,
            run_count: 0,
            running: 0,
            queued: 0,
        })
    }

    pub(crate) fn snapshot(&self) -> JobHandle {
        JobHandle {
            id: self.id,
            name: self.name.clone(),
            tags: self.tags.clone(),
            last_run: self.last_run,
            next_run: self.next_run,
            run_count: self.run_count,
        }
    }

    pub(crate) fn limit_reached(&self) -> bool {
        self.run_limit.is_some_and(|l| self.run_count >= l)
    }

    /// First scheduling decision: a future `start_at` is the first due
    /// instant; otherwise the schedule computes from `now`.
    pub(crate) fn schedule_initial(&mut self, now: DateTime<Utc>) {
        self.next_run = match self.start_at {
            Some(at) if at > now => Some(at),
            _ => self.compiled.next_after(now, self.tz),
        };
        if self.next_run.is_none() {
            tracing::warn!(job_id = %self.id, "Schedule produced no next run; job parked");
        }
    }

    /// Advance past a due instant. Called exactly once per due instant, so a
    /// job never double-fires for the same instant.
    pub(crate) fn advance(&mut self, from: DateTime<Utc>) {
        self.next_run = self.compiled.next_after(from, self.tz);
        if self.next_run.is_none() {
            tracing::warn!(job_id = %self.id, "Schedule produced no next run; job parked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn noop_task() -> Task {
        Task::new(|| async { Ok(()) })
    }

    fn build(spec: JobSpec, defaults: &JobOptions) -> Job {
        Job::build(spec, defaults, chrono_tz::UTC).unwrap()
    }

    #[test]
    fn default_tags_apply_only_when_job_has_none() {
        let defaults = JobOptions::new().with_tags(["ops"]);

        let untagged = build(
            JobSpec::new(Schedule::every(Duration::from_secs(1)), noop_task()),
            &defaults,
        );
        assert_eq!(untagged.tags, vec!["ops".to_string()]);

        let tagged = build(
            JobSpec::new(Schedule::every(Duration::from_secs(1)), noop_task())
                .with_options(JobOptions::new().with_tags(["billing"])),
            &defaults,
        );
        // Full override: the default tag is not merged in.
        assert_eq!(tagged.tags, vec!["billing".to_string()]);
    }

    #[test]
    fn options_merge_field_by_field() {
        let defaults = JobOptions::new()
            .with_name("default-name")
            .with_singleton(SingletonMode::SkipIfRunning)
            .with_run_limit(3)
            .with_timezone(chrono_tz::America::New_York);

        let job = build(
            JobSpec::new(Schedule::every(Duration::from_secs(1)), noop_task())
                .with_options(JobOptions::new().with_name("mine")),
            &defaults,
        );
        assert_eq!(job.name, "mine");
        assert_eq!(job.singleton, SingletonMode::SkipIfRunning);
        assert_eq!(job.run_limit, Some(3));
        assert_eq!(job.tz, chrono_tz::America::New_York);
    }

    #[test]
    fn zero_run_limit_is_rejected() {
        let err = Job::build(
            JobSpec::new(Schedule::every(Duration::from_secs(1)), noop_task())
                .with_options(JobOptions::new().with_run_limit(0)),
            &JobOptions::default(),
            chrono_tz::UTC,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSchedule(_)));
    }

    #[test]
    fn future_start_at_is_the_first_due_instant() {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        let start_at = now + chrono::Duration::hours(2);
        let mut job = build(
            JobSpec::new(Schedule::every(Duration::from_secs(60)), noop_task())
                .with_options(JobOptions::new().with_start_at(start_at)),
            &JobOptions::default(),
        );
        job.schedule_initial(now);
        assert_eq!(job.next_run, Some(start_at));
    }

    #[test]
    fn past_start_at_schedules_normally() {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        let mut job = build(
            JobSpec::new(Schedule::every(Duration::from_secs(60)), noop_task())
                .with_options(JobOptions::new().with_start_at(now - chrono::Duration::hours(1))),
            &JobOptions::default(),
        );
        job.schedule_initial(now);
        assert_eq!(job.next_run, Some(now + chrono::Duration::seconds(60)));
    }
}
