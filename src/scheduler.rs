//! Scheduler core and its public handle.
//!
//! All job state lives on a single spawned task (the core). [`Scheduler`] is
//! a cheap clonable handle that talks to the core over a message channel, so
//! registry access is serialized without any shared locks. The core never
//! awaits job code: due instants are handed to [`crate::executor`] tasks and
//! come back as completion messages.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::elect::{Elector, NoopElector};
use crate::error::{Error, Result};
use crate::executor::{Completion, Execution, Outcome};
use crate::job::{Job, JobHandle, JobOptions, JobSpec};
use crate::registry::Registry;

const REQUEST_BUFFER: usize = 64;
const COMPLETION_BUFFER: usize = 128;
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// What happens to a due job when the global concurrency limit is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitMode {
    /// Skip the due instant; the job waits for its next occurrence.
    Reschedule,
    /// Hold the due instant in a FIFO queue and run it when a slot frees.
    Wait,
}

pub struct SchedulerBuilder {
    tz: Tz,
    clock: Arc<dyn Clock>,
    limit: Option<(usize, LimitMode)>,
    elector: Arc<dyn Elector>,
    defaults: JobOptions,
    stop_timeout: Duration,
    request_timeout: Option<Duration>,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            tz: chrono_tz::UTC,
            clock: Arc::new(SystemClock),
            limit: None,
            elector: Arc::new(NoopElector),
            defaults: JobOptions::default(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            request_timeout: None,
        }
    }
}

impl SchedulerBuilder {
    /// Default timezone for calendar schedules; individual jobs may override.
    pub fn timezone(mut self, tz: Tz) -> Self {
        self.tz = tz;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Cap concurrent executions across all jobs.
    pub fn limit(mut self, slots: usize, mode: LimitMode) -> Self {
        self.limit = Some((slots, mode));
        self
    }

    pub fn elector(mut self, elector: Arc<dyn Elector>) -> Self {
        self.elector = elector;
        self
    }

    /// Options applied to every job that does not set them itself.
    pub fn default_options(mut self, defaults: JobOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// How long `stop` waits for in-flight executions before giving up.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Bound every handle request; unset means wait indefinitely.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Spawn the core task and return a handle to it. Requires a running
    /// tokio runtime.
    pub fn build(self) -> Result<Scheduler> {
        if let Some((0, _)) = self.limit {
            return Err(Error::Config("concurrency limit must be >= 1".into()));
        }
        let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
        let (done_tx, done_rx) = mpsc::channel(COMPLETION_BUFFER);
        let core = Core {
            registry: Registry::default(),
            clock: self.clock,
            tz: self.tz,
            defaults: self.defaults,
            elector: self.elector,
            limit: self.limit,
            stop_timeout: self.stop_timeout,
            rx,
            done_tx,
            done_rx,
            started: false,
            in_flight: 0,
            wait_queue: VecDeque::new(),
            draining: None,
        };
        tokio::spawn(core.run());
        Ok(Scheduler { tx, request_timeout: self.request_timeout })
    }
}

/// Handle to a scheduler core. Cloning is cheap; the core shuts down once
/// every handle is dropped.
#[derive(Clone, Debug)]
pub struct Scheduler {
    tx: mpsc::Sender<Request>,
    request_timeout: Option<Duration>,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// Validate and register a job. The job does not fire until the
    /// scheduler is started.
    pub async fn add_job(&self, spec: JobSpec) -> Result<Uuid> {
        self.request(|reply| Request::AddJob { spec, reply }).await?
    }

    pub async fn remove_job(&self, id: Uuid) -> Result<()> {
        self.request(|reply| Request::RemoveJob { id, reply }).await?
    }

    /// Remove every job carrying `tag`; returns the removed ids. Removing
    /// nothing is not an error.
    pub async fn remove_by_tag(&self, tag: impl Into<String>) -> Result<Vec<Uuid>> {
        let tag = tag.into();
        self.request(|reply| Request::RemoveByTag { tag, reply }).await
    }

    /// Replace a job's schedule, task, and options under the same id,
    /// keeping its run statistics.
    pub async fn update_job(&self, id: Uuid, spec: JobSpec) -> Result<Uuid> {
        self.request(|reply| Request::UpdateJob { id, spec, reset_stats: false, reply })
            .await?
    }

    /// Like [`update_job`](Self::update_job) but clears `last_run` and
    /// `run_count`.
    pub async fn update_job_reset(&self, id: Uuid, spec: JobSpec) -> Result<Uuid> {
        self.request(|reply| Request::UpdateJob { id, spec, reset_stats: true, reply })
            .await?
    }

    pub async fn get_job(&self, id: Uuid) -> Result<JobHandle> {
        self.request(|reply| Request::GetJob { id, reply }).await?
    }

    /// Snapshots of all jobs, in insertion order.
    pub async fn jobs(&self) -> Result<Vec<JobHandle>> {
        self.request(|reply| Request::Jobs { reply }).await
    }

    /// Begin firing jobs. Idempotent; restarting after a stop recomputes
    /// every job's next run from the current instant.
    pub async fn start(&self) -> Result<()> {
        self.request(|reply| Request::Start { reply }).await?
    }

    /// Stop dispatching and wait for in-flight executions to finish, up to
    /// the configured stop timeout.
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| Request::Stop { reply }).await?
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).await.map_err(|_| Error::Shutdown)?;
        match self.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, reply_rx).await {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(_)) => Err(Error::Shutdown),
                Err(_) => Err(Error::RequestTimeout),
            },
            None => reply_rx.await.map_err(|_| Error::Shutdown),
        }
    }
}

enum Request {
    AddJob { spec: JobSpec, reply: oneshot::Sender<Result<Uuid>> },
    RemoveJob { id: Uuid, reply: oneshot::Sender<Result<()>> },
    RemoveByTag { tag: String, reply: oneshot::Sender<Vec<Uuid>> },
    UpdateJob { id: Uuid, spec: JobSpec, reset_stats: bool, reply: oneshot::Sender<Result<Uuid>> },
    GetJob { id: Uuid, reply: oneshot::Sender<Result<JobHandle>> },
    Jobs { reply: oneshot::Sender<Vec<JobHandle>> },
    Start { reply: oneshot::Sender<Result<()>> },
    Stop { reply: oneshot::Sender<Result<()>> },
}

struct Drain {
    replies: Vec<oneshot::Sender<Result<()>>>,
    deadline: DateTime<Utc>,
}

struct Core {
    registry: Registry,
    clock: Arc<dyn Clock>,
    tz: Tz,
    defaults: JobOptions,
    elector: Arc<dyn Elector>,
    limit: Option<(usize, LimitMode)>,
    stop_timeout: Duration,
    rx: mpsc::Receiver<Request>,
    done_tx: mpsc::Sender<Completion>,
    done_rx: mpsc::Receiver<Completion>,
    started: bool,
    in_flight: usize,
    /// Due instants held back by `LimitMode::Wait`, in due order.
    wait_queue: VecDeque<(Uuid, DateTime<Utc>)>,
    draining: Option<Drain>,
}

impl Core {
    async fn run(mut self) {
        loop {
            let wake = if self.started && self.draining.is_none() {
                self.registry.next_wake()
            } else {
                None
            };
            let drain_deadline = self.draining.as_ref().map(|d| d.deadline);

            tokio::select! {
                biased;
                maybe_req = self.rx.recv() => match maybe_req {
                    Some(req) => self.handle_request(req),
                    // Every handle dropped; outstanding executions are
                    // detached and their completions discarded.
                    None => break,
                },
                Some(done) = self.done_rx.recv() => self.handle_completion(done),
                _ = sleep_arm(self.clock.as_ref(), drain_deadline), if drain_deadline.is_some() => {
                    self.finish_drain_timeout();
                }
                _ = sleep_arm(self.clock.as_ref(), wake), if wake.is_some() => {
                    self.dispatch_due();
                }
            }
        }
        tracing::debug!("Scheduler core exiting");
    }

    fn handle_request(&mut self, req: Request) {
        match req {
            Request::AddJob { spec, reply } => {
                let result = Job::build(spec, &self.defaults, self.tz).map(|mut job| {
                    if self.started {
                        job.schedule_initial(self.clock.now());
                    }
                    tracing::info!(job_id = %job.id, name = %job.name, "Job added");
                    self.registry.insert(job)
                });
                let _ = reply.send(result);
            }
            Request::RemoveJob { id, reply } => {
                let result = match self.registry.remove(&id) {
                    Some(job) => {
                        self.wait_queue.retain(|(qid, _)| *qid != id);
                        tracing::info!(job_id = %id, name = %job.name, "Job removed");
                        Ok(())
                    }
                    None => Err(Error::JobNotFound(id)),
                };
                let _ = reply.send(result);
            }
            Request::RemoveByTag { tag, reply } => {
                let ids = self.registry.remove_by_tag(&tag);
                self.wait_queue.retain(|(qid, _)| !ids.contains(qid));
                tracing::info!(tag = %tag, removed = ids.len(), "Jobs removed by tag");
                let _ = reply.send(ids);
            }
            Request::UpdateJob { id, spec, reset_stats, reply } => {
                let result = self.update_job(id, spec, reset_stats);
                let _ = reply.send(result);
            }
            Request::GetJob { id, reply } => {
                let result = self
                    .registry
                    .get(&id)
                    .map(Job::snapshot)
                    .ok_or(Error::JobNotFound(id));
                let _ = reply.send(result);
            }
            Request::Jobs { reply } => {
                let _ = reply.send(self.registry.snapshots());
            }
            Request::Start { reply } => {
                self.begin_start();
                let _ = reply.send(Ok(()));
            }
            Request::Stop { reply } => self.begin_stop(reply),
        }
    }

    fn update_job(&mut self, id: Uuid, spec: JobSpec, reset_stats: bool) -> Result<Uuid> {
        let Some(old) = self.registry.get(&id) else {
            return Err(Error::JobNotFound(id));
        };
        let mut job = Job::build(spec, &self.defaults, self.tz)?;
        if !reset_stats {
            job.last_run = old.last_run;
            job.run_count = old.run_count;
        }
        // In-flight executions of the old definition still complete and are
        // accounted against the replacement. The queued backlog is dropped.
        job.running = old.running;
        // Preserved stats may already satisfy a lowered run limit; such a job
        // would never run again, so it leaves the registry now.
        if job.limit_reached() {
            self.registry.remove(&id);
            self.wait_queue.retain(|(qid, _)| *qid != id);
            tracing::info!(job_id = %id, "Run limit already reached; job removed");
            return Ok(id);
        }
        if self.started {
            job.schedule_initial(self.clock.now());
        }
        self.registry.replace(id, job);
        tracing::info!(job_id = %id, "Job updated");
        Ok(id)
    }

    fn begin_start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        let now = self.clock.now();
        for job in self.registry.iter_mut() {
            // Fresh jobs get a first schedule; stale due instants left over
            // from a previous stop are recomputed instead of fired in a burst.
            if job.next_run.is_none_or(|n| n <= now) {
                job.schedule_initial(now);
            }
        }
        tracing::info!(jobs = self.registry.len(), "Scheduler started");
    }

    fn begin_stop(&mut self, reply: oneshot::Sender<Result<()>>) {
        self.started = false;
        // Deferred due instants do not survive a stop; a later start
        // recomputes every next run instead of replaying them.
        if !self.wait_queue.is_empty() {
            tracing::debug!(discarded = self.wait_queue.len(), "Discarding deferred due instants");
            self.wait_queue.clear();
        }
        for job in self.registry.iter_mut() {
            job.queued = 0;
        }
        if let Some(drain) = &mut self.draining {
            drain.replies.push(reply);
            return;
        }
        if self.in_flight == 0 {
            tracing::info!("Scheduler stopped");
            let _ = reply.send(Ok(()));
            return;
        }
        let deadline = self.clock.now()
            + chrono::Duration::from_std(self.stop_timeout).unwrap_or(chrono::Duration::zero());
        tracing::info!(in_flight = self.in_flight, "Scheduler draining");
        self.draining = Some(Drain { replies: vec![reply], deadline });
    }

    fn finish_drain_timeout(&mut self) {
        if let Some(drain) = self.draining.take() {
            tracing::warn!(in_flight = self.in_flight, "Drain timed out");
            for reply in drain.replies {
                let _ = reply.send(Err(Error::DrainTimeout(self.in_flight)));
            }
        }
    }

    fn dispatch_due(&mut self) {
        let now = self.clock.now();
        for id in self.registry.due(now) {
            self.try_dispatch(id);
        }
    }

    /// Decide what to do with one due instant. The job's `next_run` is
    /// always advanced here, exactly once per due instant.
    fn try_dispatch(&mut self, id: Uuid) {
        let Some(job) = self.registry.get_mut(&id) else {
            return;
        };
        let Some(due) = job.next_run else {
            return;
        };
        job.advance(due);

        if job.limit_reached() {
            return;
        }
        if job.running > 0 {
            match job.singleton {
                crate::job::SingletonMode::SkipIfRunning => {
                    tracing::debug!(job_id = %id, "Previous run still active; skipping");
                    return;
                }
                crate::job::SingletonMode::QueueIfRunning => {
                    job.queued += 1;
                    tracing::debug!(job_id = %id, "Previous run still active; queueing");
                    return;
                }
                crate::job::SingletonMode::Disabled => {}
            }
        }
        match self.limit {
            Some((slots, mode)) if self.in_flight >= slots => match mode {
                LimitMode::Reschedule => {
                    tracing::debug!(job_id = %id, "Limit reached; rescheduling");
                }
                LimitMode::Wait => {
                    tracing::debug!(job_id = %id, "Limit reached; waiting for a slot");
                    self.wait_queue.push_back((id, due));
                }
            },
            _ => self.launch(id, due),
        }
    }

    fn launch(&mut self, id: Uuid, fired_at: DateTime<Utc>) {
        let Some(job) = self.registry.get_mut(&id) else {
            return;
        };
        job.running += 1;
        self.in_flight += 1;
        let execution = Execution {
            id,
            name: job.name.clone(),
            fired_at,
            task: job.task.clone(),
            hooks: job.hooks.clone(),
            elector: Arc::clone(&self.elector),
        };
        tracing::debug!(job_id = %id, name = %execution.name, fired_at = %fired_at, "Dispatching job");
        execution.spawn(self.done_tx.clone());
    }

    fn handle_completion(&mut self, done: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        tracing::debug!(
            job_id = %done.id,
            elapsed_ms = done.elapsed.as_millis() as u64,
            "Run completion accounted"
        );

        let mut replay = false;
        if let Some(job) = self.registry.get_mut(&done.id) {
            job.running = job.running.saturating_sub(1);
            match done.outcome {
                Outcome::Succeeded | Outcome::Failed(_) => {
                    job.last_run = Some(done.fired_at);
                    job.run_count += 1;
                }
                Outcome::Skipped => {}
            }
            if job.limit_reached() {
                let name = job.name.clone();
                self.registry.remove(&done.id);
                self.wait_queue.retain(|(qid, _)| *qid != done.id);
                tracing::info!(job_id = %done.id, name = %name, "Run limit reached; job removed");
            } else if job.queued > 0 && self.started && self.draining.is_none() {
                job.queued -= 1;
                replay = true;
            }
        }
        if replay {
            // A queued run fires as soon as its predecessor finishes, subject
            // to the global limit like any other dispatch.
            let now = self.clock.now();
            match self.limit {
                Some((slots, mode)) if self.in_flight >= slots => {
                    if mode == LimitMode::Wait {
                        self.wait_queue.push_back((done.id, now));
                    }
                }
                _ => self.launch(done.id, now),
            }
        }

        if self.started && self.draining.is_none() {
            self.pump_wait_queue();
        }

        if self.in_flight == 0 {
            if let Some(drain) = self.draining.take() {
                tracing::info!("Scheduler stopped");
                for reply in drain.replies {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }

    fn pump_wait_queue(&mut self) {
        while let Some((slots, _)) = self.limit {
            if self.in_flight >= slots {
                return;
            }
            let Some((id, due)) = self.wait_queue.pop_front() else {
                return;
            };
            let Some(job) = self.registry.get(&id) else {
                continue;
            };
            // Singleton policy is re-checked at launch time, not enqueue time.
            if job.running > 0 {
                match job.singleton {
                    crate::job::SingletonMode::SkipIfRunning => continue,
                    crate::job::SingletonMode::QueueIfRunning => {
                        if let Some(job) = self.registry.get_mut(&id) {
                            job.queued += 1;
                        }
                        continue;
                    }
                    crate::job::SingletonMode::Disabled => {}
                }
            }
            self.launch(id, due);
        }
    }
}

async fn sleep_arm(clock: &dyn Clock, at: Option<DateTime<Utc>>) {
    match at {
        Some(at) => clock.sleep_until(at).await,
        None => std::future::pending().await,
    }
}
