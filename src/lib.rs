//! In-process async job scheduler.
//!
//! Jobs pair a recurrence rule ([`Schedule`]) with an async task and run on
//! the tokio runtime. Features:
//!
//! - fixed and random intervals, cron expressions (with or without a seconds
//!   field), and daily / weekly / monthly calendar schedules with
//!   timezone-aware wall-clock times
//! - a single core task owns all job state; handles talk to it over a
//!   channel, so there are no shared locks
//! - per-job overlap policies ([`SingletonMode`]) and a global concurrency
//!   limit ([`LimitMode`])
//! - a pluggable election gate ([`Elector`]) for running one instance of a
//!   fleet at a time
//! - lifecycle hooks before and after each run, and on errors
//! - an injectable [`Clock`] so tests can drive time deterministically
//!
//! # Quick start
//!
//! ```no_run
//! use std::time::Duration;
//! use tickwheel::{JobOptions, JobSpec, Schedule, Scheduler, Task};
//!
//! # async fn demo() -> Result<(), tickwheel::Error> {
//! let scheduler = Scheduler::builder().build()?;
//!
//! let id = scheduler
//!     .add_job(
//!         JobSpec::new(
//!             Schedule::every(Duration::from_secs(30)),
//!             Task::new(|| async {
//!                 println!("tick");
//!                 Ok(())
//!             }),
//!         )
//!         .with_options(JobOptions::new().with_name("heartbeat")),
//!     )
//!     .await?;
//!
//! scheduler.start().await?;
//! # let _ = id;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod elect;
pub mod error;
pub mod job;
pub mod schedule;
pub mod scheduler;

mod executor;
mod registry;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks;

pub use chrono::Weekday;
pub use clock::{Clock, FakeClock, SystemClock};
pub use elect::{Elector, NoopElector};
pub use error::{Error, JobError, Result};
pub use job::{JobHandle, JobOptions, JobSpec, SingletonMode, Task};
pub use schedule::{AtTime, Schedule};
pub use scheduler::{LimitMode, Scheduler, SchedulerBuilder};
