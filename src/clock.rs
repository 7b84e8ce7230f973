//! Injectable time source.
//!
//! The scheduler never reads the wall clock directly; everything goes through
//! a [`Clock`] so tests can drive time deterministically with [`FakeClock`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Wall-clock capability: read the current instant and sleep until a target
/// instant.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Resolve once `now() >= deadline`. Must return immediately when the
    /// deadline is already in the past.
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

/// Real clock backed by system time and the tokio timer.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        if let Ok(wait) = (deadline - Utc::now()).to_std() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Manually driven clock for deterministic tests. Time only moves when
/// [`advance`](FakeClock::advance) or [`set`](FakeClock::set) is called;
/// pending `sleep_until` calls wake through a watch channel.
pub struct FakeClock {
    now: watch::Sender<DateTime<Utc>>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        let (now, _) = watch::channel(start);
        Self { now }
    }

    /// Jump the clock to a specific instant.
    pub fn set(&self, to: DateTime<Utc>) {
        self.now.send_replace(to);
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: std::time::Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        self.now.send_modify(|t| {
            if let Some(next) = t.checked_add_signed(delta) {
                *t = next;
            }
        });
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.borrow()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let mut rx = self.now.subscribe();
        if rx.wait_for(|now| *now >= deadline).await.is_err() {
            // Clock dropped while sleepers remain; never wake.
            std::future::pending::<()>().await;
        }
    }
}
