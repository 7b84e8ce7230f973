//! Test doubles for the pluggable scheduler capabilities.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use crate::elect::Elector;
use crate::error::JobError;

/// Scriptable elector: flip `allow` / `fail` to steer outcomes and read
/// `calls` to assert the gate was consulted.
#[derive(Default)]
pub struct MockElector {
    allow: AtomicBool,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl MockElector {
    pub fn allowing() -> Self {
        let m = Self::default();
        m.allow.store(true, Ordering::SeqCst);
        m
    }

    pub fn denying() -> Self {
        Self::default()
    }

    pub fn set_allow(&self, allow: bool) {
        self.allow.store(allow, Ordering::SeqCst);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Elector for MockElector {
    async fn elect(&self, _job_id: Uuid) -> Result<bool, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err("mock election failure".into());
        }
        Ok(self.allow.load(Ordering::SeqCst))
    }
}
