//! Durable background job queue.
//!
//! Jobs are named records with JSON arguments. A [`Worker`] picks pending jobs
//! up in enqueue order, runs the registered [`JobHandler`] and files the record
//! under `done` or `failed`. Delivery is at least once: a worker that dies
//! mid-job leaves the record pending.

pub mod file;
pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::QueueError;

pub use file::FileQueue;
pub use worker::{RunSummary, Worker};

/// Persisted job: `{key, name, timestamp, kwargs}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub key: String,
    pub name: String,
    /// RFC 3339 with microseconds; pickup order.
    pub timestamp: String,
    pub kwargs: Value,
}

impl JobRecord {
    pub fn new(name: &str, kwargs: Value) -> Self {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            key: format!(
                "{}-{}-{:06}-{}",
                name,
                now.timestamp(),
                now.timestamp_subsec_micros(),
                &id[..8]
            ),
            name: name.to_string(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Micros, true),
            kwargs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Done,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

pub trait JobQueue: Send + Sync {
    /// Persist a new pending job.
    fn add(&self, name: &str, kwargs: Value) -> Result<JobRecord, QueueError>;

    /// Jobs in `state`, oldest first.
    fn list(&self, state: JobState) -> Result<Vec<JobRecord>, QueueError>;

    /// Move a pending job to `done` or `failed`.
    fn finish(&self, job: &JobRecord, state: JobState) -> Result<(), QueueError>;

    fn pending(&self) -> Result<Vec<JobRecord>, QueueError> {
        self.list(JobState::Pending)
    }
}

/// A background job function. `C` is the context handed to every job.
#[async_trait]
pub trait JobHandler<C>: Send + Sync {
    async fn run(&self, ctx: &C, kwargs: &Value) -> anyhow::Result<()>;
}

/// Job name → handler, filled once at startup.
pub struct JobRegistry<C> {
    handlers: HashMap<String, Arc<dyn JobHandler<C>>>,
}

impl<C> Default for JobRegistry<C> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<C: Send + Sync> JobRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: impl JobHandler<C> + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler<C>>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
