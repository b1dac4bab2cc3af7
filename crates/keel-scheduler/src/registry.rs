use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{InstanceId, JobId};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::types::TargetRef;

/// Everything a job body learns about the firing it is running for.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_name: String,
    pub instance_id: InstanceId,
    pub fire_time: DateTime<Utc>,
    pub args: Vec<String>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    /// Cancelled when the body exceeds its timeout or shutdown gives up waiting.
    /// Long-running bodies should poll it.
    pub cancel: CancellationToken,
}

/// A registered job body.
///
/// Errors are captured by the dispatcher and recorded as the firing's
/// `error_detail`; they never reach the timer loop.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()>;
}

type BoxedJobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Adapter so plain async closures can be registered.
struct FnHandler<F>(F);

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> BoxedJobFuture + Send + Sync,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Maps a `TargetRef::task` key to its body.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `task`.
    pub fn register(&self, task: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let task = task.into();
        debug!(%task, "task registered");
        self.handlers
            .write()
            .expect("task registry poisoned")
            .insert(task, handler);
    }

    /// Register an async closure as the handler for `task`.
    pub fn register_fn<F, Fut>(&self, task: impl Into<String>, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let boxed = move |ctx: JobContext| -> BoxedJobFuture { Box::pin(f(ctx)) };
        self.register(task, Arc::new(FnHandler(boxed)));
    }

    pub fn unregister(&self, task: &str) -> bool {
        self.handlers
            .write()
            .expect("task registry poisoned")
            .remove(task)
            .is_some()
    }

    /// Look up the body for `target`. `UnknownTarget` if nothing is registered.
    pub fn resolve(&self, target: &TargetRef) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .expect("task registry poisoned")
            .get(&target.task)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownTarget {
                target: target.task.clone(),
            })
    }

    /// Registered task keys, sorted.
    pub fn tasks(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .handlers
            .read()
            .expect("task registry poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}
