//! Built-in demo tasks, handy for trying the scheduler out.

use std::time::Duration;

use keel_scheduler::{JobContext, TaskRegistry};
use tracing::info;

pub(crate) fn register_demo_tasks(registry: &TaskRegistry) {
    // Logs its arguments.
    registry.register_fn("demo.echo", |ctx: JobContext| async move {
        info!(
            job_id = %ctx.job_id,
            job = %ctx.job_name,
            args = ?ctx.args,
            kwargs = %serde_json::Value::Object(ctx.kwargs.clone()),
            "echo"
        );
        Ok(())
    });

    // Sleeps for args[0] seconds (default 1), stopping early if cancelled.
    registry.register_fn("demo.sleep", |ctx: JobContext| async move {
        let secs: u64 = match ctx.args.first() {
            Some(s) => s.parse()?,
            None => 1,
        };
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => Ok(()),
            _ = ctx.cancel.cancelled() => anyhow::bail!("cancelled after starting a {secs}s sleep"),
        }
    });

    // Always fails, with args[0] as the message when given.
    registry.register_fn("demo.fail", |ctx: JobContext| async move {
        let message = ctx
            .args
            .first()
            .cloned()
            .unwrap_or_else(|| "demo failure".to_string());
        anyhow::bail!(message)
    });
}
