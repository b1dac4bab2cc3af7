use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use keel_core::{JobId, KeelConfig};
use keel_scheduler::{
    HistoryQuery, JobFilter, JobStore, Scheduler, TargetRef, TaskRegistry, TriggerSpec,
};
use tracing::info;

mod cli;
mod tasks;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_daemon=info,keel_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: explicit path > ~/.keel/keel.toml, KEEL_* env on top
    let config = KeelConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        KeelConfig::default()
    });

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(open_scheduler(&config)?).await,
        Commands::Check { expression, count } => check(&expression, count),
        Commands::Add {
            name,
            task,
            cron,
            at,
            args,
            kwargs,
            group,
            coalesce,
            max_instances,
            timeout_secs,
        } => {
            let trigger = match (cron, at) {
                (Some(expr), _) => TriggerSpec::cron(expr),
                (None, Some(at)) => TriggerSpec::date(
                    DateTime::parse_from_rfc3339(&at)
                        .with_context(|| format!("invalid --at instant `{at}`"))?
                        .with_timezone(&Utc),
                ),
                (None, None) => anyhow::bail!("either --cron or --at is required"),
            };
            let mut target = TargetRef::new(task).with_args(args);
            if let Some(raw) = kwargs {
                target.kwargs =
                    serde_json::from_str(&raw).context("--kwargs must be a JSON object")?;
            }
            let scheduler = open_scheduler(&config)?;
            let mut def = scheduler.definition(name, target, trigger).group(group);
            def.misfire_policy.coalesce |= coalesce;
            if let Some(n) = max_instances {
                def.misfire_policy.max_instances = n;
            }
            if let Some(secs) = timeout_secs {
                def = def.timeout(Duration::from_secs(secs));
            }
            let job = scheduler.add_job(def.actor("cli"))?;
            println!(
                "{}  next: {}",
                job.id,
                job.next_fire_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into())
            );
            Ok(())
        }
        Commands::List { group } => {
            let filter = JobFilter {
                group,
                ..JobFilter::default()
            };
            for job in open_scheduler(&config)?.list_jobs(&filter)? {
                println!(
                    "{}  {:<20} {:<10} {:<9} {:<28} {}",
                    job.id,
                    job.name,
                    job.group,
                    job.status.to_string(),
                    job.next_fire_time
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".into()),
                    job.trigger
                );
            }
            Ok(())
        }
        Commands::Remove { ids } => {
            let ids: Vec<JobId> = ids.into_iter().map(JobId::from).collect();
            let missing = open_scheduler(&config)?.remove_jobs(&ids)?;
            for id in &missing {
                eprintln!("not found: {id}");
            }
            println!("removed {}", ids.len() - missing.len());
            Ok(())
        }
        Commands::History {
            job_id,
            limit,
            purge,
        } => {
            let scheduler = open_scheduler(&config)?;
            let job_id = job_id.map(JobId::from);
            if purge {
                let n = scheduler.purge_execution_history(job_id.as_ref(), None)?;
                println!("purged {n} records");
                return Ok(());
            }
            let query = HistoryQuery {
                job_id,
                limit: Some(limit),
                ..HistoryQuery::default()
            };
            for r in scheduler.query_execution_history(&query)? {
                println!(
                    "{:<6} {}  {}  {:<8} {}",
                    r.id,
                    r.job_id,
                    r.fire_time.to_rfc3339(),
                    r.outcome.map(|o| o.to_string()).unwrap_or_else(|| "running".into()),
                    r.error_detail.unwrap_or_default()
                );
            }
            Ok(())
        }
    }
}

/// Open the database and build a scheduler with the demo tasks registered.
fn open_scheduler(config: &KeelConfig) -> anyhow::Result<Scheduler> {
    config.database.ensure_parent_dir()?;
    info!(path = %config.database.path, "opening SQLite database");
    let store = Arc::new(JobStore::open(
        &config.database.path,
        Duration::from_millis(config.database.busy_timeout_ms),
    )?);

    let registry = Arc::new(TaskRegistry::new());
    tasks::register_demo_tasks(&registry);
    Ok(Scheduler::new(store, registry, config.scheduler.clone()))
}

/// Run the scheduler until Ctrl-C, logging every job event.
async fn run(scheduler: Scheduler) -> anyhow::Result<()> {
    let mut events = scheduler.subscribe("log");
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if event.is_terminal() {
                info!(
                    job_id = %event.job_id,
                    instance_id = %event.instance_id,
                    fire_time = %event.fire_time,
                    kind = ?event.kind,
                    "job event"
                );
            } else {
                tracing::debug!(job_id = %event.job_id, kind = ?event.kind, "job event");
            }
        }
    });

    scheduler.start().await?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        sha = env!("KEEL_GIT_SHA"),
        "keel scheduler started"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    scheduler.shutdown().await?;
    Ok(())
}

/// Print the next `count` fire times of `expression`.
fn check(expression: &str, count: usize) -> anyhow::Result<()> {
    let trigger = TriggerSpec::cron(expression);
    let times = keel_scheduler::trigger::upcoming(&trigger, Utc::now(), count)?;
    println!("{trigger}: valid");
    for t in times {
        println!("  {}", t.to_rfc3339());
    }
    Ok(())
}
