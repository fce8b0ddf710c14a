use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{Duration, sleep};
use tracing_subscriber::EnvFilter;

use quay_core::app::{AppBuilder, ClaimedRun, RunHandler, TaskStatus, WorkerGroup};
use quay_core::domain::{PoolKey, Priority, Resolution, RunState, TaskDefinition, TaskId};
use quay_core::ports::{IdGenerator, SystemClock, UlidGenerator};
use quay_core::settings::{LogFormat, Settings};

/// Run a local queue with in-memory storage: submit demo tasks, let a worker
/// group claim and resolve them, then print the final task states.
#[derive(Debug, Parser)]
#[command(name = "quay", version)]
struct Args {
    /// Settings file (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of tasks to submit.
    #[arg(long, default_value_t = 5)]
    tasks: usize,

    /// Number of workers in the group.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    #[arg(long, default_value = "local")]
    provisioner: String,

    #[arg(long, default_value = "demo")]
    worker_type: String,

    /// Retries per task.
    #[arg(long, default_value_t = 1)]
    retries: u32,

    /// Every Nth task fails its first run (0 = never).
    #[arg(long, default_value_t = 2)]
    fail_every: usize,
}

#[derive(Debug, Deserialize)]
struct DemoPayload {
    name: String,
    #[serde(default)]
    fail_first_run: bool,
}

/// handler：payload を読んで少し待つだけ
struct DemoHandler;

#[async_trait]
impl RunHandler for DemoHandler {
    async fn run(&self, claimed: &ClaimedRun) -> Resolution {
        let payload: DemoPayload = match serde_json::from_value(claimed.task.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(task_id = %claimed.task_id, error = %e, "bad payload");
                return Resolution::Failed;
            }
        };
        sleep(Duration::from_millis(50)).await;
        if payload.fail_first_run && claimed.run_id == 0 {
            tracing::info!(task_id = %claimed.task_id, name = %payload.name, "intentional failure");
            return Resolution::Failed;
        }
        tracing::info!(
            task_id = %claimed.task_id,
            run_id = claimed.run_id,
            worker = %claimed.worker_id,
            name = %payload.name,
            "hello"
        );
        Resolution::Completed
    }
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match settings.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn is_settled(status: &TaskStatus) -> bool {
    status.state.is_terminal()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // (A) 設定とログ
    let settings = Settings::load(args.config.as_deref()).context("loading settings")?;
    init_tracing(&settings);

    // (B) in-memory の ports で App を組み立てて、pool のキューを用意
    let pool = PoolKey::new(&args.provisioner, &args.worker_type);
    let app = AppBuilder::new(settings)
        .expect_pools(std::slice::from_ref(&pool))
        .build()?;
    app.provision().await?;
    let reaper = app.spawn_reaper();

    // (C) タスク投入
    let ids = UlidGenerator::new(SystemClock);
    let group_id = ids.generate_task_id();
    let now = app.clock.now();
    let mut task_ids: Vec<TaskId> = Vec::with_capacity(args.tasks);
    for i in 0..args.tasks {
        let task_id = ids.generate_task_id();
        let fail_first_run = args.fail_every > 0 && i % args.fail_every == 0;
        let definition = TaskDefinition {
            provisioner_id: pool.provisioner_id.clone(),
            worker_type: pool.worker_type.clone(),
            scheduler_id: "quay-cli".to_string(),
            task_group_id: group_id,
            priority: if i == 0 { Priority::High } else { Priority::Normal },
            retries: args.retries,
            created: now,
            deadline: now + chrono::Duration::hours(1),
            routing: String::new(),
            scopes: Vec::new(),
            payload: serde_json::json!({ "name": format!("task-{i}"), "fail_first_run": fail_first_run }),
        };
        app.store.create(task_id, definition).await?;
        task_ids.push(task_id);
    }
    tracing::info!(tasks = task_ids.len(), %pool, "tasks submitted");

    // (D) worker を起動して、全タスクが終わるのを待つ（Ctrl-C で中断）
    let workers = WorkerGroup::spawn(
        args.workers,
        "local",
        Arc::clone(&app.claimer),
        Arc::clone(&app.store),
        pool.clone(),
        Arc::new(DemoHandler),
        app.settings.idle_poll_interval(),
    );
    let statuses = tokio::select! {
        statuses = wait_until_settled(&app.store, &task_ids) => statuses?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted");
            Vec::new()
        }
    };

    // (E) 後片付け：新しい claim を止めて、実行中の run を待つ
    workers.shutdown_and_join().await;
    reaper.shutdown_and_join().await;

    let completed = statuses
        .iter()
        .filter(|s| s.state == RunState::Completed)
        .count();
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    println!(
        "completed {completed}/{} (pending hints left: {})",
        task_ids.len(),
        app.queues.count_pending(&pool).await?
    );
    Ok(())
}

async fn wait_until_settled(
    store: &quay_core::app::TaskStore,
    task_ids: &[TaskId],
) -> anyhow::Result<Vec<TaskStatus>> {
    loop {
        let mut statuses = Vec::with_capacity(task_ids.len());
        for &task_id in task_ids {
            statuses.push(store.status(task_id).await?);
        }
        if statuses.iter().all(is_settled) {
            return Ok(statuses);
        }
        sleep(Duration::from_millis(100)).await;
    }
}
