use crate::output::KvLine;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Args, Subcommand};
use pilot_core::{
    Job, JobFilter, JobStatus, NewJob, DEFAULT_RETENTION_DAYS, DEFAULT_STALE_MINUTES,
};
use pilot_storage::Store;
use serde_json::Value;

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum QueueCommand {
    /// Add a job to the queue
    Enqueue(EnqueueArgs),
    /// Claim the next eligible job for a worker
    Dequeue(DequeueArgs),
    /// Mark a running job completed
    Ack(AckArgs),
    /// Report a failed attempt on a running job
    Nack(NackArgs),
    /// Job counts per status
    Status,
    /// Show one job
    Get(JobTargetArgs),
    /// List jobs, newest first
    List(ListArgs),
    /// Reset stale claims and purge old finished jobs
    Cleanup(CleanupArgs),
    /// Withdraw a pending job
    Cancel(JobTargetArgs),
}

#[derive(Args, Debug)]
pub struct EnqueueArgs {
    pub task_type: String,
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub priority: i64,
    #[arg(long, value_delimiter = ',')]
    pub blocked_by: Vec<i64>,
    #[arg(long, value_parser = parse_json, default_value = "{}")]
    pub data: Value,
}

#[derive(Args, Debug)]
pub struct DequeueArgs {
    pub worker_id: String,
}

#[derive(Args, Debug)]
pub struct AckArgs {
    pub job_id: i64,
    #[arg(long)]
    pub duration_ms: Option<i64>,
}

#[derive(Args, Debug)]
pub struct NackArgs {
    pub job_id: i64,
    #[arg(long)]
    pub error: String,
    #[arg(long)]
    pub retry: bool,
    #[arg(long)]
    pub duration_ms: Option<i64>,
}

#[derive(Args, Debug)]
pub struct JobTargetArgs {
    pub job_id: i64,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long)]
    pub status: Option<JobStatus>,
    #[arg(long)]
    pub task_type: Option<String>,
    #[arg(long)]
    pub limit: Option<u32>,
    #[arg(long)]
    pub offset: Option<u32>,
}

#[derive(Args, Debug)]
pub struct CleanupArgs {
    #[arg(long, default_value_t = DEFAULT_STALE_MINUTES)]
    pub stale_minutes: u32,
    #[arg(long, default_value_t = DEFAULT_RETENTION_DAYS)]
    pub older_than_days: u32,
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|err| format!("invalid JSON: {err}"))
}

pub fn execute(store: &Store, command: QueueCommand) -> Result<KvLine> {
    match command {
        QueueCommand::Enqueue(args) => {
            if args.task_type.trim().is_empty() {
                bail!("task_type must not be empty");
            }
            let job = NewJob::new(args.task_type)
                .priority(args.priority)
                .blocked_by(args.blocked_by)
                .data(args.data);
            let id = store.enqueue(&job).context("enqueue failed")?;
            tracing::debug!(event = "job_enqueued", job_id = id, task_type = %job.task_type);
            Ok(KvLine::ok().field("id", id))
        }
        QueueCommand::Dequeue(args) => {
            if args.worker_id.trim().is_empty() {
                bail!("worker_id must not be empty");
            }
            let outcome = store.dequeue(&args.worker_id).context("dequeue failed")?;
            match outcome.job {
                Some(job) if outcome.acquired => job_line(KvLine::ok().field("acquired", true), &job),
                _ => Ok(KvLine::ok().field("acquired", false)),
            }
        }
        QueueCommand::Ack(args) => {
            require_job(store, args.job_id)?;
            let acked = store
                .ack(args.job_id, args.duration_ms)
                .context("ack failed")?;
            Ok(KvLine::ok().field("id", args.job_id).field("acked", acked))
        }
        QueueCommand::Nack(args) => {
            if args.error.trim().is_empty() {
                bail!("--error must not be empty");
            }
            require_job(store, args.job_id)?;
            let nacked = store
                .nack(args.job_id, &args.error, args.retry, args.duration_ms)
                .context("nack failed")?;
            Ok(KvLine::ok()
                .field("id", args.job_id)
                .field("nacked", nacked)
                .field("retry", args.retry))
        }
        QueueCommand::Status => {
            let stats = store.queue_stats().context("status failed")?;
            let pending_by_type = serde_json::to_string(&stats.pending_by_type)?;
            Ok(KvLine::ok()
                .field("total", stats.total)
                .field("pending", stats.pending)
                .field("running", stats.running)
                .field("completed", stats.completed)
                .field("failed", stats.failed)
                .field("pending_by_type", pending_by_type))
        }
        QueueCommand::Get(args) => {
            let job = require_job(store, args.job_id)?;
            job_line(KvLine::ok(), &job)
        }
        QueueCommand::List(args) => {
            let jobs = store
                .list_jobs(&JobFilter {
                    status: args.status,
                    task_type: args.task_type,
                    limit: args.limit,
                    offset: args.offset,
                })
                .context("list failed")?;
            Ok(KvLine::ok()
                .field("count", jobs.len())
                .field("jobs", serde_json::to_string(&jobs)?))
        }
        QueueCommand::Cleanup(args) => {
            let stale_reset = store
                .cleanup_stale_jobs(args.stale_minutes)
                .context("stale job sweep failed")?;
            let old_deleted = store
                .cleanup_old_jobs(args.older_than_days)
                .context("old job cleanup failed")?;
            tracing::info!(event = "cleanup", stale_reset, old_deleted);
            Ok(KvLine::ok()
                .field("stale_reset", stale_reset)
                .field("old_deleted", old_deleted))
        }
        QueueCommand::Cancel(args) => {
            require_job(store, args.job_id)?;
            let cancelled = store.cancel_job(args.job_id).context("cancel failed")?;
            Ok(KvLine::ok()
                .field("id", args.job_id)
                .field("cancelled", cancelled))
        }
    }
}

fn require_job(store: &Store, job_id: i64) -> Result<Job> {
    store
        .get_job(job_id)
        .context("job lookup failed")?
        .ok_or_else(|| anyhow!("job {job_id} not found"))
}

fn job_line(line: KvLine, job: &Job) -> Result<KvLine> {
    let blocked_by = job
        .blocked_by
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",");
    Ok(line
        .field("id", job.id)
        .field("task_type", &job.task_type)
        .field("status", job.status)
        .field("priority", job.priority)
        .opt("worker_id", job.worker_id.as_deref())
        .field("blocked_by", blocked_by)
        .field("created_at", timestamp(job.created_at))
        .opt("started_at", job.started_at.map(timestamp))
        .opt("completed_at", job.completed_at.map(timestamp))
        .opt("error", job.error_message.as_deref())
        .field("data", serde_json::to_string(&job.task_data)?))
}

fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
