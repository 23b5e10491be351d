mod cli;
mod printer;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use beam_core::{AppContext, JobKind, QueuedJob, ResumeRecord, SendOptions};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, SendArgs};

/// How often `queue-start` looks for a stop request from `queue-stop`
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let ctx = AppContext::init()?;
    tracing::debug!("Data directory: {}", ctx.data_dir().display());
    let printer = printer::spawn(&ctx.events);

    let result = run(cli.command, ctx).await;

    // Let the printer catch up once every bus handle is gone
    let _ = tokio::time::timeout(Duration::from_millis(200), printer).await;
    result
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(command: Command, ctx: AppContext) -> Result<()> {
    match command {
        Command::Receive {
            password,
            port,
            dir,
        } => receive(ctx, password, port, dir).await,
        Command::Send(args) => send(ctx, args).await,
        Command::ListResume => list_resume(&ctx).await,
        Command::Resume { index, password } => resume(ctx, index, password).await,
        Command::QueueList => {
            queue_list(&ctx);
            Ok(())
        }
        Command::QueueStart => queue_start(ctx).await,
        Command::QueueStop => {
            ctx.stop_marker()
                .request()
                .context("Failed to signal the running queue")?;
            println!("Stop requested");
            Ok(())
        }
        Command::QueueClear => {
            let removed = ctx.queue().clear();
            println!("Removed {} queued jobs", removed);
            Ok(())
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted");
            token.cancel();
        }
    });
    cancel
}

async fn receive(
    ctx: AppContext,
    password: Option<String>,
    port: Option<u16>,
    dir: Option<PathBuf>,
) -> Result<()> {
    let mut config = ctx.server_config(password);
    if let Some(dir) = dir {
        config.download_dir = dir;
    }
    let port = port.unwrap_or(ctx.config.port);

    beam_core::transfer::start(config, port, ctx.events.clone(), cancel_on_ctrl_c())
        .await
        .with_context(|| format!("Receiver on port {} failed", port))
}

/// Directories become one job each; loose files are grouped into one job.
fn plan_jobs(paths: &[PathBuf], options: &SendOptions) -> Result<Vec<QueuedJob>> {
    let mut jobs = Vec::new();
    let mut files = Vec::new();

    for path in paths {
        // Queued jobs may run from another working directory
        let path = std::path::absolute(path)
            .with_context(|| format!("Invalid path {}", path.display()))?;
        if path.is_dir() {
            jobs.push(QueuedJob::new(JobKind::Directory(path), options.clone()));
        } else {
            files.push(path);
        }
    }

    let kind = match files.len() {
        0 => None,
        1 => Some(JobKind::SingleFile(files.remove(0))),
        _ => Some(JobKind::MultiFile(files)),
    };
    if let Some(kind) = kind {
        jobs.insert(0, QueuedJob::new(kind, options.clone()));
    }
    Ok(jobs)
}

async fn send(ctx: AppContext, args: SendArgs) -> Result<()> {
    let options = SendOptions {
        host: args.host.clone(),
        port: args.port.unwrap_or(ctx.config.port),
        compression: args.compression(),
        password: args.encrypt.clone().filter(|p| !p.is_empty()),
        resume: args.resume,
        speed_limit_kbs: args.speed_limit,
    };
    let jobs = plan_jobs(&args.paths, &options)?;

    if args.queue {
        let queue = ctx.queue();
        let count = jobs.len();
        for job in jobs {
            queue.enqueue(job);
        }
        println!(
            "{} job(s) queued, {} pending. Run `beam queue-start` to send.",
            count,
            queue.len()
        );
        return Ok(());
    }

    let client = ctx.client();
    let cancel = cancel_on_ctrl_c();
    let total = jobs.len();
    let mut failed = 0;
    for job in jobs {
        if cancel.is_cancelled() {
            break;
        }
        if let Err(e) = job.execute(&client, &cancel).await {
            tracing::debug!("{}: {}", job.description, e);
            failed += 1;
        }
    }

    if cancel.is_cancelled() {
        bail!("Interrupted");
    }
    if failed > 0 {
        bail!("{} of {} job(s) failed", failed, total);
    }
    Ok(())
}

async fn list_resume(ctx: &AppContext) -> Result<()> {
    let records = ctx.resume_store.list_all().await;
    if records.is_empty() {
        println!("No resumable transfers");
        return Ok(());
    }

    for (idx, record) in records.iter().enumerate() {
        println!("{}", describe_record(idx + 1, record));
    }
    Ok(())
}

fn describe_record(index: usize, record: &ResumeRecord) -> String {
    format!(
        "[{}] {}  {}/{} bytes ({:.1}%, {} left)  -> {}:{}  compression: {}{}",
        index,
        record.source_path.display(),
        record.bytes_transferred,
        record.total_size,
        record.progress_percent(),
        record.remaining(),
        record.host,
        record.port,
        record.compression,
        if record.encrypted { ", encrypted" } else { "" }
    )
}

async fn resume(ctx: AppContext, index: usize, password: Option<String>) -> Result<()> {
    let records = ctx.resume_store.list_all().await;
    let record = index
        .checked_sub(1)
        .and_then(|i| records.get(i))
        .with_context(|| {
            format!(
                "No resumable transfer #{} ({} available, see `beam list-resume`)",
                index,
                records.len()
            )
        })?;

    let outcome = ctx
        .client()
        .resume_from_record(record, password.as_deref(), &cancel_on_ctrl_c())
        .await
        .with_context(|| format!("Resuming {} failed", record.file_name))?;
    println!(
        "Resumed {} from byte {} ({} bytes sent)",
        outcome.file_name, outcome.resumed_from, outcome.wire_bytes
    );
    Ok(())
}

fn queue_list(ctx: &AppContext) {
    let jobs = ctx.queue().list();
    if jobs.is_empty() {
        println!("Queue is empty");
        return;
    }
    for (idx, job) in jobs.iter().enumerate() {
        println!("[{}] {}  ({})", idx + 1, job.description, job.id);
    }
}

async fn queue_start(ctx: AppContext) -> Result<()> {
    let queue = ctx.queue();
    let marker = ctx.stop_marker();
    // Stale request from an earlier run
    marker.take();

    if queue.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }
    let mut handle = queue.start().context("Queue is already running")?;

    let mut poll = tokio::time::interval(STOP_POLL_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            res = &mut handle => {
                res.context("Queue task failed")?;
                break;
            }
            _ = poll.tick() => {
                if marker.take() {
                    queue.stop();
                }
            }
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                queue.stop();
            }
        }
    }

    if !queue.is_empty() {
        println!("{} job(s) left in the queue", queue.len());
    }
    Ok(())
}
