//! Parallel run coordinator.
//!
//! Fans one logical load-test invocation out into N worker processes sharing
//! one index allocator and one log identity. The allocator is started
//! in-process before any worker spawns and always wins over any inherited
//! `INDEX_ALLOCATOR_URL`; each worker gets a 1-based ordinal, the shared run
//! id/log file, and its own append-only worker log.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use eyre::WrapErr;
use loadstorm_accounts::env::{INDEX_ALLOCATOR_URL_ENV, WORKER_INDEX_ENV};
use loadstorm_accounts::AllocatorClient;
use loadstorm_allocator::{AllocatorConfig, AllocatorHandle};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(
    name = "loadstorm-run",
    about = "Run a load-test command across N worker processes with a shared index allocator",
    version
)]
struct Cli {
    /// Number of worker processes to spawn.
    #[arg(long, env = "LOADSTORM_WORKERS", default_value_t = 1,
          value_parser = clap::value_parser!(u32).range(1..))]
    workers: u32,

    /// First index the allocator hands out.
    #[arg(long, env = "INDEX_ALLOCATOR_START", default_value_t = 0)]
    start_index: u64,

    /// Directory for run and worker logs.
    #[arg(long, env = "LOADSTORM_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    /// Command to run in each worker, after `--`.
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[derive(Debug)]
struct WorkerExit {
    ordinal: u32,
    code: i32,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let exit_code = run(cli).await?;
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> eyre::Result<i32> {
    std::fs::create_dir_all(&cli.log_dir)
        .wrap_err_with(|| format!("failed to create log dir {}", cli.log_dir.display()))?;

    let run_id = resolve_run_id();
    let log_file = resolve_log_file(&cli.log_dir, &run_id);

    // The allocator is the primary source of unique account indices: start it
    // for every run and always inject its URL into the workers, ignoring any
    // pre-existing INDEX_ALLOCATOR_URL.
    let allocator = loadstorm_allocator::spawn(AllocatorConfig::with_start_index(cli.start_index))
        .await
        .wrap_err("failed to start index allocator")?;
    let allocator_url = allocator.url();

    AllocatorClient::new(
        allocator_url.parse().wrap_err("allocator URL is not valid")?,
        Duration::from_secs(2),
    )
    .health()
    .await
    .wrap_err("index allocator failed its health check")?;

    println!("[loadstorm-run] LOG_FILE={}", log_file.display());
    println!("[loadstorm-run] INDEX_ALLOCATOR_URL={allocator_url}");

    let shared_env: Arc<Vec<(String, String)>> = Arc::new(vec![
        ("RUN_ID".to_string(), run_id.clone()),
        ("LOG_FILE".to_string(), log_file.display().to_string()),
        (INDEX_ALLOCATOR_URL_ENV.to_string(), allocator_url.clone()),
    ]);
    let command = Arc::new(cli.command);

    let cancel = CancellationToken::new();
    let mut tasks = Vec::with_capacity(cli.workers as usize);
    for ordinal in 1..=cli.workers {
        let worker_log = cli
            .log_dir
            .join(format!("run-{run_id}-worker{ordinal}.log"));
        tasks.push(tokio::spawn(run_worker(
            ordinal,
            Arc::clone(&command),
            Arc::clone(&shared_env),
            worker_log,
            cancel.clone(),
        )));
    }

    let (results, caught) = supervise(tasks, &cancel).await;

    teardown(allocator, caught).await;

    // First non-zero exit in worker order wins; all-zero runs exit zero.
    Ok(results
        .iter()
        .find(|r| r.code != 0)
        .map(|r| r.code)
        .unwrap_or(0))
}

/// Waits for all workers, reacting to termination signals by cancelling the
/// outstanding ones. Returns the structured exits in worker order plus the
/// signal that was caught, if any.
async fn supervise(
    tasks: Vec<tokio::task::JoinHandle<eyre::Result<WorkerExit>>>,
    cancel: &CancellationToken,
) -> (Vec<WorkerExit>, Option<i32>) {
    let mut caught: Option<i32> = None;
    let mut all = std::pin::pin!(futures::future::join_all(tasks));

    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();

    let joined = loop {
        #[cfg(unix)]
        let sigterm_recv = async {
            match sigterm.as_mut() {
                Some(s) => s.recv().await,
                None => std::future::pending().await,
            }
        };
        #[cfg(not(unix))]
        let sigterm_recv = std::future::pending::<Option<()>>();

        tokio::select! {
            joined = &mut all => break joined,
            _ = tokio::signal::ctrl_c(), if caught.is_none() => {
                tracing::warn!("caught interrupt, terminating workers");
                caught = Some(signal_number::INT);
                cancel.cancel();
            }
            _ = sigterm_recv, if caught.is_none() => {
                tracing::warn!("caught termination signal, terminating workers");
                caught = Some(signal_number::TERM);
                cancel.cancel();
            }
        }
    };

    let mut results = Vec::with_capacity(joined.len());
    for (i, joined_result) in joined.into_iter().enumerate() {
        let ordinal = i as u32 + 1;
        match joined_result {
            Ok(Ok(exit)) => results.push(exit),
            Ok(Err(err)) => {
                tracing::error!(ordinal, error = %err, "worker failed");
                results.push(WorkerExit { ordinal, code: 1 });
            }
            Err(err) => {
                tracing::error!(ordinal, error = %err, "worker task panicked");
                results.push(WorkerExit { ordinal, code: 1 });
            }
        }
    }
    (results, caught)
}

/// Tears the allocator down (best-effort) and, if a signal was caught,
/// re-delivers it so the parent observes the real termination cause.
async fn teardown(allocator: AllocatorHandle, caught: Option<i32>) {
    if let Err(err) = allocator.shutdown().await {
        tracing::warn!(error = %err, "allocator teardown failed");
    }

    if let Some(sig) = caught {
        redeliver_signal(sig);
    }
}

mod signal_number {
    #[cfg(unix)]
    pub const INT: i32 = libc::SIGINT;
    #[cfg(not(unix))]
    pub const INT: i32 = 2;
    #[cfg(unix)]
    pub const TERM: i32 = libc::SIGTERM;
    #[cfg(not(unix))]
    pub const TERM: i32 = 15;
}

#[cfg(unix)]
fn redeliver_signal(sig: i32) -> ! {
    // Restore the default disposition first so the re-raise actually
    // terminates the process.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
    std::process::exit(128 + sig);
}

#[cfg(not(unix))]
fn redeliver_signal(sig: i32) -> ! {
    std::process::exit(128 + sig);
}

async fn run_worker(
    ordinal: u32,
    command: Arc<Vec<String>>,
    shared_env: Arc<Vec<(String, String)>>,
    log_path: PathBuf,
    cancel: CancellationToken,
) -> eyre::Result<WorkerExit> {
    let mut log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
        .wrap_err_with(|| format!("failed to open worker log {}", log_path.display()))?;
    log.write_all(format!("[worker {ordinal}] command={}\n", command.join(" ")).as_bytes())
        .await?;

    let (program, args) = command
        .split_first()
        .ok_or_else(|| eyre::eyre!("empty worker command"))?;

    let mut child = Command::new(program)
        .args(args)
        .envs(shared_env.iter().cloned())
        .env(WORKER_INDEX_ENV, ordinal.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .wrap_err_with(|| format!("failed to spawn worker {ordinal} ({program})"))?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    let out_log = log.try_clone().await?;
    let err_log = log;
    let out_task = tokio::spawn(tee(stdout, out_log, tokio::io::stdout()));
    let err_task = tokio::spawn(tee(stderr, err_log, tokio::io::stderr()));

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            child.wait().await?
        }
    };
    let _ = out_task.await;
    let _ = err_task.await;

    Ok(WorkerExit {
        ordinal,
        code: exit_code(status),
    })
}

/// Copies a child stream to the worker log file and mirrors it to the
/// coordinator's own stdio.
async fn tee(
    mut reader: impl AsyncRead + Unpin,
    mut file: tokio::fs::File,
    mut mirror: impl AsyncWrite + Unpin,
) -> std::io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        mirror.write_all(&buf[..n]).await?;
        mirror.flush().await?;
    }
    file.flush().await?;
    Ok(())
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    1
}

fn resolve_run_id() -> String {
    let explicit = std::env::var("RUN_ID")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let raw = explicit.unwrap_or_else(|| {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{stamp}-{}", &suffix[..6])
    });
    sanitize_run_id(&raw)
}

// Path-safe and easy to read.
fn sanitize_run_id(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(80)
        .collect()
}

fn resolve_log_file(log_dir: &Path, run_id: &str) -> PathBuf {
    std::env::var("LOG_FILE")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| log_dir.join(format!("run-{run_id}.jsonl")))
}
