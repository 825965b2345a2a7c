//! `intake` - inspect and append to the sample intake ledger.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use intake_commit::{
    CommitError, CommitOrchestrator, CommitOutcome, CommitRequest, LedgerConfig, LedgerWriter,
    OrderPayload, UnavailableWriter, WorkerLedgerWriter, WriterBackend,
};
use intake_ledger::{
    resolve_year_sheet_name, scan, CacheEntry, CacheIdentity, CacheSnapshot, LedgerCache,
    WorksheetGrid,
};
use intake_worker::{shutdown_signal, WorkerClient};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "intake")]
#[command(about = "Assign order and lab numbers and append orders to the intake ledger workbook.")]
struct Cli {
    /// Path to the application config file.
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan the year sheet and print the derived ledger state.
    Scan(ScanArgs),
    /// Print the identifiers the next order would receive.
    Next(NextArgs),
    /// Append an order through the configured writer.
    Commit(CommitArgs),
    /// Drop the cached ledger state, including the snapshot file.
    Reset,
    /// Start the automation worker and open the workbook.
    Ping,
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Write the scanned entry to `snapshotPath`.
    #[arg(long)]
    persist: bool,
}

#[derive(Debug, Args)]
struct NextArgs {
    #[arg(long, default_value_t = 1)]
    samples: usize,
}

#[derive(Debug, Args)]
struct CommitArgs {
    /// JSON file with the validated order (`kunde`, `proben`, ...).
    #[arg(long)]
    order: PathBuf,

    /// Client request id; repeated ids within one process are answered once.
    #[arg(long = "request-id")]
    request_id: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = LedgerConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match cli.command {
            Command::Scan(args) => run_scan(&config, &args),
            Command::Next(args) => run_next(&config, &args).await,
            Command::Commit(args) => run_commit(&config, &args).await,
            Command::Reset => run_reset(&config),
            Command::Ping => run_ping(&config).await,
        }
    })
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn sheet_name(config: &LedgerConfig) -> String {
    resolve_year_sheet_name(&config.year_sheet_name, Local::now().date_naive())
}

fn run_scan(config: &LedgerConfig, args: &ScanArgs) -> Result<()> {
    let today = Local::now().date_naive();
    let sheet_name = sheet_name(config);
    let identity = CacheIdentity::probe(&config.excel_path, &sheet_name, today);
    let sheet = WorksheetGrid::open(&identity.workbook_path, &sheet_name)
        .with_context(|| format!("scanning {}", config.excel_path.display()))?;

    let state = scan(&sheet, today);
    let entry = CacheEntry::from_scan(identity, &sheet, today);
    if args.persist {
        let Some(path) = &config.snapshot_path else {
            bail!("--persist needs snapshotPath in the config");
        };
        CacheSnapshot::new(path).write(&entry)?;
        log::info!("[intake] snapshot written to {}", path.display());
    }
    print_json(&json!({ "state": state, "entry": entry }))
}

async fn run_next(config: &LedgerConfig, args: &NextArgs) -> Result<()> {
    let orchestrator = orchestrator(config, UnavailableWriter::new("none"));
    let preview = orchestrator.preview(args.samples, Local::now()).await?;
    print_json(&preview)
}

fn run_reset(config: &LedgerConfig) -> Result<()> {
    LedgerCache::new(config.snapshot_path.clone()).reset()?;
    print_json(&json!({ "ok": true }))
}

async fn run_commit(config: &LedgerConfig, args: &CommitArgs) -> Result<()> {
    let order = read_order(&args.order)?;
    let request = CommitRequest {
        order,
        client_request_id: args.request_id.clone(),
    };

    match config.writer_backend {
        WriterBackend::Direct => {
            // Direct editing is supplied by the host application, not this binary.
            commit_with(orchestrator(config, UnavailableWriter::new("direct")), request).await
        }
        WriterBackend::Worker => {
            let client = worker_client(config)?;
            let writer = WorkerLedgerWriter::new(client.clone(), config.request_options());
            let result = tokio::select! {
                result = commit_with(orchestrator(config, writer), request) => result,
                _ = shutdown_signal() => Err(anyhow::anyhow!("interrupted")),
            };
            client.shutdown().await;
            result
        }
    }
}

async fn run_ping(config: &LedgerConfig) -> Result<()> {
    let client = worker_client(config)?;
    let warmup_sheet = sheet_name(config);
    let warmup = client.warmup(&config.excel_path, &warmup_sheet, config.warmup_timeout());
    let result = tokio::select! {
        result = warmup => result.context("worker warmup failed"),
        _ = shutdown_signal() => Err(anyhow::anyhow!("interrupted")),
    };
    let pid = client.pid().await;
    client.shutdown().await;
    let body = result?;
    print_json(&json!({ "ok": true, "pid": pid, "worker": body }))
}

fn worker_client(config: &LedgerConfig) -> Result<WorkerClient> {
    let Some(command) = config.worker_command() else {
        bail!("worker.program is not configured");
    };
    Ok(WorkerClient::new(command.current_dir(worker_dir(config))))
}

fn worker_dir(config: &LedgerConfig) -> PathBuf {
    config
        .excel_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

fn orchestrator<W: LedgerWriter>(config: &LedgerConfig, writer: W) -> CommitOrchestrator<W> {
    CommitOrchestrator::new(
        config.excel_path.clone(),
        config.year_sheet_name.clone(),
        LedgerCache::new(config.snapshot_path.clone()),
        config.idempotency_store(),
        writer,
    )
}

fn read_order(path: &Path) -> Result<OrderPayload> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading order {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("parsing order {}", path.display()))?;
    if !value.is_object() {
        bail!("order {} must be a JSON object", path.display());
    }
    Ok(OrderPayload::new(value))
}

async fn commit_with<W: LedgerWriter>(
    orchestrator: CommitOrchestrator<W>,
    request: CommitRequest,
) -> Result<()> {
    match orchestrator.commit(request).await {
        Ok(CommitOutcome::StillProcessing { client_request_id }) => print_json(&json!({
            "ok": false,
            "processing": true,
            "clientRequestId": client_request_id,
        })),
        Ok(outcome) => match outcome.result() {
            Some(result) => print_json(result),
            None => Ok(()),
        },
        Err(err) => {
            print_json(&error_body(&err))?;
            Err(err).context("commit failed")
        }
    }
}

fn error_body(err: &CommitError) -> serde_json::Value {
    let mut body = json!({
        "ok": false,
        "status": err.http_status(),
        "error": err.user_message(),
    });
    if let Some(diagnostics) = err.diagnostics() {
        body["writerDebug"] = json!(diagnostics);
    }
    body
}
