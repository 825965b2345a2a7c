use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::{
    encode_request, parse_response_line, read_line_bounded, ProtocolError, WorkerResponse,
    MAX_RESPONSE_LINE_BYTES,
};
use crate::{Result, WorkerError};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(20_000);
pub const DEFAULT_WARMUP_TIMEOUT: Duration = Duration::from_millis(10_000);

/// How long an exited worker's stdout is drained before its pending requests are rejected.
const READER_DRAIN: Duration = Duration::from_millis(250);
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Program and arguments used to start the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
    pub envs: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    pub timeout: Duration,
    /// Restart the worker and repeat the request once after a failure.
    pub retry_on_failure: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_on_failure: true,
        }
    }
}

type Reply = oneshot::Sender<Result<WorkerResponse>>;

struct PendingEntry {
    generation: u64,
    reply: Reply,
}

/// Requests waiting for a correlated response, keyed by request id.
#[derive(Default)]
struct PendingTable {
    entries: Mutex<HashMap<u64, PendingEntry>>,
}

impl PendingTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PendingEntry>> {
        self.entries.lock().expect("pending table mutex poisoned")
    }

    fn register(&self, id: u64, generation: u64) -> oneshot::Receiver<Result<WorkerResponse>> {
        let (reply, rx) = oneshot::channel();
        self.lock().insert(id, PendingEntry { generation, reply });
        rx
    }

    fn resolve(&self, response: WorkerResponse) -> bool {
        let entry = self.lock().remove(&response.id);
        match entry {
            Some(entry) => {
                let _ = entry.reply.send(Ok(response));
                true
            }
            None => false,
        }
    }

    fn forget(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn reject_generation(&self, generation: u64, error: impl Fn() -> WorkerError) -> usize {
        let rejected: Vec<PendingEntry> = {
            let mut entries = self.lock();
            let ids: Vec<u64> = entries
                .iter()
                .filter(|(_, entry)| entry.generation == generation)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| entries.remove(&id)).collect()
        };
        let count = rejected.len();
        for entry in rejected {
            let _ = entry.reply.send(Err(error()));
        }
        count
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// One spawned worker. The child itself is owned by the monitor task.
struct WorkerProcess {
    stdin: ChildStdin,
    generation: u64,
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
    kill_tx: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

struct Inner {
    command: WorkerCommand,
    next_id: AtomicU64,
    generation: AtomicU64,
    pending: Arc<PendingTable>,
    process: tokio::sync::Mutex<Option<WorkerProcess>>,
    disposed: AtomicBool,
}

/// Handle to the automation worker.
///
/// The worker is started lazily on the first request and restarted after it
/// exits. Clones share the same worker process.
#[derive(Clone)]
pub struct WorkerClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerClient")
            .field("command", &self.inner.command)
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

impl WorkerClient {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            inner: Arc::new(Inner {
                command,
                next_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                pending: Arc::new(PendingTable::default()),
                process: tokio::sync::Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.inner.command
    }

    /// Send `payload` and return the response body of an `ok: true` answer.
    ///
    /// With `retry_on_failure`, a timeout, crash or broken pipe restarts the
    /// worker and the request is sent exactly once more.
    pub async fn request(
        &self,
        payload: &Value,
        options: RequestOptions,
    ) -> Result<Map<String, Value>> {
        let mut generation = None;
        let err = match self.execute(payload, options.timeout, &mut generation).await {
            Ok(response) => return response.into_result().map_err(WorkerError::Remote),
            Err(err) => err,
        };
        if !options.retry_on_failure || !err.is_retryable() {
            return Err(err);
        }

        // The first attempt may have reached the worker: failures below are
        // reported as `RetryFailed`, never as a bare spawn error.
        log::warn!("[worker] request failed ({err}), restarting worker and retrying once");
        if let Err(source) = self.restart_after(generation).await {
            return Err(WorkerError::RetryFailed {
                attempt: Box::new(err),
                source: Box::new(source),
            });
        }
        match self.execute(payload, options.timeout, &mut None).await {
            Ok(response) => response.into_result().map_err(WorkerError::Remote),
            Err(source @ (WorkerError::Spawn { .. } | WorkerError::Disposed)) => {
                Err(WorkerError::RetryFailed {
                    attempt: Box::new(err),
                    source: Box::new(source),
                })
            }
            Err(other) => Err(other),
        }
    }

    /// Open the workbook in the worker ahead of the first real write.
    pub async fn warmup(
        &self,
        excel_path: &Path,
        year_sheet_name: &str,
        timeout: Duration,
    ) -> Result<Map<String, Value>> {
        let payload = json!({
            "__warmup": true,
            "excelPath": excel_path.to_string_lossy(),
            "yearSheetName": year_sheet_name,
            "allowAutoOpenExcel": false,
        });
        self.request(
            &payload,
            RequestOptions {
                timeout,
                retry_on_failure: false,
            },
        )
        .await
    }

    /// Single attempt: no restart, no retry.
    ///
    /// `generation` is set to the worker the request was sent to.
    async fn execute(
        &self,
        payload: &Value,
        timeout: Duration,
        generation: &mut Option<u64>,
    ) -> Result<WorkerResponse> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(WorkerError::Disposed);
        }
        let deadline = Instant::now() + timeout;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let line = encode_request(id, payload)?;

        let rx = {
            let mut guard = self.inner.process.lock().await;
            let process = self.start_locked(&mut guard)?;
            *generation = Some(process.generation);
            let rx = self.inner.pending.register(id, process.generation);
            match tokio::time::timeout_at(deadline, write_line(&mut process.stdin, &line)).await {
                Ok(Ok(())) => rx,
                Ok(Err(err)) => {
                    self.inner.pending.forget(id);
                    return Err(WorkerError::Write(err));
                }
                Err(_) => {
                    self.inner.pending.forget(id);
                    return Err(WorkerError::Timeout { timeout });
                }
            }
        };

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WorkerError::Stopped),
            Err(_) => {
                // A late answer for this id is dropped by the reader.
                self.inner.pending.forget(id);
                log::warn!("[worker] request {id} timed out after {}ms", timeout.as_millis());
                Err(WorkerError::Timeout { timeout })
            }
        }
    }

    fn start_locked<'a>(
        &self,
        slot: &'a mut Option<WorkerProcess>,
    ) -> Result<&'a mut WorkerProcess> {
        if slot
            .as_ref()
            .is_some_and(|process| process.exited.load(Ordering::SeqCst))
        {
            log::warn!("[worker] previous worker exited, starting a new one");
            *slot = None;
        }
        if slot.is_none() {
            *slot = Some(self.spawn()?);
        }
        slot.as_mut().ok_or(WorkerError::Stopped)
    }

    fn spawn(&self) -> Result<WorkerProcess> {
        let worker = &self.inner.command;
        let spawn_error = |source: io::Error| WorkerError::Spawn {
            program: worker.program.to_string_lossy().into_owned(),
            source,
        };

        let mut cmd = Command::new(&worker.program);
        cmd.args(&worker.args)
            .envs(worker.envs.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &worker.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(spawn_error)?;
        let missing = |name: &str| {
            io::Error::new(io::ErrorKind::BrokenPipe, format!("worker {name} not captured"))
        };
        let stdin = child.stdin.take().ok_or_else(|| spawn_error(missing("stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(missing("stdout")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_error(missing("stderr")))?;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pid = child.id();
        log::info!("[worker] started pid={pid:?} generation={generation}");

        let exited = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_responses(stdout, self.inner.pending.clone()));
        tokio::spawn(log_stderr(stderr));
        let (kill_tx, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(supervise(
            child,
            kill_rx,
            reader,
            self.inner.pending.clone(),
            generation,
            exited.clone(),
        ));

        Ok(WorkerProcess {
            stdin,
            generation,
            pid,
            exited,
            kill_tx,
            monitor,
        })
    }

    /// Stop the worker, rejecting its pending requests. The next request starts a new one.
    pub async fn stop(&self) {
        let mut guard = self.inner.process.lock().await;
        self.stop_locked(&mut guard).await;
    }

    async fn stop_locked(&self, slot: &mut Option<WorkerProcess>) {
        let Some(process) = slot.take() else {
            return;
        };
        let WorkerProcess {
            stdin,
            generation,
            pid,
            kill_tx,
            monitor,
            ..
        } = process;

        let rejected = self
            .inner
            .pending
            .reject_generation(generation, || WorkerError::Stopped);
        log::info!("[worker] stopping pid={pid:?}, rejected {rejected} pending request(s)");
        drop(stdin);
        let _ = kill_tx.send(());
        if tokio::time::timeout(STOP_GRACE, monitor).await.is_err() {
            log::warn!("[worker] pid={pid:?} did not stop within {STOP_GRACE:?}");
        }
    }

    /// Hard stop followed by a fresh start.
    pub async fn restart(&self) -> Result<()> {
        let mut guard = self.inner.process.lock().await;
        self.restart_locked(&mut guard).await
    }

    /// Restart after an attempt on `failed` went wrong, unless a concurrent
    /// request already replaced that worker.
    async fn restart_after(&self, failed: Option<u64>) -> Result<()> {
        let mut guard = self.inner.process.lock().await;
        let replaced = guard.as_ref().is_some_and(|process| {
            Some(process.generation) != failed && !process.exited.load(Ordering::SeqCst)
        });
        if replaced {
            log::debug!("[worker] generation {failed:?} already replaced, not restarting again");
            return Ok(());
        }
        self.restart_locked(&mut guard).await
    }

    async fn restart_locked(&self, slot: &mut Option<WorkerProcess>) -> Result<()> {
        self.stop_locked(slot).await;
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(WorkerError::Disposed);
        }
        *slot = Some(self.spawn()?);
        Ok(())
    }

    /// Stop the worker for good; later requests fail with [`WorkerError::Disposed`].
    pub async fn shutdown(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.stop().await;
    }

    pub async fn pid(&self) -> Option<u32> {
        let guard = self.inner.process.lock().await;
        guard
            .as_ref()
            .filter(|process| !process.exited.load(Ordering::SeqCst))
            .and_then(|process| process.pid)
    }

    /// Shut the worker down when the process receives Ctrl-C or SIGTERM.
    pub fn stop_on_shutdown_signal(&self) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            log::info!("[worker] shutdown signal received");
            client.shutdown().await;
        })
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::warn!("[worker] cannot listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                log::warn!("[worker] cannot listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &[u8]) -> io::Result<()> {
    stdin.write_all(line).await?;
    stdin.flush().await
}

async fn read_responses(stdout: ChildStdout, pending: Arc<PendingTable>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        match read_line_bounded(&mut reader, MAX_RESPONSE_LINE_BYTES, &mut buf).await {
            Ok(Some(line)) => match parse_response_line(&line) {
                Some(response) => {
                    let id = response.id;
                    if !pending.resolve(response) {
                        log::debug!("[worker] dropping response for unknown request {id}");
                    }
                }
                None if line.trim().is_empty() => {}
                None => log::debug!("[worker] dropping malformed line: {line:.200}"),
            },
            Ok(None) => break,
            Err(err @ ProtocolError::LineTooLong { .. }) => log::warn!("[worker] {err}"),
            Err(ProtocolError::Io(err)) => {
                log::warn!("[worker] stdout read failed: {err}");
                break;
            }
        }
    }
}

async fn log_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => log::warn!("[worker:stderr] {line}"),
            Ok(None) | Err(_) => break,
        }
    }
}

async fn supervise(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    reader: JoinHandle<()>,
    pending: Arc<PendingTable>,
    generation: u64,
    exited: Arc<AtomicBool>,
) {
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx => None,
    };
    let status = match waited {
        Some(Ok(status)) => status.to_string(),
        Some(Err(err)) => err.to_string(),
        None => {
            terminate(&mut child).await;
            "terminated".to_string()
        }
    };
    exited.store(true, Ordering::SeqCst);

    // Responses written right before the exit still reach their callers.
    if tokio::time::timeout(READER_DRAIN, reader).await.is_err() {
        log::debug!("[worker] stdout still open after exit");
    }
    let rejected = pending.reject_generation(generation, || WorkerError::Exited {
        status: status.clone(),
    });
    if rejected > 0 {
        log::warn!("[worker] exited ({status}), rejected {rejected} pending request(s)");
    } else {
        log::info!("[worker] exited ({status})");
    }
}

async fn terminate(child: &mut Child) {
    #[cfg(windows)]
    if let Some(pid) = child.id() {
        // The automation host may have spawned helpers; take down the whole tree.
        let _ = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
    if let Err(err) = child.kill().await {
        log::debug!("[worker] kill failed: {err}");
    }
}
