//! Job execution: precondition checks, descriptor materialization, and
//! worker supervision.
//!
//! A job moves `Created -> Running -> {Completed | SpawnFailed | Cancelled}`.
//! `Running` is exactly the lifetime of the session's [`RunGuard`]: the
//! guard is acquired before anything touches the filesystem and dropped
//! once the worker is gone and its descriptor removed.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::config::WorkerSettings;
use crate::session::{count_targets, JobConfig, RunGuard, Session};

/// Capacity of the channel between the output readers and the event stream.
///
/// Readers block when the client falls behind, which in turn blocks the
/// worker on a full pipe.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long to wait for the output readers to hit EOF after the worker exits.
/// Grandchildren that inherited the pipes can hold them open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One message on a job's event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobEvent {
    /// A non-empty line from the worker's stdout.
    Log { message: String },
    /// A stderr chunk, verbatim, or a failure reported by the runner.
    Error { message: String },
    /// Terminal event. Nothing follows it.
    Done { code: i32 },
}

impl JobEvent {
    pub fn is_done(&self) -> bool {
        matches!(self, JobEvent::Done { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("a job is already running for this session")]
    AlreadyRunning,
    #[error("session has expired")]
    SessionExpired,
    #[error("missing required config: {0}")]
    MissingFields(String),
    #[error("target list is empty")]
    EmptyTargets,
    #[error("failed to create artifact directory: {0}")]
    ArtifactDir(#[source] ArtifactError),
    #[error("failed to write job descriptor: {0}")]
    Descriptor(#[source] std::io::Error),
    #[error("failed to start worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to wait for worker: {0}")]
    Wait(#[source] std::io::Error),
}

/// What the worker reads from the file named by its only argument.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobDescriptor<'a> {
    #[serde(flatten)]
    config: &'a JobConfig,
    login_url: &'a str,
    download_path: &'a Path,
    students: &'a str,
}

/// Program and fixed leading arguments used to launch a worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl WorkerCommand {
    /// Split a `[program, args...]` list. `None` if the list is empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            cwd: None,
        })
    }
}

/// A started job as seen by its consumer.
#[derive(Debug)]
pub struct JobHandle {
    pub events: mpsc::Receiver<JobEvent>,
    /// Cancelling this terminates the worker. No `Done` follows.
    pub cancel: CancellationToken,
}

/// Launches and supervises worker processes, at most one per session.
#[derive(Debug, Clone)]
pub struct JobRunner {
    worker: WorkerCommand,
    artifacts: ArtifactStore,
    entry_url: String,
    descriptor_dir: PathBuf,
    kill_grace: Duration,
}

enum Outcome {
    Completed(i32),
    Cancelled,
}

impl JobRunner {
    pub fn new(
        worker: WorkerCommand,
        artifacts: ArtifactStore,
        entry_url: impl Into<String>,
        descriptor_dir: impl Into<PathBuf>,
        kill_grace: Duration,
    ) -> Self {
        Self {
            worker,
            artifacts,
            entry_url: entry_url.into(),
            descriptor_dir: descriptor_dir.into(),
            kill_grace,
        }
    }

    /// Build a runner from the `[worker]` settings. `None` if no program is configured.
    pub fn from_settings(settings: &WorkerSettings, artifacts: ArtifactStore) -> Option<Self> {
        let mut worker = WorkerCommand::from_argv(&settings.command)?;
        worker.cwd = settings.cwd.clone();
        Some(Self::new(
            worker,
            artifacts,
            settings.entry_url.clone(),
            settings.descriptor_dir(),
            settings.kill_grace(),
        ))
    }

    /// Start a job for `session`.
    ///
    /// Always returns a handle. When a precondition fails the channel holds
    /// one `Error` and `Done { code: 1 }` and no process is spawned.
    pub fn start(&self, session: &Arc<Session>) -> JobHandle {
        let cancel = session.cancelled().child_token();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        match admit(session) {
            Ok((guard, config, targets)) => {
                tracing::info!(session = %session.id(), "job accepted");
                let runner = self.clone();
                let job_cancel = cancel.clone();
                tokio::spawn(async move {
                    runner.supervise(guard, config, targets, tx, job_cancel).await;
                });
            }
            Err(e) => {
                tracing::info!(session = %session.id(), reason = %e, "job rejected");
                // Fresh channel with spare capacity; these cannot fail.
                let _ = tx.try_send(JobEvent::Error {
                    message: e.to_string(),
                });
                let _ = tx.try_send(JobEvent::Done { code: 1 });
            }
        }

        JobHandle { events: rx, cancel }
    }

    async fn supervise(
        &self,
        guard: RunGuard,
        config: JobConfig,
        targets: String,
        tx: mpsc::Sender<JobEvent>,
        cancel: CancellationToken,
    ) {
        let session_id = guard.session().id().to_string();
        let result = self
            .execute(&session_id, &config, &targets, &tx, &cancel)
            .await;
        // Clear the flag before the terminal event so a client reacting to
        // `Done` can start the next job immediately.
        drop(guard);

        match result {
            Ok(Outcome::Completed(code)) => {
                tracing::info!(session = %session_id, code, "job completed");
                let _ = tx.send(JobEvent::Done { code }).await;
            }
            Ok(Outcome::Cancelled) => {
                tracing::info!(session = %session_id, "job cancelled");
            }
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "job failed");
                let _ = tx
                    .send(JobEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                let _ = tx.send(JobEvent::Done { code: 1 }).await;
            }
        }
    }

    async fn execute(
        &self,
        session_id: &str,
        config: &JobConfig,
        targets: &str,
        tx: &mpsc::Sender<JobEvent>,
        cancel: &CancellationToken,
    ) -> Result<Outcome, JobError> {
        let dir = self
            .artifacts
            .ensure_session_dir(session_id)
            .await
            .map_err(JobError::ArtifactDir)?;
        // The worker may run with a different cwd.
        let dir = tokio::fs::canonicalize(&dir).await.unwrap_or(dir);

        let descriptor = self
            .write_descriptor(session_id, config, targets, &dir)
            .await?;
        // The client may have gone away while the files were prepared.
        if cancel.is_cancelled() {
            remove_descriptor(&descriptor).await;
            return Ok(Outcome::Cancelled);
        }
        let result = self.run_worker(session_id, &descriptor, tx, cancel).await;
        remove_descriptor(&descriptor).await;
        result
    }

    async fn write_descriptor(
        &self,
        session_id: &str,
        config: &JobConfig,
        targets: &str,
        download_dir: &Path,
    ) -> Result<PathBuf, JobError> {
        let descriptor = JobDescriptor {
            config,
            login_url: &self.entry_url,
            download_path: download_dir,
            students: targets,
        };
        let body = serde_json::to_vec_pretty(&descriptor)
            .map_err(|e| JobError::Descriptor(e.into()))?;

        tokio::fs::create_dir_all(&self.descriptor_dir)
            .await
            .map_err(JobError::Descriptor)?;
        let path = self.descriptor_dir.join(format!(
            "jobdeck-{}-{}.json",
            session_id,
            uuid::Uuid::new_v4().simple()
        ));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        // Holds the session's password.
        #[cfg(unix)]
        options.mode(0o600);

        let written = async {
            use tokio::io::AsyncWriteExt;
            let mut file = options.open(&path).await?;
            file.write_all(&body).await?;
            file.flush().await
        }
        .await;

        match written {
            Ok(()) => Ok(path),
            Err(e) => {
                remove_descriptor(&path).await;
                Err(JobError::Descriptor(e))
            }
        }
    }

    async fn run_worker(
        &self,
        session_id: &str,
        descriptor: &Path,
        tx: &mpsc::Sender<JobEvent>,
        cancel: &CancellationToken,
    ) -> Result<Outcome, JobError> {
        let mut cmd = Command::new(&self.worker.program);
        cmd.args(&self.worker.args)
            .arg(descriptor)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = self.worker.cwd {
            cmd.current_dir(cwd);
        }
        // Own process group so cancellation reaches the worker's children.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(JobError::Spawn)?;
        let pid = child.id();
        tracing::info!(session = %session_id, pid, program = %self.worker.program, "worker started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(forward_lines(stdout, tx.clone()));
        let stderr_task = tokio::spawn(forward_chunks(stderr, tx.clone()));

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        match exited {
            Some(status) => {
                let status = status.map_err(JobError::Wait)?;
                // Everything the worker wrote goes out before `Done`.
                let readers = [stdout_task.abort_handle(), stderr_task.abort_handle()];
                let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
                    let _ = stdout_task.await;
                    let _ = stderr_task.await;
                })
                .await;
                if drained.is_err() {
                    tracing::warn!(session = %session_id, "worker output still open after exit, dropping the rest");
                    for reader in readers {
                        reader.abort();
                    }
                }
                Ok(Outcome::Completed(exit_code(status)))
            }
            None => {
                terminate(&mut child, pid, self.kill_grace).await;
                stdout_task.abort();
                stderr_task.abort();
                Ok(Outcome::Cancelled)
            }
        }
    }
}

/// Take the session's run slot and check that a job can start.
///
/// The slot is claimed first so the single-flight check is one atomic step;
/// a failed validation drops the guard again before returning.
fn admit(session: &Arc<Session>) -> Result<(RunGuard, JobConfig, String), JobError> {
    let guard = session.try_start().ok_or(JobError::AlreadyRunning)?;
    if session.cancelled().is_cancelled() {
        return Err(JobError::SessionExpired);
    }
    let (config, targets) = session.snapshot();
    let missing = config.missing_fields();
    if !missing.is_empty() {
        return Err(JobError::MissingFields(missing.join(", ")));
    }
    if count_targets(&targets) == 0 {
        return Err(JobError::EmptyTargets);
    }
    Ok((guard, config, targets))
}

/// Forward each non-empty stdout line as a `Log` event.
async fn forward_lines<R>(reader: Option<R>, tx: mpsc::Sender<JobEvent>)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else { return };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(|c: char| c == '\n' || c == '\r');
                if line.trim().is_empty() {
                    continue;
                }
                let event = JobEvent::Log {
                    message: line.to_string(),
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read worker stdout");
                break;
            }
        }
    }
}

/// Forward each stderr read as one `Error` event, unsplit.
///
/// A multi-byte character cut by a read boundary is held back and sent with
/// the next chunk.
async fn forward_chunks<R>(reader: Option<R>, tx: mpsc::Sender<JobEvent>)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else { return };
    let mut buf = [0u8; 4096];
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let cut = utf8_boundary(&pending);
                if cut == 0 {
                    continue;
                }
                let event = JobEvent::Error {
                    message: String::from_utf8_lossy(&pending[..cut]).into_owned(),
                };
                pending.drain(..cut);
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read worker stderr");
                break;
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx
            .send(JobEvent::Error {
                message: String::from_utf8_lossy(&pending).into_owned(),
            })
            .await;
    }
}

/// Length of the longest prefix of `bytes` that does not end partway
/// through a UTF-8 sequence.
fn utf8_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}

/// SIGTERM the worker's process group, then SIGKILL after `grace`.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid.filter(|p| *p != 0 && *p <= i32::MAX as u32) {
            let group = -(pid as i32);
            unsafe {
                libc::kill(group, libc::SIGTERM);
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(pid, ?status, "worker exited after SIGTERM");
                    // Stragglers in the group.
                    unsafe {
                        libc::kill(group, libc::SIGKILL);
                    }
                    return;
                }
                Ok(Err(e)) => tracing::warn!(pid, error = %e, "error waiting for worker"),
                Err(_) => tracing::warn!(pid, "worker ignored SIGTERM, sending SIGKILL"),
            }
            unsafe {
                libc::kill(group, libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = (pid, grace);

    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to kill worker");
    }
}

/// Exit code as reported to the client. Signal deaths map to `128 + signo`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

async fn remove_descriptor(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %e, "failed to remove job descriptor");
        }
    }
}
