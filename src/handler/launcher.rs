use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::ad::Ad;
use crate::claim::ClaimId;
use crate::config::HandlerConfig;
use crate::handler::{HandlerId, HandlerSignal};
use crate::job::JobId;

pub const ENV_CLAIM_ID: &str = "SCHEDD_CLAIM_ID";
pub const ENV_SCHEDD_ADDRESS: &str = "SCHEDD_ADDRESS";
pub const ENV_JOB_ID: &str = "SCHEDD_JOB_ID";

/// How a handler process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for HandlerExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// Completion notifications posted back to the scheduler core.
#[derive(Debug)]
pub enum HandlerEvent {
    Started { handler: HandlerId, pid: u32 },
    SpawnFailed { handler: HandlerId, error: String },
    Exited { handler: HandlerId, pid: u32, exit: HandlerExit },
}

/// Everything a handler needs to start, resolved by the core before launch.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub handler: HandlerId,
    pub job_id: JobId,
    pub claim_id: ClaimId,
    pub reconnect: bool,
    /// Fully expanded job attributes, written to the handler's stdin.
    pub job_ad: Ad,
}

/// Spawns job-handler processes.
///
/// Spool preparation runs on the blocking pool. The process itself is
/// supervised by a task that relays control signals and reports the exit
/// status on the event channel.
#[derive(Debug, Clone)]
pub struct JobHandlerLauncher {
    config: HandlerConfig,
    schedd_addr: String,
    events: mpsc::UnboundedSender<HandlerEvent>,
}

impl JobHandlerLauncher {
    pub fn new(
        config: HandlerConfig,
        schedd_addr: impl Into<String>,
        events: mpsc::UnboundedSender<HandlerEvent>,
    ) -> Self {
        Self {
            config,
            schedd_addr: schedd_addr.into(),
            events,
        }
    }

    /// Start a handler in the background. The returned sender reaches the
    /// supervising task for as long as the process lives.
    pub fn launch(&self, request: LaunchRequest) -> mpsc::UnboundedSender<HandlerSignal> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let launcher = self.clone();
        tokio::spawn(async move {
            launcher.run(request, control_rx).await;
        });
        control_tx
    }

    async fn run(self, request: LaunchRequest, mut control: mpsc::UnboundedReceiver<HandlerSignal>) {
        let handler = request.handler;
        let job_id = request.job_id;

        let spool_root = self.config.spool_dir.clone();
        let spool = match tokio::task::spawn_blocking(move || prepare_spool(&spool_root, job_id))
            .await
        {
            Ok(Ok(path)) => path,
            Ok(Err(e)) => return self.spawn_failed(handler, job_id, format!("spool: {e}")),
            Err(e) => return self.spawn_failed(handler, job_id, format!("spool task: {e}")),
        };

        let mut command = Command::new(&self.config.program);
        command
            .arg("--job")
            .arg(job_id.to_string())
            .arg("--schedd")
            .arg(&self.schedd_addr);
        if request.reconnect {
            command.arg("--reconnect");
        }
        command
            .env(ENV_CLAIM_ID, request.claim_id.as_secret_str())
            .env(ENV_SCHEDD_ADDRESS, &self.schedd_addr)
            .env(ENV_JOB_ID, job_id.to_string())
            .current_dir(&spool)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return self.spawn_failed(handler, job_id, e.to_string()),
        };
        let pid = child.id().unwrap_or(0);
        tracing::info!(job_id = %job_id, handler = %handler, pid, reconnect = request.reconnect, "Spawned job handler");
        let _ = self.events.send(HandlerEvent::Started { handler, pid });

        // The ad is fed from its own task so a handler that never drains
        // stdin can still be signalled and reaped.
        let feeder = child.stdin.take().map(|mut stdin| {
            let payload = request.job_ad.to_json();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    tracing::debug!(job_id = %job_id, error = %e, "Handler did not read its job ad");
                }
                // dropping stdin closes the pipe
            })
        });

        let exit = loop {
            tokio::select! {
                status = child.wait() => {
                    break match status {
                        Ok(status) => HandlerExit::from(status),
                        Err(e) => {
                            tracing::warn!(job_id = %job_id, pid, error = %e, "Failed to reap job handler");
                            HandlerExit { code: None, signal: None }
                        }
                    };
                }
                Some(signal) = control.recv() => match signal {
                    HandlerSignal::Vacate => {
                        tracing::info!(job_id = %job_id, pid, "Vacating job handler");
                        send_sigterm(pid);
                    }
                    HandlerSignal::Kill => {
                        tracing::info!(job_id = %job_id, pid, "Killing job handler");
                        if let Err(e) = child.start_kill() {
                            tracing::warn!(job_id = %job_id, pid, error = %e, "Kill failed");
                        }
                    }
                },
            }
        };

        if let Some(feeder) = feeder {
            feeder.abort();
        }

        tracing::info!(
            job_id = %job_id,
            pid,
            exit_code = ?exit.code,
            signal = ?exit.signal,
            "Job handler exited"
        );
        let _ = self.events.send(HandlerEvent::Exited { handler, pid, exit });
    }

    fn spawn_failed(&self, handler: HandlerId, job_id: JobId, error: String) {
        tracing::warn!(job_id = %job_id, handler = %handler, error = %error, "Job handler spawn failed");
        let _ = self.events.send(HandlerEvent::SpawnFailed { handler, error });
    }
}

fn prepare_spool(root: &Path, job_id: JobId) -> std::io::Result<PathBuf> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    let dir = root
        .join(job_id.cluster.to_string())
        .join(job_id.proc.to_string());
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&dir)?;
    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    Ok(dir)
}

fn send_sigterm(pid: u32) {
    if pid == 0 {
        return;
    }
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        tracing::debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM not delivered");
    }
}
