//! EncoderProcess: wraps a launched external encoder (§4.2).
//!
//! Launch starts three concurrent workers (stdout, stderr, exit observer).
//! Kill and the exit observer race over the same `tokio::process::Child`
//! via a cancellation token, mirroring the graceful-stop pattern the
//! downloader engine uses for its own child processes.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use process_utils::tokio_command;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;

/// Events the encoder reports upstream to its owning Stream.
#[derive(Debug)]
pub enum EncoderEvent {
    /// A segment with this id was observed in stdout, for the first time.
    SegmentReady(u64),
    /// The process exited; `None` if it could not be waited on at all.
    Exited(Option<i32>),
}

/// A live (or recently-killed) encoder child process.
///
/// `epoch` is this instance's identity token (§9, Epoch identification):
/// callers capture it before releasing the Stream lock and compare it on
/// wake to detect replacement.
pub struct EncoderProcess {
    pub epoch: u64,
    pub start_id: u64,
    pid: Option<u32>,
    kill_token: CancellationToken,
    reaped_rx: watch::Receiver<bool>,
    paused: AtomicBool,
}

impl EncoderProcess {
    /// Launch a child process and start its three workers. `events` is the
    /// channel the stdout worker and exit observer report through; the
    /// Stream owns the receiving end.
    pub fn launch(
        binary_path: &str,
        args: Vec<String>,
        quality: String,
        start_id: u64,
        epoch: u64,
        events: mpsc::Sender<EncoderEvent>,
    ) -> Result<Self, EngineError> {
        let mut cmd = tokio_command(binary_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| EngineError::FatalConfig(format!("{binary_path}: {err}")))?;

        let pid = child.id();
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let kill_token = CancellationToken::new();
        let (reaped_tx, reaped_rx) = watch::channel(false);

        tokio::spawn(stdout_worker(stdout, quality, events.clone()));
        tokio::spawn(stderr_worker(stderr));
        tokio::spawn(exit_observer(child, kill_token.clone(), reaped_tx, events));

        Ok(Self {
            epoch,
            start_id,
            pid,
            kill_token,
            reaped_rx,
            paused: AtomicBool::new(false),
        })
    }

    /// Send the pause-equivalent signal. Idempotent (B3): pausing an
    /// already-paused (or already-dead) encoder is a no-op beyond the
    /// first call.
    pub fn pause(&self) {
        if self.paused.swap(true, Ordering::AcqRel) {
            return;
        }
        self.signal(StopSignal::Stop);
    }

    /// Send the resume-equivalent signal. Idempotent (B3).
    pub fn resume(&self) {
        if !self.paused.swap(false, Ordering::AcqRel) {
            return;
        }
        self.signal(StopSignal::Continue);
    }

    #[cfg(unix)]
    fn signal(&self, which: StopSignal) {
        let Some(pid) = self.pid else { return };
        let sig = match which {
            StopSignal::Stop => libc::SIGSTOP,
            StopSignal::Continue => libc::SIGCONT,
        };
        // SAFETY: signalling a pid we obtained from `Child::id()`; ESRCH
        // (process already gone) is a benign race, not an error.
        unsafe {
            libc::kill(pid as libc::pid_t, sig);
        }
    }

    /// On platforms without job-control signals, pause/resume degrade to a
    /// goal-ceiling hint with no actual process suspension (§9, §4.2).
    #[cfg(not(unix))]
    fn signal(&self, _which: StopSignal) {}

    /// Forcibly terminate and reap. Idempotent (R2): once reaped, further
    /// calls return immediately. Once this returns, no further stdout
    /// announcements will be delivered (§4.2 contract).
    pub async fn kill(&self) {
        self.kill_token.cancel();
        let mut rx = self.reaped_rx.clone();
        if !*rx.borrow() {
            let _ = rx.wait_for(|reaped| *reaped).await;
        }
    }
}

enum StopSignal {
    Stop,
    Continue,
}

async fn stdout_worker(
    stdout: tokio::process::ChildStdout,
    quality: String,
    events: mpsc::Sender<EncoderEvent>,
) {
    let pattern = match Regex::new(&format!(
        r"{}-(\d{{6}})\.(?:ts|mp4)",
        regex::escape(&quality)
    )) {
        Ok(re) => re,
        Err(err) => {
            warn!(%err, "failed to compile segment filename pattern");
            return;
        }
    };

    let mut seen = std::collections::HashSet::new();
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(captures) = pattern.captures(&line)
                    && let Some(id_str) = captures.get(1)
                    && let Ok(id) = id_str.as_str().parse::<u64>()
                    && seen.insert(id)
                    && events.send(EncoderEvent::SegmentReady(id)).await.is_err()
                {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(%err, "encoder stdout read error");
                break;
            }
        }
    }
}

async fn stderr_worker(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.to_ascii_lowercase().contains("error") {
            warn!(encoder_line = %line, "encoder stderr");
        } else {
            debug!(encoder_line = %line, "encoder stderr");
        }
    }
}

async fn exit_observer(
    mut child: tokio::process::Child,
    kill_token: CancellationToken,
    reaped_tx: watch::Sender<bool>,
    events: mpsc::Sender<EncoderEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_token.cancelled() => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let _ = reaped_tx.send(true);
    let code = status.ok().and_then(|s| s.code());
    let _ = events.send(EncoderEvent::Exited(code)).await;
}
