//! ffmpeg invocation and lifecycle watching
//!
//! Builds the fixed encode-and-publish command and supervises one running
//! instance of it: a watcher task scans stderr for the first progress line
//! (the "started" signal), keeps a short stderr tail for failure reports,
//! and emits `Failed`/`Ended` once the process exits.

use super::{EncodeError, Encoder, EncoderSession, FailureInfo, SessionEvent};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fixed video bitrate ceiling
const VIDEO_BITRATE: &str = "3000k";
/// Rate-control buffer, twice the bitrate ceiling
const BUFFER_SIZE: &str = "6000k";
/// Keyframe interval in frames
const KEYFRAME_INTERVAL: &str = "60";
/// Fixed pixel format
const PIXEL_FORMAT: &str = "yuv420p";
/// Encoder thread cap
const THREADS: &str = "4";
/// Upper bound on ffmpeg's own reconnect delay, in seconds
const RECONNECT_DELAY_MAX_SECS: &str = "5";
/// Socket-level timeout, in microseconds
const RW_TIMEOUT_US: &str = "10000000";

/// Trailing stderr lines kept for failure reports
const STDERR_TAIL_LINES: usize = 8;
/// Grace period between the stop signal and a forceful kill
const STOP_GRACE: Duration = Duration::from_secs(5);
/// How long to wait for the first progress line before giving up
const START_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the fixed encode-and-publish command.
///
/// Only the content path and the destination vary per call; everything else
/// is part of the invocation contract: read input at its native rate, loop
/// it indefinitely, reconnect on drops with a bounded delay, cap threads,
/// fixed bitrate ceiling and buffer, fixed pixel format and keyframe
/// interval, flv push to the destination with a socket timeout.
pub fn build_ffmpeg_command(content: &Path, destination: &str) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner");

    // Input side
    cmd.arg("-re");
    cmd.arg("-stream_loop").arg("-1");
    cmd.arg("-reconnect").arg("1");
    cmd.arg("-reconnect_delay_max").arg(RECONNECT_DELAY_MAX_SECS);
    cmd.arg("-i").arg(content);

    // Output side
    cmd.arg("-threads").arg(THREADS);
    cmd.arg("-c:v").arg("libx264");
    cmd.arg("-preset").arg("veryfast");
    cmd.arg("-b:v").arg(VIDEO_BITRATE);
    cmd.arg("-maxrate").arg(VIDEO_BITRATE);
    cmd.arg("-bufsize").arg(BUFFER_SIZE);
    cmd.arg("-pix_fmt").arg(PIXEL_FORMAT);
    cmd.arg("-g").arg(KEYFRAME_INTERVAL);
    cmd.arg("-c:a").arg("aac");
    cmd.arg("-b:a").arg("128k");
    cmd.arg("-f").arg("flv");
    cmd.arg("-rw_timeout").arg(RW_TIMEOUT_US);
    cmd.arg(destination);

    cmd
}

/// ffmpeg writes progress lines to stderr once it is producing output
fn is_progress_line(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with("frame=") || line.starts_with("size=")
}

/// Encoder backed by an ffmpeg subprocess
pub struct FfmpegEncoder;

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn launch(
        &self,
        content: &Path,
        destination: &str,
    ) -> Result<EncoderSession, EncodeError> {
        let mut cmd = build_ffmpeg_command(content, destination);
        // stdin stays open so a stop can ask ffmpeg to quit before any kill.
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(EncodeError::Spawn)?;
        let stdin = child.stdin.take();
        let stderr = child.stderr.take().ok_or_else(|| {
            EncodeError::Spawn(std::io::Error::new(
                std::io::ErrorKind::Other,
                "encoder stderr not captured",
            ))
        })?;

        let id = Uuid::new_v4();
        let (event_tx, event_rx) = mpsc::channel(8);
        let (started_tx, started_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        tokio::spawn(watch_session(
            id, child, stdin, stderr, started_tx, event_tx, stop_rx,
        ));

        // Resolve only once the process is actively producing output.
        match tokio::time::timeout(START_TIMEOUT, started_rx).await {
            Ok(Ok(Ok(()))) => {
                info!(session = %id, "encoder started");
                Ok(EncoderSession::new(id, event_rx, stop_tx))
            }
            Ok(Ok(Err(message))) => Err(EncodeError::ExitedBeforeStart(message)),
            Ok(Err(_)) => Err(EncodeError::ExitedBeforeStart(
                "encoder watcher stopped unexpectedly".to_string(),
            )),
            // Dropping stop_tx makes the watcher kill the process.
            Err(_) => Err(EncodeError::ExitedBeforeStart(format!(
                "no output within {}s",
                START_TIMEOUT.as_secs()
            ))),
        }
    }
}

/// Watch one running encoder process until it exits.
///
/// Sends the started signal on the first progress line. When `stop_rx`
/// fires (or its sender is dropped) the process is stopped graceful first:
/// ffmpeg's quit command goes down stdin, and only if the process is still
/// alive after `STOP_GRACE` does the kill follow. The final outcome is
/// reported either through `started_tx` (if the process never started) or
/// as a session event.
async fn watch_session(
    id: Uuid,
    mut child: Child,
    mut stdin: Option<ChildStdin>,
    stderr: ChildStderr,
    started_tx: oneshot::Sender<Result<(), String>>,
    events: mpsc::Sender<SessionEvent>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut lines = BufReader::new(stderr).lines();
    let mut started_tx = Some(started_tx);
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut forced = false;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if is_progress_line(&line) {
                        if let Some(tx) = started_tx.take() {
                            debug!(session = %id, "encoder producing output");
                            let _ = tx.send(Ok(()));
                        }
                        continue; // progress lines are noise, keep real messages
                    }
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                // stderr closed or unreadable: the process is exiting
                Ok(None) | Err(_) => break,
            },
            _ = &mut stop_rx, if !forced => {
                forced = true;
                let graceful = match stdin.take() {
                    Some(mut stdin) => {
                        debug!(session = %id, "stop requested, sending quit to encoder");
                        // stdin drops after the write; EOF doubles as a quit
                        // signal for encoders that ignore the command.
                        stdin.write_all(b"q\n").await.is_ok()
                    }
                    None => false,
                };
                if !graceful {
                    debug!(session = %id, "graceful quit unavailable, killing encoder");
                    if let Err(e) = child.start_kill() {
                        warn!(session = %id, error = %e, "encoder stop signal failed");
                    }
                }
                break;
            }
        }
    }

    let status = match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(session = %id, "encoder did not exit in time, forcing kill");
            if let Err(e) = child.kill().await {
                warn!(session = %id, error = %e, "forceful kill failed");
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) if status.success() && !forced => {
            if let Some(tx) = started_tx.take() {
                let _ = tx.send(Err("encoder exited immediately".to_string()));
                return;
            }
            info!(session = %id, "encoder ended");
            let _ = events.send(SessionEvent::Ended).await;
        }
        Ok(status) => {
            let mut message = if forced {
                format!("encoder forced kill ({})", status)
            } else {
                format!("encoder exited with {}", status)
            };
            if !tail.is_empty() {
                message.push_str(": ");
                message.push_str(&tail.iter().cloned().collect::<Vec<_>>().join(" | "));
            }
            let info = FailureInfo::classify(message);
            match started_tx.take() {
                Some(tx) => {
                    let _ = tx.send(Err(info.message));
                }
                None => {
                    debug!(session = %id, class = ?info.class, "encoder failed");
                    let _ = events.send(SessionEvent::Failed(info)).await;
                }
            }
        }
        Err(e) => {
            let info = FailureInfo::classify(format!("failed to reap encoder: {}", e));
            match started_tx.take() {
                Some(tx) => {
                    let _ = tx.send(Err(info.message));
                }
                None => {
                    let _ = events.send(SessionEvent::Failed(info)).await;
                }
            }
        }
    }
}
