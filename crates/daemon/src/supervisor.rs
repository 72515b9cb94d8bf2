//! Stream supervision state machine
//!
//! Owns the single current session, the attempt counter, and the shared
//! health state. All transitions run on one event loop: encoder lifecycle
//! events and health restart requests arrive over channels, and the backoff
//! delay is awaited inline, so a pending restart can never race a fresh
//! external start into a second session.

use crate::encode::{EncodeError, Encoder, EncoderSession, SessionEvent};
use crate::health::{HealthMonitor, HealthState, RestartRequest, SharedHealth};
use crate::policy::{RestartDecision, RestartPolicy};
use crate::selector::{IndexSource, SelectError, Selector};
use loopcast_config::{Config, StreamConfig};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Error type for supervision operations
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Content selection failed
    #[error("Content selection failed: {0}")]
    Select(#[from] SelectError),

    /// Encoder launch failed
    #[error("Encoder launch failed: {0}")]
    Encode(#[from] EncodeError),

    /// Consecutive failures exhausted the restart budget
    #[error("Restart attempts exhausted after {attempts} consecutive failures")]
    AttemptsExhausted { attempts: u32 },
}

/// Supervisor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No session, no restart pending
    Stopped,
    /// Selecting content and launching the encoder
    Starting,
    /// Encoder confirmed it is producing output
    Live,
    /// Waiting out the backoff delay before another start attempt
    Restarting,
    /// Attempts exhausted; only an external start can resume
    Halted,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Stopped => "stopped",
            SupervisorState::Starting => "starting",
            SupervisorState::Live => "live",
            SupervisorState::Restarting => "restarting",
            SupervisorState::Halted => "halted",
        }
    }
}

/// What pushed a live stream into the restart path
enum RestartCause {
    Failure(crate::encode::FailureInfo),
    Ended,
    Unhealthy,
}

/// Supervises one continuous broadcast: selection, launch, health
/// monitoring, teardown, and backoff-delayed restarts.
pub struct Supervisor<S: IndexSource, E: Encoder> {
    stream: StreamConfig,
    selector: Selector<S>,
    encoder: E,
    policy: RestartPolicy,
    health_interval: Duration,
    state: SupervisorState,
    attempts: u32,
    health: SharedHealth,
    session: Option<EncoderSession>,
    monitor: Option<JoinHandle<()>>,
    restart_tx: mpsc::Sender<RestartRequest>,
    restart_rx: mpsc::Receiver<RestartRequest>,
}

impl<S: IndexSource, E: Encoder> Supervisor<S, E> {
    pub fn new(config: &Config, selector: Selector<S>, encoder: E) -> Self {
        let (restart_tx, restart_rx) = mpsc::channel(4);
        Self {
            stream: config.stream.clone(),
            selector,
            encoder,
            policy: RestartPolicy::from_config(&config.supervisor),
            health_interval: Duration::from_secs(config.supervisor.health_check_secs),
            state: SupervisorState::Stopped,
            attempts: 0,
            health: Arc::new(Mutex::new(HealthState::down())),
            session: None,
            monitor: None,
            restart_tx,
            restart_rx,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Consecutive restart attempts consumed since the last started session
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Shared health state for the current session
    pub fn health(&self) -> SharedHealth {
        self.health.clone()
    }

    /// External entry point: start (or restart) the broadcast.
    ///
    /// Resets the attempt counter, terminates any prior session, and
    /// resolves once the encoder confirms it is producing output. Selection
    /// and launch errors propagate to the caller. Valid from any state,
    /// including Halted.
    pub async fn start_stream(&mut self) -> Result<(), SupervisorError> {
        self.attempts = 0;
        match self.try_start().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = SupervisorState::Stopped;
                Err(e)
            }
        }
    }

    /// Supervision loop. Call after a successful `start_stream`; keeps the
    /// broadcast alive until the restart budget is exhausted, then returns
    /// `AttemptsExhausted` with the supervisor in Halted.
    pub async fn run(&mut self) -> Result<(), SupervisorError> {
        loop {
            let cause = self.wait_for_trigger().await;
            self.health.lock().await.healthy = false;
            self.state = SupervisorState::Restarting;
            match &cause {
                RestartCause::Failure(info) => {
                    warn!(class = ?info.class, message = %info.message, "stream failed")
                }
                RestartCause::Ended => info!("stream ended"),
                RestartCause::Unhealthy => warn!("restarting on failed health check"),
            }
            self.restart_with_backoff().await?;
        }
    }

    /// One Starting -> Live transition attempt
    async fn try_start(&mut self) -> Result<(), SupervisorError> {
        self.state = SupervisorState::Starting;
        self.teardown_session().await;
        // Drop any restart request queued by the monitor we just aborted,
        // so a stale health check cannot restart the new session.
        while self.restart_rx.try_recv().is_ok() {}

        let content = self.selector.pick().await?;
        // The full destination carries the stream key; log the base URL only.
        info!(content = content.id, url = %self.stream.url, "launching encoder");
        let destination = self.stream.destination();
        let session = self.encoder.launch(&content.path, &destination).await?;

        self.attempts = 0;
        *self.health.lock().await = HealthState::live_now();
        self.monitor = Some(
            HealthMonitor::new(self.health_interval)
                .spawn(self.health.clone(), self.restart_tx.clone()),
        );
        info!(session = %session.id(), content = content.id, "stream live");
        self.session = Some(session);
        self.state = SupervisorState::Live;
        Ok(())
    }

    /// Terminate the current session, if any, and stop its health monitor.
    /// Best-effort: termination problems are logged by the adapter, never
    /// surfaced as errors.
    async fn teardown_session(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        if let Some(mut session) = self.session.take() {
            debug!(session = %session.id(), "terminating previous session");
            session.terminate();
        }
    }

    /// Wait for whatever ends the current Live state
    async fn wait_for_trigger(&mut self) -> RestartCause {
        let Self {
            session,
            restart_rx,
            ..
        } = self;
        match session.as_mut() {
            Some(session) => tokio::select! {
                event = session.next_event() => match event {
                    Some(SessionEvent::Failed(info)) => RestartCause::Failure(info),
                    Some(SessionEvent::Ended) => RestartCause::Ended,
                    // Watcher gone without a report; treat as end of stream.
                    None => RestartCause::Ended,
                },
                Some(RestartRequest) = restart_rx.recv() => RestartCause::Unhealthy,
            },
            // No live session to watch; only a health request can arrive.
            None => match restart_rx.recv().await {
                Some(RestartRequest) => RestartCause::Unhealthy,
                None => RestartCause::Ended,
            },
        }
    }

    /// Restarting -> Starting (or Halted): retry with backoff until a start
    /// succeeds or the attempt budget is gone. Start errors, including
    /// selection failures, consume an attempt like runtime failures.
    async fn restart_with_backoff(&mut self) -> Result<(), SupervisorError> {
        loop {
            match self.policy.decide(self.attempts) {
                RestartDecision::Halt => {
                    self.teardown_session().await;
                    self.state = SupervisorState::Halted;
                    error!(
                        attempts = self.attempts,
                        "restart attempts exhausted, manual intervention required"
                    );
                    return Err(SupervisorError::AttemptsExhausted {
                        attempts: self.attempts,
                    });
                }
                RestartDecision::Retry { delay } => {
                    self.attempts += 1;
                    info!(
                        attempt = self.attempts,
                        max_attempts = self.policy.max_attempts,
                        delay_secs = delay.as_secs(),
                        "restart scheduled"
                    );
                    tokio::time::sleep(delay).await;
                    match self.try_start().await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            warn!(attempt = self.attempts, error = %e, "restart attempt failed");
                            self.state = SupervisorState::Restarting;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::FailureInfo;
    use async_trait::async_trait;
    use loopcast_config::{LibraryConfig, SupervisorConfig};
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::oneshot;
    use uuid::Uuid;

    /// Scripted outcome for one encoder launch
    enum Outcome {
        /// Launch succeeds; the session delivers these events, then stays open
        Started(Vec<SessionEvent>),
        /// Launch fails before the started signal
        FailLaunch(&'static str),
        /// Launch is recorded but never resolves
        NeverStart,
    }

    #[derive(Default)]
    struct LaunchLog {
        destinations: Vec<String>,
        contents: Vec<PathBuf>,
        stops: Vec<oneshot::Receiver<()>>,
        keep_alive: Vec<mpsc::Sender<SessionEvent>>,
    }

    /// Encoder that replays scripted launch outcomes and records every call
    struct FakeEncoder {
        log: Arc<StdMutex<LaunchLog>>,
        outcomes: StdMutex<VecDeque<Outcome>>,
    }

    impl FakeEncoder {
        fn new(outcomes: Vec<Outcome>) -> Self {
            Self {
                log: Arc::new(StdMutex::new(LaunchLog::default())),
                outcomes: StdMutex::new(outcomes.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl Encoder for FakeEncoder {
        async fn launch(
            &self,
            content: &Path,
            destination: &str,
        ) -> Result<EncoderSession, EncodeError> {
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected extra launch");
            {
                let mut log = self.log.lock().unwrap();
                log.destinations.push(destination.to_string());
                log.contents.push(content.to_path_buf());
            }
            match outcome {
                Outcome::FailLaunch(msg) => Err(EncodeError::ExitedBeforeStart(msg.to_string())),
                Outcome::NeverStart => std::future::pending().await,
                Outcome::Started(events) => {
                    let (tx, rx) = mpsc::channel(8);
                    for event in events {
                        tx.try_send(event).unwrap();
                    }
                    let (stop_tx, stop_rx) = oneshot::channel();
                    let mut log = self.log.lock().unwrap();
                    log.stops.push(stop_rx);
                    log.keep_alive.push(tx);
                    Ok(EncoderSession::new(Uuid::new_v4(), rx, stop_tx))
                }
            }
        }
    }

    /// Index source that always draws the same id
    struct ConstSource(u32);

    impl IndexSource for ConstSource {
        fn draw(&mut self, bound: u32) -> u32 {
            self.0 % bound
        }
    }

    fn failed(message: &str) -> SessionEvent {
        SessionEvent::Failed(FailureInfo::classify(message))
    }

    fn test_config(dir: &Path) -> Config {
        Config {
            stream: StreamConfig {
                key: "abc".to_string(),
                url: "rtmp://host".to_string(),
            },
            library: LibraryConfig {
                dir: dir.to_path_buf(),
                catalog_size: 64,
                rotation_capacity: 0,
                file_pattern: "{index}.mp4".to_string(),
            },
            supervisor: SupervisorConfig {
                max_attempts: 5,
                backoff_secs: 10,
                health_check_secs: 30,
            },
        }
    }

    fn supervisor_with(
        dir: &Path,
        config: &Config,
        outcomes: Vec<Outcome>,
        draw: u32,
    ) -> (Supervisor<ConstSource, FakeEncoder>, Arc<StdMutex<LaunchLog>>) {
        std::fs::write(dir.join(format!("{}.mp4", draw)), b"x").unwrap();
        let encoder = FakeEncoder::new(outcomes);
        let log = encoder.log.clone();
        let selector = Selector::new(&config.library, ConstSource(draw));
        (Supervisor::new(config, selector, encoder), log)
    }

    /// Poll the launch log until `count` launches happened (virtual time)
    async fn wait_for_launches(log: &Arc<StdMutex<LaunchLog>>, count: usize) {
        for _ in 0..1000 {
            if log.lock().unwrap().destinations.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!(
            "expected {} launches, saw {}",
            count,
            log.lock().unwrap().destinations.len()
        );
    }

    #[tokio::test]
    async fn test_start_stream_reaches_live() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let (mut sup, log) =
            supervisor_with(tmp.path(), &config, vec![Outcome::Started(vec![])], 42);

        sup.start_stream().await.unwrap();

        assert_eq!(sup.state(), SupervisorState::Live);
        assert_eq!(sup.attempts(), 0);
        assert!(sup.health().lock().await.healthy);

        let log = log.lock().unwrap();
        assert_eq!(log.destinations, vec!["rtmp://host/abc".to_string()]);
        assert_eq!(log.contents[0], tmp.path().join("42.mp4"));
    }

    #[tokio::test]
    async fn test_start_stream_terminates_previous_session() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let (mut sup, log) = supervisor_with(
            tmp.path(),
            &config,
            vec![Outcome::Started(vec![]), Outcome::Started(vec![])],
            7,
        );

        sup.start_stream().await.unwrap();
        sup.start_stream().await.unwrap();

        let mut log = log.lock().unwrap();
        assert_eq!(log.destinations.len(), 2);
        // First session received an explicit stop; the second is untouched.
        assert!(log.stops[0].try_recv().is_ok());
        assert!(log.stops[1].try_recv().is_err());
    }

    #[tokio::test]
    async fn test_selection_failure_propagates_from_start_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        // No catalog file for the drawn id.
        let encoder = FakeEncoder::new(vec![]);
        let selector = Selector::new(&config.library, ConstSource(3));
        let mut sup = Supervisor::new(&config, selector, encoder);

        let err = sup.start_stream().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Select(_)));
        assert_eq!(sup.state(), SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_streak_halts_after_max_attempts() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let (mut sup, log) = supervisor_with(
            tmp.path(),
            &config,
            vec![
                Outcome::Started(vec![failed("Connection refused")]),
                Outcome::FailLaunch("Connection refused"),
                Outcome::FailLaunch("Connection refused"),
                Outcome::FailLaunch("Connection timed out"),
                Outcome::FailLaunch("Connection refused"),
                Outcome::FailLaunch("Connection refused"),
            ],
            7,
        );

        sup.start_stream().await.unwrap();
        let err = sup.run().await.unwrap_err();

        assert!(matches!(
            err,
            SupervisorError::AttemptsExhausted { attempts: 5 }
        ));
        assert_eq!(sup.state(), SupervisorState::Halted);
        // One successful launch plus exactly max_attempts retries; a sixth
        // retry would have panicked the scripted encoder.
        let log = log.lock().unwrap();
        assert_eq!(log.destinations.len(), 6);
        assert!(log.destinations.iter().all(|d| d == "rtmp://host/abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_halted_supervisor_restarts_on_external_start() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let (mut sup, _log) = supervisor_with(
            tmp.path(),
            &config,
            vec![
                Outcome::Started(vec![failed("boom")]),
                Outcome::FailLaunch("boom"),
                Outcome::FailLaunch("boom"),
                Outcome::FailLaunch("boom"),
                Outcome::FailLaunch("boom"),
                Outcome::FailLaunch("boom"),
                Outcome::Started(vec![]),
            ],
            7,
        );

        sup.start_stream().await.unwrap();
        sup.run().await.unwrap_err();
        assert_eq!(sup.state(), SupervisorState::Halted);

        // Only an explicit external call resumes, and it resets the counter.
        sup.start_stream().await.unwrap();
        assert_eq!(sup.state(), SupervisorState::Live);
        assert_eq!(sup.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stream_relaunches_with_same_config_after_backoff() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let (mut sup, log) = supervisor_with(
            tmp.path(),
            &config,
            vec![
                Outcome::Started(vec![failed("Connection refused")]),
                // Second launch stays suspended so the retry state is
                // observable at the moment the relaunch is issued.
                Outcome::NeverStart,
            ],
            7,
        );

        sup.start_stream().await.unwrap();

        // Drive run() on this task instead of spawning it, so the supervisor
        // can be inspected once the relaunch has happened.
        {
            let run = sup.run();
            tokio::pin!(run);
            tokio::select! {
                res = &mut run => panic!("supervisor returned early: {:?}", res),
                _ = wait_for_launches(&log, 2) => {}
            }
        }

        // Exactly one retry was consumed for the backoff-delayed relaunch.
        assert_eq!(sup.attempts(), 1);
        assert_eq!(sup.state(), SupervisorState::Starting);

        let mut log = log.lock().unwrap();
        assert_eq!(log.destinations[1], log.destinations[0]);
        // The failed session was torn down before the relaunch.
        assert!(log.stops[0].try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_stream_triggers_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let (mut sup, log) = supervisor_with(
            tmp.path(),
            &config,
            vec![
                Outcome::Started(vec![SessionEvent::Ended]),
                Outcome::Started(vec![]),
            ],
            7,
        );

        sup.start_stream().await.unwrap();
        let handle = tokio::spawn(async move { sup.run().await });

        wait_for_launches(&log, 2).await;
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_counter_resets_on_each_started() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.supervisor.max_attempts = 1;
        let (mut sup, log) = supervisor_with(
            tmp.path(),
            &config,
            vec![
                Outcome::Started(vec![failed("boom")]),
                Outcome::Started(vec![failed("boom")]),
                Outcome::Started(vec![failed("boom")]),
                Outcome::Started(vec![]),
            ],
            7,
        );

        sup.start_stream().await.unwrap();
        let handle = tokio::spawn(async move { sup.run().await });

        // With max_attempts = 1, reaching four launches is only possible if
        // the counter resets to zero on every started event.
        wait_for_launches(&log, 4).await;
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_request_restarts_unhealthy_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let (mut sup, log) = supervisor_with(
            tmp.path(),
            &config,
            vec![Outcome::Started(vec![]), Outcome::Started(vec![])],
            7,
        );

        sup.start_stream().await.unwrap();
        let health = sup.health();
        let handle = tokio::spawn(async move { sup.run().await });

        // The adapter would flip this on a failure it could not report;
        // the monitor picks it up at the next interval.
        health.lock().await.healthy = false;

        wait_for_launches(&log, 2).await;
        handle.abort();
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SupervisorState::Stopped.as_str(), "stopped");
        assert_eq!(SupervisorState::Starting.as_str(), "starting");
        assert_eq!(SupervisorState::Live.as_str(), "live");
        assert_eq!(SupervisorState::Restarting.as_str(), "restarting");
        assert_eq!(SupervisorState::Halted.as_str(), "halted");
    }
}
