//! Exclusive profiling sessions.
//!
//! At most one session is ever Running or Finalizing. Ownership is a
//! single-permit semaphore: `start` takes the permit (preempting whoever holds
//! it), and the session's finalize task gives it back when it drops its
//! [`TokenGuard`], whether it finished, failed, or panicked.
//!
//! ```text
//! Idle --start--> Running --(duration elapsed | stop request)--> Finalizing --> Idle
//! ```
//!
//! Stop requests carry no session id. A stop posted for one session can
//! reach the next one only if it arrives after that session acquired the
//! token; anything pending at acquisition time is discarded.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use benchconf::BenchConfig;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::artifacts::ArtifactDir;
use crate::capture::{
    CaptureError, ContentionSampling, ProfileKind, ProfilingBackend, CPU_ARTIFACT, TRACE_ARTIFACT,
};
use crate::marker::{Marker, MarkerError, MarkerVerb};

/// Coordinator settings, fixed at construction.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub artifact_dir: PathBuf,
    pub trace: bool,
    /// Applied on every acquisition
    pub contention_sampling: ContentionSampling,
    /// First wait for the token after posting a stop request
    pub preempt_backoff: Duration,
    pub preempt_backoff_max: Duration,
}

impl CoordinatorConfig {
    pub fn new(artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
            trace: false,
            contention_sampling: ContentionSampling::Max,
            preempt_backoff: Duration::from_millis(5),
            preempt_backoff_max: Duration::from_millis(200),
        }
    }

    pub fn from_config(config: &BenchConfig) -> Self {
        Self {
            trace: config.profiling.trace,
            contention_sampling: config.profiling.contention_sampling.into(),
            ..Self::new(config.paths.output_dir.clone())
        }
    }
}

/// Observable coordinator state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running { id: String },
    Finalizing { id: String },
}

impl SessionState {
    pub fn id(&self) -> Option<&str> {
        match self {
            SessionState::Idle => None,
            SessionState::Running { id } | SessionState::Finalizing { id } => Some(id),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle)
    }
}

/// Outcome of a finalized session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: String,
    /// Cut short by a stop request rather than running its full duration
    pub terminated_early: bool,
    /// What the marker was told: `stop` or `term`
    pub verb: MarkerVerb,
    pub artifacts: Vec<PathBuf>,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("profiling coordinator is shut down")]
    Closed,

    #[error("marker could not allocate a session id: {0}")]
    MarkerNextId(#[source] MarkerError),

    #[error("marker rejected start of session {id}: {source}")]
    MarkerStart {
        id: String,
        #[source]
        source: MarkerError,
    },

    #[error("failed to begin capture for session {id}: {source}")]
    Capture {
        id: String,
        #[source]
        source: CaptureError,
    },

    #[error("failed to write artifacts for session {id}: {source}")]
    Artifact {
        id: String,
        #[source]
        source: CaptureError,
    },

    #[error("finalize task for session {id} panicked")]
    Panicked { id: String },
}

/// A started session. Dropping the handle does not cancel the session.
#[derive(Debug)]
pub struct SessionHandle {
    id: String,
    task: JoinHandle<Result<SessionReport, SessionError>>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the session to finalize.
    pub async fn wait(self) -> Result<SessionReport, SessionError> {
        let SessionHandle { id, task } = self;
        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(session.id = %id, "finalize task failed: {}", e);
                Err(SessionError::Panicked { id })
            }
        }
    }
}

struct Shared<B> {
    backend: B,
    marker: Arc<dyn Marker>,
    config: CoordinatorConfig,
    token: Arc<Semaphore>,
    stop_tx: mpsc::Sender<()>,
    /// Locked only by the finalize task that holds the token
    stop_rx: Mutex<mpsc::Receiver<()>>,
    state: watch::Sender<SessionState>,
    /// Token held, marker start or capture setup still in flight
    launching: AtomicBool,
}

/// Token ownership. Dropping it returns the coordinator to Idle and then
/// releases the permit.
struct TokenGuard<B> {
    shared: Arc<Shared<B>>,
    _permit: OwnedSemaphorePermit,
}

impl<B> Drop for TokenGuard<B> {
    fn drop(&mut self) {
        self.shared.launching.store(false, Ordering::SeqCst);
        self.shared.state.send_replace(SessionState::Idle);
    }
}

struct Captures<B: ProfilingBackend> {
    artifacts: ArtifactDir,
    cpu: B::Cpu,
    trace: Option<B::Trace>,
}

impl<B: ProfilingBackend> Shared<B> {
    fn begin_captures(&self) -> Result<Captures<B>, CaptureError> {
        let artifacts = ArtifactDir::new(&self.config.artifact_dir);
        artifacts.ensure()?;

        let cpu = self.backend.begin_cpu(artifacts.create(CPU_ARTIFACT)?)?;
        self.backend
            .set_contention_sampling(self.config.contention_sampling);

        let trace = if self.config.trace {
            let begun = artifacts
                .create(TRACE_ARTIFACT)
                .and_then(|sink| self.backend.begin_trace(sink));
            match begun {
                Ok(trace) => Some(trace),
                Err(e) => {
                    if let Err(end_err) = self.backend.end_cpu(cpu) {
                        warn!("failed to stop cpu capture after trace error: {}", end_err);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Captures {
            artifacts,
            cpu,
            trace,
        })
    }

    /// Stop every capture and write the point-in-time profiles.
    fn flush(&self, captures: Captures<B>) -> Result<Vec<PathBuf>, CaptureError> {
        let Captures {
            artifacts,
            cpu,
            trace,
        } = captures;

        let mut written = vec![self.backend.end_cpu(cpu)?];
        self.backend.collect_garbage();

        for kind in ProfileKind::ALL {
            let mut file = artifacts.create(&kind.file_name())?;
            let path = file.path().to_path_buf();
            self.backend
                .dump_profile(kind, &mut file)
                .map_err(|source| CaptureError::Write { path, source })?;
            written.push(file.finish()?);
        }

        if let Some(trace) = trace {
            written.push(self.backend.end_trace(trace)?);
        }

        Ok(written)
    }
}

/// Starts, preempts, and finalizes profiling sessions.
pub struct SessionCoordinator<B> {
    shared: Arc<Shared<B>>,
}

impl<B> Clone for SessionCoordinator<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: ProfilingBackend> SessionCoordinator<B> {
    pub fn new(backend: B, marker: Arc<dyn Marker>, config: CoordinatorConfig) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (state, _) = watch::channel(SessionState::Idle);

        Self {
            shared: Arc::new(Shared {
                backend,
                marker,
                config,
                token: Arc::new(Semaphore::new(1)),
                stop_tx,
                stop_rx: Mutex::new(stop_rx),
                state,
                launching: AtomicBool::new(false),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Ask the current session to finalize now.
    ///
    /// The request is not addressed to a particular session. A session that
    /// is still waiting on the marker's `start` sees it as soon as it is
    /// running. Returns false when no session is starting or running.
    pub fn request_stop(&self) -> bool {
        let launching = self.shared.launching.load(Ordering::SeqCst);
        if !launching && !matches!(*self.shared.state.borrow(), SessionState::Running { .. }) {
            return false;
        }
        // A full channel already holds a pending stop
        let _ = self.shared.stop_tx.try_send(());
        true
    }

    /// Start session `id`, preempting any running session.
    ///
    /// Returns once captures are running; the session finalizes in the
    /// background after `benchmark` or on a stop request. Once the token is
    /// acquired the session runs to completion even if this future is
    /// dropped.
    pub async fn start(
        &self,
        id: impl Into<String>,
        benchmark: Duration,
    ) -> Result<SessionHandle, SessionError> {
        let id = id.into();
        let guard = TokenGuard {
            shared: Arc::clone(&self.shared),
            _permit: self.acquire().await?,
        };

        let coordinator = self.clone();
        let session_id = id.clone();
        let launch =
            tokio::spawn(async move { coordinator.launch(guard, session_id, benchmark).await });
        match launch.await {
            Ok(started) => started,
            Err(e) => {
                error!(session.id = %id, "session start panicked: {}", e);
                Err(SessionError::Panicked { id })
            }
        }
    }

    /// Ask the marker for the next id, then start that session.
    pub async fn start_next(&self, benchmark: Duration) -> Result<SessionHandle, SessionError> {
        let id = self
            .shared
            .marker
            .next_id()
            .await
            .map_err(SessionError::MarkerNextId)?;
        self.start(id, benchmark).await
    }

    /// Finalize any running session and refuse new ones.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let permit = match self.acquire().await {
            Ok(permit) => permit,
            Err(SessionError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.shared.token.close();
        drop(permit);
        info!("profiling coordinator shut down");
        Ok(())
    }

    /// Take the token, posting stop requests until the holder lets go.
    async fn acquire(&self) -> Result<OwnedSemaphorePermit, SessionError> {
        let config = &self.shared.config;
        let mut backoff = config.preempt_backoff;

        loop {
            match Arc::clone(&self.shared.token).try_acquire_owned() {
                Ok(permit) => return Ok(permit),
                Err(TryAcquireError::Closed) => return Err(SessionError::Closed),
                Err(TryAcquireError::NoPermits) => {}
            }

            let _ = self.shared.stop_tx.try_send(());

            let waited =
                tokio::time::timeout(backoff, Arc::clone(&self.shared.token).acquire_owned())
                    .await;
            match waited {
                Ok(Ok(permit)) => return Ok(permit),
                Ok(Err(_)) => return Err(SessionError::Closed),
                Err(_) => backoff = (backoff * 2).min(config.preempt_backoff_max),
            }
        }
    }

    /// Everything after acquisition: marker start, captures, finalize task.
    async fn launch(
        self,
        guard: TokenGuard<B>,
        id: String,
        benchmark: Duration,
    ) -> Result<SessionHandle, SessionError> {
        self.drain_stale_stops().await;
        self.shared.launching.store(true, Ordering::SeqCst);
        info!(session.id = %id, "profiling token acquired");

        let output = self
            .shared
            .marker
            .notify(MarkerVerb::Start, &id)
            .await
            .map_err(|source| {
                error!(session.id = %id, "marker start failed: {}", source);
                SessionError::MarkerStart {
                    id: id.clone(),
                    source,
                }
            })?;
        log_marker_output(&id, MarkerVerb::Start, &output);

        let shared = Arc::clone(&self.shared);
        let begun = tokio::task::spawn_blocking(move || shared.begin_captures())
            .await
            .unwrap_or_else(|e| {
                Err(CaptureError::Profiler(format!("capture start panicked: {e}")))
            });
        let captures = match begun {
            Ok(captures) => captures,
            Err(source) => {
                error!(session.id = %id, "failed to begin capture: {}", source);
                if let Err(e) = self.shared.marker.notify(MarkerVerb::Term, &id).await {
                    warn!(session.id = %id, "marker term failed: {}", e);
                }
                return Err(SessionError::Capture { id, source });
            }
        };

        self.shared
            .state
            .send_replace(SessionState::Running { id: id.clone() });
        self.shared.launching.store(false, Ordering::SeqCst);
        info!(
            session.id = %id,
            benchmark_secs = benchmark.as_secs_f64(),
            trace = self.shared.config.trace,
            "profiling session running"
        );

        let session_id = id.clone();
        let task =
            tokio::spawn(async move { self.finalize(guard, session_id, benchmark, captures).await });

        Ok(SessionHandle { id, task })
    }

    async fn drain_stale_stops(&self) {
        let mut stop_rx = self.shared.stop_rx.lock().await;
        while stop_rx.try_recv().is_ok() {}
    }

    async fn finalize(
        self,
        guard: TokenGuard<B>,
        id: String,
        benchmark: Duration,
        captures: Captures<B>,
    ) -> Result<SessionReport, SessionError> {
        let _guard = guard;
        let started = Instant::now();

        let terminated_early = {
            let mut stop_rx = self.shared.stop_rx.lock().await;
            tokio::select! {
                _ = stop_rx.recv() => true,
                _ = tokio::time::sleep(benchmark) => false,
            }
        };

        self.shared
            .state
            .send_replace(SessionState::Finalizing { id: id.clone() });
        info!(session.id = %id, terminated_early, "finalizing profiling session");

        let shared = Arc::clone(&self.shared);
        let artifacts = match tokio::task::spawn_blocking(move || shared.flush(captures)).await {
            Ok(Ok(artifacts)) => artifacts,
            Ok(Err(source)) => {
                error!(session.id = %id, "failed to write artifacts: {}", source);
                return Err(SessionError::Artifact { id, source });
            }
            Err(e) => {
                error!(session.id = %id, "artifact flush panicked: {}", e);
                return Err(SessionError::Panicked { id });
            }
        };

        let verb = if terminated_early {
            MarkerVerb::Term
        } else {
            MarkerVerb::Stop
        };
        match self.shared.marker.notify(verb, &id).await {
            Ok(output) => log_marker_output(&id, verb, &output),
            Err(e) => warn!(session.id = %id, session.verb = %verb, "marker notification failed: {}", e),
        }

        let elapsed = started.elapsed();
        info!(
            session.id = %id,
            session.verb = %verb,
            artifacts = artifacts.len(),
            elapsed_secs = elapsed.as_secs_f64(),
            "profiling session finished"
        );

        Ok(SessionReport {
            id,
            terminated_early,
            verb,
            artifacts,
            elapsed,
        })
    }
}

fn log_marker_output(id: &str, verb: MarkerVerb, output: &str) {
    let output = output.trim_end();
    if !output.is_empty() {
        info!(session.id = %id, session.verb = %verb, "marker: {}", output);
    }
}
