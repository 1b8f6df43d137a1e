//! Fakes shared by the integration tests.

#![allow(dead_code)]

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use async_trait::async_trait;
use benchlog::artifacts::ArtifactFile;
use benchlog::capture::CaptureError;
use benchlog::{
    ContentionSampling, CoordinatorConfig, Marker, MarkerError, MarkerVerb, ProfileKind,
    ProfilingBackend, SessionCoordinator,
};

/// Backend that writes placeholder artifacts and counts overlapping CPU captures.
#[derive(Debug, Default)]
pub struct FakeBackend {
    active_cpu: AtomicUsize,
    max_active_cpu: AtomicUsize,
    cpu_begun: AtomicUsize,
    contention: Mutex<Vec<ContentionSampling>>,
    pub fail_begin_cpu: AtomicBool,
    pub fail_dump: AtomicBool,
    pub panic_dump: AtomicBool,
    cpu_threads: Mutex<Vec<ThreadId>>,
}

impl FakeBackend {
    pub fn max_active_cpu(&self) -> usize {
        self.max_active_cpu.load(Ordering::SeqCst)
    }

    pub fn cpu_begun(&self) -> usize {
        self.cpu_begun.load(Ordering::SeqCst)
    }

    /// Threads that ran `begin_cpu`
    pub fn cpu_threads(&self) -> Vec<ThreadId> {
        self.cpu_threads.lock().unwrap().clone()
    }

    pub fn contention_calls(&self) -> Vec<ContentionSampling> {
        self.contention.lock().unwrap().clone()
    }
}

#[derive(Debug)]
pub struct FakeCapture {
    sink: ArtifactFile,
}

impl ProfilingBackend for FakeBackend {
    type Cpu = FakeCapture;
    type Trace = FakeCapture;

    fn set_contention_sampling(&self, mode: ContentionSampling) {
        self.contention.lock().unwrap().push(mode);
    }

    fn begin_cpu(&self, sink: ArtifactFile) -> Result<FakeCapture, CaptureError> {
        if self.fail_begin_cpu.load(Ordering::SeqCst) {
            return Err(CaptureError::Profiler("profiler busy".to_string()));
        }
        self.cpu_begun.fetch_add(1, Ordering::SeqCst);
        self.cpu_threads.lock().unwrap().push(std::thread::current().id());
        let active = self.active_cpu.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_cpu.fetch_max(active, Ordering::SeqCst);
        Ok(FakeCapture { sink })
    }

    fn end_cpu(&self, mut cpu: FakeCapture) -> Result<PathBuf, CaptureError> {
        self.active_cpu.fetch_sub(1, Ordering::SeqCst);
        cpu.sink.write_artifact(b"fake cpu\n")?;
        cpu.sink.finish()
    }

    fn dump_profile(&self, kind: ProfileKind, out: &mut dyn Write) -> io::Result<()> {
        if self.panic_dump.load(Ordering::SeqCst) {
            panic!("dump of {kind} exploded");
        }
        if self.fail_dump.load(Ordering::SeqCst) {
            return Err(io::Error::other("disk full"));
        }
        writeln!(out, "fake {kind}")
    }

    fn begin_trace(&self, sink: ArtifactFile) -> Result<FakeCapture, CaptureError> {
        Ok(FakeCapture { sink })
    }

    fn end_trace(&self, mut trace: FakeCapture) -> Result<PathBuf, CaptureError> {
        trace.sink.write_artifact(b"fake trace\n")?;
        trace.sink.finish()
    }
}

/// Marker that records every call and hands out `sess-N` ids.
#[derive(Debug, Default)]
pub struct RecordingMarker {
    calls: Mutex<Vec<(MarkerVerb, String)>>,
    issued: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    /// Milliseconds each `start` call takes
    pub start_delay_ms: AtomicU64,
}

impl RecordingMarker {
    pub fn calls(&self) -> Vec<(MarkerVerb, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Marker for RecordingMarker {
    async fn next_id(&self) -> Result<String, MarkerError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("sess-{n}"))
    }

    async fn notify(&self, verb: MarkerVerb, id: &str) -> Result<String, MarkerError> {
        self.calls.lock().unwrap().push((verb, id.to_string()));
        let delay = self.start_delay_ms.load(Ordering::SeqCst);
        if verb == MarkerVerb::Start && delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        match verb {
            MarkerVerb::Start if self.fail_start.load(Ordering::SeqCst) => {
                Err(MarkerError::Io(io::Error::other("logger exploded")))
            }
            MarkerVerb::Stop | MarkerVerb::Term if self.fail_stop.load(Ordering::SeqCst) => {
                Err(MarkerError::Io(io::Error::other("logger gone")))
            }
            _ => Ok(format!("{verb} {id}\n")),
        }
    }
}

pub fn test_config(artifact_dir: &Path) -> CoordinatorConfig {
    CoordinatorConfig {
        preempt_backoff: Duration::from_millis(2),
        preempt_backoff_max: Duration::from_millis(20),
        ..CoordinatorConfig::new(artifact_dir)
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub marker: Arc<RecordingMarker>,
    pub coordinator: SessionCoordinator<FakeBackend>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut CoordinatorConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir.path().join("prof"));
        adjust(&mut config);

        let marker = Arc::new(RecordingMarker::default());
        let coordinator = SessionCoordinator::new(FakeBackend::default(), marker.clone(), config);
        Self {
            dir,
            marker,
            coordinator,
        }
    }

    pub fn artifact(&self, name: &str) -> PathBuf {
        self.dir.path().join("prof").join(name)
    }

    pub fn backend(&self) -> &FakeBackend {
        self.coordinator.backend()
    }
}
