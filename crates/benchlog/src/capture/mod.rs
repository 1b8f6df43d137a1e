//! Profiling capability used by the session coordinator.
//!
//! The coordinator only knows how to begin and end captures; what a capture
//! actually records is up to the backend. [`ProcfsBackend`] works anywhere
//! `/proc` exists, and with the `pprof` feature [`PprofBackend`] replaces the
//! CPU capture with a sampling profiler.

mod procfs;
#[cfg(feature = "pprof")]
mod pprof_cpu;

pub use procfs::{ProcfsBackend, ProcfsCpu, ProcfsTrace};
#[cfg(feature = "pprof")]
pub use pprof_cpu::{PprofBackend, PprofCpu};

use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

use crate::artifacts::ArtifactFile;

/// Artifact written by the CPU capture.
pub const CPU_ARTIFACT: &str = "cpu.prof";

/// Artifact written by the execution trace, when enabled.
pub const TRACE_ARTIFACT: &str = "trace.prof";

/// Point-in-time profiles dumped on finalize, one file each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileKind {
    /// Every live thread of execution
    Goroutine,
    Heap,
    /// Threads created so far
    ThreadCreate,
    /// Blocking waits
    Block,
    /// Lock contention
    Mutex,
}

impl ProfileKind {
    /// Dump order on finalize.
    pub const ALL: [ProfileKind; 5] = [
        ProfileKind::Goroutine,
        ProfileKind::Heap,
        ProfileKind::ThreadCreate,
        ProfileKind::Block,
        ProfileKind::Mutex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileKind::Goroutine => "goroutine",
            ProfileKind::Heap => "heap",
            ProfileKind::ThreadCreate => "threadcreate",
            ProfileKind::Block => "block",
            ProfileKind::Mutex => "mutex",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.prof", self.as_str())
    }

    /// Whether this kind only has data while contention sampling is on.
    pub fn is_contention(&self) -> bool {
        matches!(self, ProfileKind::Block | ProfileKind::Mutex)
    }
}

impl std::fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Process-wide contention sampling granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentionSampling {
    Off,
    /// Record every event
    Max,
}

impl From<bool> for ContentionSampling {
    fn from(enabled: bool) -> Self {
        if enabled {
            ContentionSampling::Max
        } else {
            ContentionSampling::Off
        }
    }
}

/// Errors from beginning, ending, or persisting a capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to create artifact directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to create artifact {path}: {source}")]
    Create { path: PathBuf, source: io::Error },

    #[error("failed to write artifact {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to flush artifact {path}: {source}")]
    Flush { path: PathBuf, source: io::Error },

    #[error("profiler error: {0}")]
    Profiler(String),
}

/// Begin/end capture of CPU, point-in-time profiles, and execution traces.
///
/// Handles returned by `begin_*` own their artifact file and must stop
/// capturing when dropped, so an abandoned session never leaves a capture
/// running.
pub trait ProfilingBackend: Send + Sync + 'static {
    /// In-flight CPU capture.
    type Cpu: Send + 'static;
    /// In-flight execution trace.
    type Trace: Send + 'static;

    /// Apply the contention sampling mode. Called on every session start
    /// with the same configured value.
    fn set_contention_sampling(&self, mode: ContentionSampling);

    fn begin_cpu(&self, sink: ArtifactFile) -> Result<Self::Cpu, CaptureError>;

    /// Stop the CPU capture and flush its artifact, returning the artifact path.
    fn end_cpu(&self, cpu: Self::Cpu) -> Result<PathBuf, CaptureError>;

    /// Reclaim garbage so the heap dump is representative. No-op by default.
    fn collect_garbage(&self) {}

    /// Write a point-in-time profile of `kind`.
    fn dump_profile(&self, kind: ProfileKind, out: &mut dyn Write) -> io::Result<()>;

    fn begin_trace(&self, sink: ArtifactFile) -> Result<Self::Trace, CaptureError>;

    /// Stop the trace and flush its artifact, returning the artifact path.
    fn end_trace(&self, trace: Self::Trace) -> Result<PathBuf, CaptureError>;
}
