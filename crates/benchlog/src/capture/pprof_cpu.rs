//! Sampling CPU profiler producing pprof protobuf output.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use pprof::protos::Message;
use pprof::ProfilerGuard;
use tracing::info;

use super::{CaptureError, ContentionSampling, ProcfsBackend, ProcfsTrace, ProfileKind, ProfilingBackend};
use crate::artifacts::ArtifactFile;

/// CPU captures via `pprof`, everything else via [`ProcfsBackend`].
#[derive(Debug)]
pub struct PprofBackend {
    frequency: i32,
    procfs: ProcfsBackend,
}

impl PprofBackend {
    pub fn new(frequency: i32, trace_interval: Duration) -> Self {
        Self {
            frequency,
            procfs: ProcfsBackend::new(trace_interval),
        }
    }
}

pub struct PprofCpu {
    guard: ProfilerGuard<'static>,
    sink: ArtifactFile,
}

impl std::fmt::Debug for PprofCpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PprofCpu")
            .field("sink", &self.sink)
            .finish_non_exhaustive()
    }
}

fn profiler_error(e: pprof::Error) -> CaptureError {
    CaptureError::Profiler(e.to_string())
}

impl ProfilingBackend for PprofBackend {
    type Cpu = PprofCpu;
    type Trace = ProcfsTrace;

    fn set_contention_sampling(&self, mode: ContentionSampling) {
        self.procfs.set_contention_sampling(mode);
    }

    fn begin_cpu(&self, sink: ArtifactFile) -> Result<PprofCpu, CaptureError> {
        let guard = pprof::ProfilerGuardBuilder::default()
            .frequency(self.frequency)
            .blocklist(&["libc", "libgcc", "pthread", "vdso"])
            .build()
            .map_err(profiler_error)?;

        info!("cpu profiling started at {} Hz", self.frequency);
        Ok(PprofCpu { guard, sink })
    }

    fn end_cpu(&self, cpu: PprofCpu) -> Result<PathBuf, CaptureError> {
        let PprofCpu { guard, mut sink } = cpu;

        let report = guard.report().build().map_err(profiler_error)?;
        // Stop sampling before encoding
        drop(guard);

        let profile = report.pprof().map_err(profiler_error)?;
        let mut encoded = Vec::new();
        profile
            .encode(&mut encoded)
            .map_err(|e| CaptureError::Profiler(e.to_string()))?;

        sink.write_artifact(&encoded)?;
        sink.finish()
    }

    fn dump_profile(&self, kind: ProfileKind, out: &mut dyn Write) -> io::Result<()> {
        self.procfs.dump_profile(kind, out)
    }

    fn begin_trace(&self, sink: ArtifactFile) -> Result<ProcfsTrace, CaptureError> {
        self.procfs.begin_trace(sink)
    }

    fn end_trace(&self, trace: ProcfsTrace) -> Result<PathBuf, CaptureError> {
        self.procfs.end_trace(trace)
    }
}
