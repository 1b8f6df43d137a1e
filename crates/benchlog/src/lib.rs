//! benchlog - profiling sessions and access timing for services under load
//!
//! Two independent pieces share this crate:
//!
//! - [`session::SessionCoordinator`] runs at most one profiling session at a
//!   time, preempting the running one when a new start arrives, and writes
//!   the session's artifacts when it ends.
//! - [`recorder::TimingRecorder`] appends one line per request to an access
//!   log; [`middleware::record_timing`] wires it into axum.

pub mod artifacts;
pub mod capture;
pub mod marker;
pub mod middleware;
pub mod pool;
pub mod recorder;
pub mod session;
pub mod web;

pub use capture::{ContentionSampling, ProcfsBackend, ProfileKind, ProfilingBackend};
pub use marker::{Marker, MarkerError, MarkerVerb, ShellMarker};
pub use recorder::{LogFormat, RecorderError, TimingRecorder, TimingRegion};
pub use session::{
    CoordinatorConfig, SessionCoordinator, SessionError, SessionHandle, SessionReport,
    SessionState,
};
