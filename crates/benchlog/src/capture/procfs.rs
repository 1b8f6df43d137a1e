//! Capture backed by `/proc/self`.
//!
//! - CPU: per-thread user/system scheduler ticks accumulated during the session
//! - goroutine: every live thread with its scheduler state
//! - heap: the memory lines of `status`
//! - threadcreate: thread count, grouped by thread name
//! - block / mutex: per-thread voluntary / involuntary context switches
//! - trace: a sampler thread recording every thread's state at a fixed interval
//!
//! When `/proc` can't be read the artifact says so instead of failing; only
//! failures to write the artifact itself are errors.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::debug;

use super::{CaptureError, ContentionSampling, ProfileKind, ProfilingBackend};
use crate::artifacts::ArtifactFile;

/// Profiling backend reading the process's own `/proc` entries.
#[derive(Debug)]
pub struct ProcfsBackend {
    proc_self: PathBuf,
    contention: AtomicBool,
    trace_interval: Duration,
}

impl ProcfsBackend {
    pub fn new(trace_interval: Duration) -> Self {
        Self::with_root("/proc/self", trace_interval)
    }

    /// Read from `root` instead of `/proc/self`.
    pub fn with_root(root: impl Into<PathBuf>, trace_interval: Duration) -> Self {
        Self {
            proc_self: root.into(),
            contention: AtomicBool::new(false),
            trace_interval,
        }
    }

    fn contention_enabled(&self) -> bool {
        self.contention.load(Ordering::Relaxed)
    }

    fn write_threads(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "# threads: tid name state")?;
        match read_threads(&self.proc_self) {
            Ok(threads) => {
                for t in threads {
                    writeln!(out, "{}\t{}\t{}", t.tid, t.name, t.state)?;
                }
                Ok(())
            }
            Err(e) => unavailable(out, &e),
        }
    }

    fn write_heap(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "# heap: process memory from status")?;
        match fs::read_to_string(self.proc_self.join("status")) {
            Ok(status) => {
                for line in status.lines().filter(|l| is_memory_line(l)) {
                    writeln!(out, "{line}")?;
                }
                Ok(())
            }
            Err(e) => unavailable(out, &e),
        }
    }

    fn write_thread_create(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "# threadcreate: live threads by name")?;
        match read_threads(&self.proc_self) {
            Ok(threads) => {
                writeln!(out, "threads: {}", threads.len())?;
                let mut by_name: BTreeMap<&str, usize> = BTreeMap::new();
                for t in &threads {
                    *by_name.entry(t.name.as_str()).or_default() += 1;
                }
                for (name, count) in by_name {
                    writeln!(out, "{count}\t{name}")?;
                }
                Ok(())
            }
            Err(e) => unavailable(out, &e),
        }
    }

    fn write_context_switches(&self, kind: ProfileKind, out: &mut dyn Write) -> io::Result<()> {
        let key = match kind {
            ProfileKind::Block => "voluntary_ctxt_switches",
            _ => "nonvoluntary_ctxt_switches",
        };
        writeln!(out, "# {kind}: per-thread {key}")?;

        if !self.contention_enabled() {
            return writeln!(out, "# contention sampling disabled");
        }

        let threads = match read_threads(&self.proc_self) {
            Ok(threads) => threads,
            Err(e) => return unavailable(out, &e),
        };

        let mut rows: Vec<(u64, &ThreadStat)> = threads
            .iter()
            .filter_map(|t| {
                let status = fs::read_to_string(task_dir(&self.proc_self, t.tid).join("status")).ok()?;
                let switches = status_value(&status, key)?.parse().ok()?;
                Some((switches, t))
            })
            .collect();
        rows.sort_by(|a, b| b.0.cmp(&a.0));

        for (switches, t) in rows {
            writeln!(out, "{switches}\t{}\t{}", t.tid, t.name)?;
        }
        Ok(())
    }
}

impl Default for ProcfsBackend {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

/// In-flight CPU capture: the tick baseline taken at session start.
#[derive(Debug)]
pub struct ProcfsCpu {
    sink: ArtifactFile,
    started: Instant,
    baseline: HashMap<u32, (u64, u64)>,
}

/// In-flight execution trace. Dropping it stops the sampler.
#[derive(Debug)]
pub struct ProcfsTrace {
    stop: mpsc::Sender<()>,
    sampler: JoinHandle<Result<ArtifactFile, CaptureError>>,
}

impl ProfilingBackend for ProcfsBackend {
    type Cpu = ProcfsCpu;
    type Trace = ProcfsTrace;

    fn set_contention_sampling(&self, mode: ContentionSampling) {
        self.contention
            .store(mode == ContentionSampling::Max, Ordering::Relaxed);
    }

    fn begin_cpu(&self, sink: ArtifactFile) -> Result<ProcfsCpu, CaptureError> {
        let baseline = match read_threads(&self.proc_self) {
            Ok(threads) => threads
                .into_iter()
                .map(|t| (t.tid, (t.user_ticks, t.system_ticks)))
                .collect(),
            Err(e) => {
                debug!("no cpu baseline from {}: {}", self.proc_self.display(), e);
                HashMap::new()
            }
        };

        Ok(ProcfsCpu {
            sink,
            started: Instant::now(),
            baseline,
        })
    }

    fn end_cpu(&self, cpu: ProcfsCpu) -> Result<PathBuf, CaptureError> {
        let ProcfsCpu {
            mut sink,
            started,
            baseline,
        } = cpu;

        let mut report = String::new();
        report.push_str("# cpu: per-thread scheduler ticks (USER_HZ) during the session\n");
        report.push_str(&format!(
            "# duration_secs: {:.6}\n",
            started.elapsed().as_secs_f64()
        ));
        report.push_str("# user\tsystem\ttid\tname\n");

        match read_threads(&self.proc_self) {
            Ok(threads) => {
                let mut rows: Vec<(u64, u64, ThreadStat)> = threads
                    .into_iter()
                    .map(|t| {
                        // Threads spawned mid-session have no baseline and count in full
                        let (user0, sys0) = baseline.get(&t.tid).copied().unwrap_or((0, 0));
                        (
                            t.user_ticks.saturating_sub(user0),
                            t.system_ticks.saturating_sub(sys0),
                            t,
                        )
                    })
                    .collect();
                rows.sort_by(|a, b| (b.0 + b.1).cmp(&(a.0 + a.1)));

                for (user, system, t) in rows {
                    report.push_str(&format!("{user}\t{system}\t{}\t{}\n", t.tid, t.name));
                }
            }
            Err(e) => report.push_str(&format!("# unavailable: {e}\n")),
        }

        sink.write_artifact(report.as_bytes())?;
        sink.finish()
    }

    fn dump_profile(&self, kind: ProfileKind, out: &mut dyn Write) -> io::Result<()> {
        match kind {
            ProfileKind::Goroutine => self.write_threads(out),
            ProfileKind::Heap => self.write_heap(out),
            ProfileKind::ThreadCreate => self.write_thread_create(out),
            ProfileKind::Block | ProfileKind::Mutex => self.write_context_switches(kind, out),
        }
    }

    fn begin_trace(&self, sink: ArtifactFile) -> Result<ProcfsTrace, CaptureError> {
        let (stop, stop_rx) = mpsc::channel();
        let root = self.proc_self.clone();
        let interval = self.trace_interval;

        let sampler = std::thread::Builder::new()
            .name("benchlog-trace".to_string())
            .spawn(move || sample_trace(&root, interval, &stop_rx, sink))
            .map_err(|e| CaptureError::Profiler(format!("failed to spawn trace sampler: {e}")))?;

        Ok(ProcfsTrace { stop, sampler })
    }

    fn end_trace(&self, trace: ProcfsTrace) -> Result<PathBuf, CaptureError> {
        let ProcfsTrace { stop, sampler } = trace;
        // The sampler may have already exited on a write error
        let _ = stop.send(());

        let sink = sampler
            .join()
            .map_err(|_| CaptureError::Profiler("trace sampler panicked".to_string()))??;
        sink.finish()
    }
}

fn sample_trace(
    root: &Path,
    interval: Duration,
    stop: &mpsc::Receiver<()>,
    mut sink: ArtifactFile,
) -> Result<ArtifactFile, CaptureError> {
    let started = Instant::now();
    sink.write_artifact(b"# trace: elapsed_us then tid:state for every thread\n")?;

    loop {
        let elapsed = started.elapsed().as_micros();
        let line = match read_threads(root) {
            Ok(threads) => {
                let states: Vec<String> = threads
                    .iter()
                    .map(|t| format!("{}:{}", t.tid, t.state))
                    .collect();
                format!("{elapsed}\t{}\n", states.join(" "))
            }
            Err(e) => format!("{elapsed}\tunavailable: {e}\n"),
        };
        sink.write_artifact(line.as_bytes())?;

        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(sink)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ThreadStat {
    tid: u32,
    name: String,
    state: char,
    user_ticks: u64,
    system_ticks: u64,
}

/// Parse a `task/<tid>/stat` line. The name may itself contain spaces and parens.
fn parse_stat(line: &str) -> Option<ThreadStat> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    let tid = line[..open].trim().parse().ok()?;
    let name = line.get(open + 1..close)?.to_string();

    // fields[0] is field 3 (state); utime and stime are fields 14 and 15
    let fields: Vec<&str> = line.get(close + 1..)?.split_whitespace().collect();
    let state = fields.first()?.chars().next()?;
    let user_ticks = fields.get(11)?.parse().ok()?;
    let system_ticks = fields.get(12)?.parse().ok()?;

    Some(ThreadStat {
        tid,
        name,
        state,
        user_ticks,
        system_ticks,
    })
}

fn task_dir(proc_self: &Path, tid: u32) -> PathBuf {
    proc_self.join("task").join(tid.to_string())
}

fn read_threads(proc_self: &Path) -> io::Result<Vec<ThreadStat>> {
    let mut threads = Vec::new();
    for entry in fs::read_dir(proc_self.join("task"))? {
        let entry = entry?;
        // Threads can exit between listing and reading
        let Ok(line) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(stat) = parse_stat(&line) {
            threads.push(stat);
        }
    }
    threads.sort_by_key(|t| t.tid);
    Ok(threads)
}

fn status_value<'a>(status: &'a str, key: &str) -> Option<&'a str> {
    status.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k == key).then(|| v.trim())
    })
}

fn is_memory_line(line: &str) -> bool {
    line.starts_with("Vm") || line.starts_with("Rss") || line.starts_with("HugetlbPages")
}

fn unavailable(out: &mut dyn Write, err: &io::Error) -> io::Result<()> {
    writeln!(out, "# unavailable: {err}")
}
