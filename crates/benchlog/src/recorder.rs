//! Per-request timing lines appended to an access log.
//!
//! A [`TimingRegion`] is taken when a request arrives and consumed when the
//! response is ready. Each region produces exactly one line, rendered from a
//! [`LogFormat`] template into a pooled buffer and appended under a lock.
//!
//! The default line is a JSON object:
//!
//! ```text
//! {"time":"2024-05-01T12:00:00.002500000+00:00","method":"GET","uri":"/ping","status":200,"response_time":0.002500000,"body_bytes":14}
//! ```
//!
//! `time` is taken when the region stops, not when it starts.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{Local, SecondsFormat};
use thiserror::Error;

use crate::pool::BufferPool;

/// Template producing one JSON object per line.
pub const DEFAULT_FORMAT: &str = "{\"time\":\"${time}\",\"method\":\"${method}\",\"uri\":\"${uri}\",\"status\":${status},\"response_time\":${response_time},\"body_bytes\":${body_bytes}}\n";

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to open access log {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to append to access log {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unknown log format tag `${{{0}}}`")]
    UnknownTag(String),

    #[error("unterminated tag at offset {offset} in log format")]
    Unterminated { offset: usize },

    #[error("failed to encode log field: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Time,
    Method,
    Uri,
    Status,
    ResponseTime,
    BodyBytes,
}

impl Tag {
    fn from_name(name: &str) -> Option<Tag> {
        match name {
            "time" => Some(Tag::Time),
            "method" => Some(Tag::Method),
            "uri" => Some(Tag::Uri),
            "status" => Some(Tag::Status),
            "response_time" => Some(Tag::ResponseTime),
            "body_bytes" => Some(Tag::BodyBytes),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Tag(Tag),
}

/// A parsed `${tag}` line template.
///
/// Tags: `time`, `method`, `uri`, `status`, `response_time`, `body_bytes`.
/// String tags are JSON-escaped without surrounding quotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFormat {
    segments: Vec<Segment>,
}

impl LogFormat {
    pub fn parse(template: &str) -> Result<Self, RecorderError> {
        let mut segments = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find("${") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after.find('}').ok_or(RecorderError::Unterminated {
                offset: template.len() - rest.len() + open,
            })?;
            let name = &after[..close];
            let tag = Tag::from_name(name).ok_or_else(|| RecorderError::UnknownTag(name.to_string()))?;
            segments.push(Segment::Tag(tag));
            rest = &after[close + 1..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    fn render(&self, buf: &mut Vec<u8>, record: &Record<'_>) -> Result<(), RecorderError> {
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => buf.extend_from_slice(text.as_bytes()),
                Segment::Tag(Tag::Time) => write_escaped(buf, record.time)?,
                Segment::Tag(Tag::Method) => write_escaped(buf, record.method)?,
                Segment::Tag(Tag::Uri) => write_escaped(buf, record.uri)?,
                Segment::Tag(Tag::Status) => {
                    buf.extend_from_slice(record.status.to_string().as_bytes())
                }
                Segment::Tag(Tag::ResponseTime) => buf.extend_from_slice(
                    format!("{:.9}", record.response_time.as_secs_f64()).as_bytes(),
                ),
                Segment::Tag(Tag::BodyBytes) => {
                    buf.extend_from_slice(record.body_bytes.to_string().as_bytes())
                }
            }
        }
        Ok(())
    }
}

impl Default for LogFormat {
    fn default() -> Self {
        let lit = |s: &str| Segment::Literal(s.to_string());
        Self {
            segments: vec![
                lit("{\"time\":\""),
                Segment::Tag(Tag::Time),
                lit("\",\"method\":\""),
                Segment::Tag(Tag::Method),
                lit("\",\"uri\":\""),
                Segment::Tag(Tag::Uri),
                lit("\",\"status\":"),
                Segment::Tag(Tag::Status),
                lit(",\"response_time\":"),
                Segment::Tag(Tag::ResponseTime),
                lit(",\"body_bytes\":"),
                Segment::Tag(Tag::BodyBytes),
                lit("}\n"),
            ],
        }
    }
}

/// JSON-escape `s` into `buf` without the surrounding quotes.
fn write_escaped(buf: &mut Vec<u8>, s: &str) -> Result<(), RecorderError> {
    let start = buf.len();
    serde_json::to_writer(&mut *buf, s)?;
    buf.remove(start);
    buf.pop();
    Ok(())
}

struct Record<'a> {
    time: &'a str,
    method: &'a str,
    uri: &'a str,
    status: u16,
    response_time: Duration,
    body_bytes: u64,
}

#[derive(Debug)]
struct RecorderInner {
    path: PathBuf,
    format: LogFormat,
    pool: BufferPool,
    log: Mutex<File>,
}

/// Appends timing lines to an access log. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TimingRecorder {
    inner: Arc<RecorderInner>,
}

impl TimingRecorder {
    /// Open (or create) the log at `path` with [`DEFAULT_FORMAT`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        Self::open_with_format(path, LogFormat::default())
    }

    pub fn open_with_format(path: impl AsRef<Path>, format: LogFormat) -> Result<Self, RecorderError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| RecorderError::Open {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(open_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_err)?;

        Ok(Self {
            inner: Arc::new(RecorderInner {
                path,
                format,
                pool: BufferPool::new(),
                log: Mutex::new(file),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Begin timing a request.
    pub fn start(&self) -> TimingRegion {
        TimingRegion {
            recorder: self.clone(),
            start: Instant::now(),
        }
    }

    fn append(&self, record: &Record<'_>) -> Result<(), RecorderError> {
        let inner = &*self.inner;
        let mut buf = inner.pool.get();
        inner.format.render(&mut buf, record)?;

        let mut log = inner.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.write_all(&buf).map_err(|source| RecorderError::Write {
            path: inner.path.clone(),
            source,
        })
    }
}

/// One request being timed. Consumed by [`TimingRegion::stop`].
#[derive(Debug)]
pub struct TimingRegion {
    recorder: TimingRecorder,
    start: Instant,
}

impl TimingRegion {
    pub fn started_at(&self) -> Instant {
        self.start
    }

    /// Stop timing and append the request's line.
    pub fn stop(self, method: &str, uri: &str, status: u16, body_bytes: u64) -> Result<(), RecorderError> {
        self.stop_at(Instant::now(), method, uri, status, body_bytes)
    }

    /// Like [`TimingRegion::stop`], measuring up to `now`.
    pub fn stop_at(
        self,
        now: Instant,
        method: &str,
        uri: &str,
        status: u16,
        body_bytes: u64,
    ) -> Result<(), RecorderError> {
        let time = Local::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        self.recorder.append(&Record {
            time: &time,
            method,
            uri,
            status,
            response_time: now.saturating_duration_since(self.start),
            body_bytes,
        })
    }
}
