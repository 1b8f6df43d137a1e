//! Artifact files under the configured output directory.
//!
//! Layout:
//! ```text
//! {output_dir}/
//! ├── cpu.prof
//! ├── trace.prof          # only with tracing enabled
//! ├── goroutine.prof
//! ├── heap.prof
//! ├── threadcreate.prof
//! ├── block.prof
//! └── mutex.prof
//! ```
//!
//! Each session overwrites the previous session's files.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::capture::CaptureError;

/// Directory that receives a session's artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    root: PathBuf,
}

impl ArtifactDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory (and parents) if missing.
    pub fn ensure(&self) -> Result<(), CaptureError> {
        fs::create_dir_all(&self.root).map_err(|source| CaptureError::CreateDir {
            path: self.root.clone(),
            source,
        })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Create (truncating) the artifact `name`.
    pub fn create(&self, name: &str) -> Result<ArtifactFile, CaptureError> {
        let path = self.path(name);
        let file = File::create(&path).map_err(|source| CaptureError::Create {
            path: path.clone(),
            source,
        })?;

        Ok(ArtifactFile {
            path,
            writer: BufWriter::new(file),
        })
    }
}

/// A buffered artifact being written. Call [`ArtifactFile::finish`] to make it durable.
#[derive(Debug)]
pub struct ArtifactFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ArtifactFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `bytes`, attributing failures to this artifact.
    pub fn write_artifact(&mut self, bytes: &[u8]) -> Result<(), CaptureError> {
        self.writer
            .write_all(bytes)
            .map_err(|source| CaptureError::Write {
                path: self.path.clone(),
                source,
            })
    }

    /// Flush buffered data and sync the file to disk.
    pub fn finish(self) -> Result<PathBuf, CaptureError> {
        let ArtifactFile { path, writer } = self;
        let file = writer.into_inner().map_err(|e| CaptureError::Flush {
            path: path.clone(),
            source: e.into_error(),
        })?;
        file.sync_all().map_err(|source| CaptureError::Flush {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

impl Write for ArtifactFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_finish() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactDir::new(dir.path().join("nested/prof"));
        artifacts.ensure().unwrap();

        let mut file = artifacts.create("heap.prof").unwrap();
        file.write_artifact(b"VmRSS: 1 kB\n").unwrap();
        let path = file.finish().unwrap();

        assert_eq!(path, dir.path().join("nested/prof/heap.prof"));
        assert_eq!(fs::read_to_string(path).unwrap(), "VmRSS: 1 kB\n");
    }

    #[test]
    fn test_create_truncates_previous_session() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactDir::new(dir.path());

        let mut first = artifacts.create("cpu.prof").unwrap();
        first.write_artifact(b"a much longer first session\n").unwrap();
        first.finish().unwrap();

        let mut second = artifacts.create("cpu.prof").unwrap();
        second.write_artifact(b"second\n").unwrap();
        second.finish().unwrap();

        assert_eq!(
            fs::read_to_string(artifacts.path("cpu.prof")).unwrap(),
            "second\n"
        );
    }

    #[test]
    fn test_create_in_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactDir::new(dir.path().join("does-not-exist"));

        let err = artifacts.create("cpu.prof").unwrap_err();
        assert!(matches!(err, CaptureError::Create { .. }));
    }
}
