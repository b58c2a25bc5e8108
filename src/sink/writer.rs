use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::report::Report;

/// Appends reports to a text file, flushing after each one.
pub struct FileWriter {
    path: PathBuf,
    file: File,
}

impl FileWriter {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening report file {}", path.display()))?;

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&mut self, report: &Report) -> Result<()> {
        write!(self.file, "{report}")
            .and_then(|()| self.file.flush())
            .with_context(|| format!("writing report to {}", self.path.display()))
    }
}

/// Report destination.
///
/// Enum dispatch keeps the writer set closed and avoids boxing.
pub enum ReportWriter {
    File(FileWriter),
    Stdout,
}

impl ReportWriter {
    pub fn file(path: impl AsRef<Path>) -> Result<Self> {
        FileWriter::open(path).map(Self::File)
    }

    /// Returns the writer name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::File(_) => "file",
            Self::Stdout => "stdout",
        }
    }

    /// Write one report, separator included.
    pub fn write(&mut self, report: &Report) -> Result<()> {
        match self {
            Self::File(w) => w.write(report),
            Self::Stdout => {
                let mut out = io::stdout().lock();
                write!(out, "{report}")
                    .and_then(|()| out.flush())
                    .context("writing report to stdout")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::report::SEPARATOR;

    fn report(bytes: u64) -> Report {
        Report {
            bytes,
            utilization_percent: 1.0,
            completions: 2,
            average_queue_depth: None,
            elapsed_ns: 5_000_000_000,
        }
    }

    #[test]
    fn test_file_writer_appends_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blkwatch.log");
        std::fs::write(&path, "previous run\n").unwrap();

        let mut writer = ReportWriter::file(&path).unwrap();
        assert_eq!(writer.name(), "file");
        writer.write(&report(10)).unwrap();

        // Visible before the writer is dropped.
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("previous run\n"));
        assert!(text.contains("Accumulated bytes: 10 bytes"));

        writer.write(&report(20)).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches(SEPARATOR).count(), 2);
        assert!(text.contains("Accumulated bytes: 20 bytes"));
    }

    #[test]
    fn test_open_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("blkwatch.log");
        let err = ReportWriter::file(&path).err().unwrap();
        assert!(err.to_string().contains("opening report file"));
    }
}
