use log::{error, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::OpenOptions,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::error::ScanError;

/// On-disk layout of a finished journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalFormat {
    /// One JSON object per line, appended as the run progresses
    Lines,
    /// Rewritten into a pretty-printed JSON array when the journal is finalized
    JsonArray,
}

impl JournalFormat {
    fn extension(self) -> &'static str {
        match self {
            JournalFormat::Lines => "jsonl",
            JournalFormat::JsonArray => "json",
        }
    }
}

/// Buffered journal of serializable run records
///
/// Entries are kept in memory until `capacity` is reached and then appended as JSON lines.
/// A transient write failure keeps the entries buffered; only `max_flush_failures`
/// consecutive failures turn into an error.
#[derive(Debug)]
pub struct RunJournal<T>
where
    T: Serialize + DeserializeOwned,
{
    pending: Vec<T>,
    capacity: usize,
    path: PathBuf,
    format: JournalFormat,
    written: usize,
    flush_failures: usize,
    max_flush_failures: usize,
}

impl<T> RunJournal<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new<P: Into<PathBuf>>(path: P, capacity: usize, format: JournalFormat) -> Self {
        let mut path = path.into();
        if path.extension().and_then(|e| e.to_str()) != Some(format.extension()) {
            path.set_extension(format.extension());
        }

        Self {
            pending: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            path,
            format,
            written: 0,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries successfully written to disk so far
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn record(&mut self, entry: T) -> Result<(), ScanError> {
        self.pending.push(entry);
        if self.pending.len() >= self.capacity {
            self.flush()?;
        }
        Ok(())
    }

    fn append_pending(&self) -> Result<(), ScanError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| ScanError::Io {
                source,
                context: format!("Could not open journal at {:?}", self.path),
            })?;

        let mut writer = BufWriter::new(file);
        for entry in &self.pending {
            serde_json::to_writer(&mut writer, entry)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), ScanError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        match self.append_pending() {
            Ok(()) => {
                self.written += self.pending.len();
                self.pending.clear();
                self.flush_failures = 0;
                info!("Journal flushed to {:?}", self.path);
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                error!(
                    "Journal flush failure {}/{}: {}",
                    self.flush_failures, self.max_flush_failures, e
                );
                if self.flush_failures % 3 == 0 {
                    warn!(
                        "Journal keeps failing to flush, {} entries buffered",
                        self.pending.len()
                    );
                }
                if self.flush_failures >= self.max_flush_failures {
                    return Err(ScanError::Io {
                        source: std::io::Error::other(e.to_string()),
                        context: format!(
                            "{} consecutive flush failures for {:?}",
                            self.flush_failures, self.path
                        ),
                    });
                }
                // A scan in progress is not failed over its journal
                Ok(())
            }
        }
    }

    /// Flush and, for `JsonArray` journals, rewrite the file as one JSON array
    pub fn finalize(&mut self) -> Result<(), ScanError> {
        self.flush()?;
        if self.format != JournalFormat::JsonArray || !self.path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|source| ScanError::Io {
            source,
            context: format!("Could not read journal at {:?}", self.path),
        })?;

        // Skip files that were already converted
        if content.trim_start().starts_with('[') {
            return Ok(());
        }

        let entries = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<T>(line))
            .collect::<Result<Vec<_>, _>>()?;

        std::fs::write(&self.path, serde_json::to_string_pretty(&entries)?).map_err(
            |source| ScanError::Io {
                source,
                context: format!("Could not write journal at {:?}", self.path),
            },
        )?;

        info!("Journal finalized with {} entries", entries.len());
        Ok(())
    }
}

impl<T> Drop for RunJournal<T>
where
    T: Serialize + DeserializeOwned,
{
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            warn!("Journal could not be finalized: {e}");
        }
    }
}
