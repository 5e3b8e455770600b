use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use csv::{ErrorKind, StringRecord};
use tracing::{debug, warn};

use crate::error::{LinkageError, Phase, Result};
use crate::record::{Record, Schema};

/// One bounded batch of rows sharing the file's schema.
#[derive(Clone, Debug)]
pub struct RecordChunk {
    /// Zero-based chunk number within the stream.
    pub index: usize,
    pub schema: Arc<Schema>,
    pub records: Vec<Record>,
}

impl RecordChunk {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Counters kept while streaming a file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub rows_read: usize,
    pub rows_skipped: usize,
    pub chunks: usize,
}

/// Lazy, finite, non-restartable chunked reader over a CSV file with a header.
///
/// Cells are never coerced: every value stays the exact string found in the
/// file. Rows with the wrong number of cells or invalid UTF-8 are logged and
/// skipped; I/O failures end the stream with an error.
pub struct RecordStream {
    path: PathBuf,
    phase: Phase,
    reader: csv::Reader<File>,
    schema: Arc<Schema>,
    chunk_size: usize,
    buffer: StringRecord,
    stats: StreamStats,
    finished: bool,
}

impl RecordStream {
    /// Open `path` and read its header.
    ///
    /// `phase` is only used to label errors.
    pub fn open(path: impl AsRef<Path>, chunk_size: usize, phase: Phase) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if chunk_size == 0 {
            return Err(LinkageError::Config("chunk size must be positive".into()));
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_path(&path)
            .map_err(|source| LinkageError::DataAccess {
                phase,
                path: path.clone(),
                source,
            })?;

        let columns: Vec<String> = reader
            .headers()
            .map_err(|source| LinkageError::DataAccess {
                phase,
                path: path.clone(),
                source,
            })?
            .iter()
            .map(str::to_string)
            .collect();

        debug!(path = %path.display(), columns = columns.len(), chunk_size, "opened record stream");

        Ok(Self {
            path,
            phase,
            reader,
            schema: Arc::new(Schema::new(columns)),
            chunk_size,
            buffer: StringRecord::new(),
            stats: StreamStats::default(),
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Drain the remaining chunks into one vector of records.
    pub fn read_all(mut self) -> Result<(Vec<Record>, StreamStats)> {
        let mut records = Vec::new();
        for chunk in self.by_ref() {
            records.extend(chunk?.records);
        }
        Ok((records, self.stats))
    }

    fn next_chunk(&mut self) -> Result<Option<RecordChunk>> {
        let mut records = Vec::with_capacity(self.chunk_size.min(1 << 16));

        while records.len() < self.chunk_size {
            match self.reader.read_record(&mut self.buffer) {
                Ok(true) => {
                    self.stats.rows_read += 1;
                    let values = self.buffer.iter().map(str::to_string).collect();
                    records.push(Record::new(Arc::clone(&self.schema), values));
                }
                Ok(false) => {
                    self.finished = true;
                    break;
                }
                Err(err) if is_row_local(&err) => {
                    self.stats.rows_skipped += 1;
                    let line = err.position().map(|pos| pos.line());
                    warn!(path = %self.path.display(), line, error = %err, "skipping malformed row");
                }
                Err(source) => {
                    self.finished = true;
                    return Err(LinkageError::DataAccess {
                        phase: self.phase,
                        path: self.path.clone(),
                        source,
                    });
                }
            }
        }

        if records.is_empty() {
            return Ok(None);
        }

        let index = self.stats.chunks;
        self.stats.chunks += 1;
        Ok(Some(RecordChunk {
            index,
            schema: Arc::clone(&self.schema),
            records,
        }))
    }
}

impl Iterator for RecordStream {
    type Item = Result<RecordChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        self.next_chunk().transpose()
    }
}

/// Errors confined to a single row.
fn is_row_local(err: &csv::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::UnequalLengths { .. } | ErrorKind::Utf8 { .. }
    )
}
