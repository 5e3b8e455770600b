//! Incremental backup of scored ground-truth pairs.
//!
//! The backup file has exactly one owner: a writer thread fed by a bounded
//! channel. Workers never touch the file; they send one batch per chunk and
//! the writer appends it as a single multi-row write followed by a flush.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info};

use crate::error::{LinkageError, Phase, Result};
use crate::truth::IdentityTuple;

const BACKUP_QUEUE: usize = 64;

/// One scored pair as persisted in the backup file.
#[derive(Clone, Debug, PartialEq)]
pub struct BackupRow {
    pub identity: IdentityTuple,
    pub score: f64,
    pub predicted: bool,
    pub actual: bool,
}

impl BackupRow {
    /// Header of the backup file.
    pub fn header() -> Vec<String> {
        let mut header = IdentityTuple::column_names();
        header.extend(["score", "predicted", "match"].map(str::to_string));
        header
    }

    fn to_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.identity.values().to_vec();
        fields.push(format!("{:.6}", self.score));
        fields.push(flag(self.predicted).to_string());
        fields.push(flag(self.actual).to_string());
        fields
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// Cloneable sending side handed to workers.
#[derive(Clone, Debug)]
pub struct BackupHandle {
    sender: Sender<Vec<BackupRow>>,
}

impl BackupHandle {
    /// Queue a batch; blocks while the writer is behind.
    pub fn send(&self, rows: Vec<BackupRow>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.sender.send(rows).map_err(|_| LinkageError::Worker {
            phase: Phase::Backup,
            reason: "backup writer stopped".to_string(),
        })
    }
}

/// Owner of the backup writer thread.
pub struct BackupSink {
    path: PathBuf,
    sender: Option<Sender<Vec<BackupRow>>>,
    writer: Option<JoinHandle<Result<usize>>>,
}

impl BackupSink {
    /// Open `path` for appending and start the writer thread.
    ///
    /// An existing file is kept and appended to; the header is written only
    /// when the file is empty.
    pub fn spawn(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let write_error = |source: csv::Error| LinkageError::Write {
            phase: Phase::Backup,
            path: path.clone(),
            source,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| write_error(err.into()))?;
        let is_empty = file
            .metadata()
            .map_err(|err| write_error(err.into()))?
            .len()
            == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if is_empty {
            writer
                .write_record(BackupRow::header())
                .and_then(|()| writer.flush().map_err(csv::Error::from))
                .map_err(write_error)?;
        }

        let (sender, receiver) = bounded(BACKUP_QUEUE);
        let thread_path = path.clone();
        let handle = thread::Builder::new()
            .name("linkage-backup".to_string())
            .spawn(move || drain(writer, receiver, thread_path))
            .map_err(|err| LinkageError::Worker {
                phase: Phase::Backup,
                reason: format!("cannot start backup writer: {err}"),
            })?;

        debug!(path = %path.display(), append = !is_empty, "backup sink started");
        Ok(Self {
            path,
            sender: Some(sender),
            writer: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A new sending handle.
    pub fn handle(&self) -> Option<BackupHandle> {
        self.sender.clone().map(|sender| BackupHandle { sender })
    }

    /// Close the queue, wait for pending batches, and return rows written.
    pub fn finish(mut self) -> Result<usize> {
        self.close()
    }

    fn close(&mut self) -> Result<usize> {
        self.sender.take();
        let Some(writer) = self.writer.take() else {
            return Ok(0);
        };
        let written = writer.join().map_err(|_| LinkageError::Worker {
            phase: Phase::Backup,
            reason: "backup writer panicked".to_string(),
        })??;
        info!(path = %self.path.display(), rows = written, "backup closed");
        Ok(written)
    }
}

impl Drop for BackupSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn drain(
    mut writer: csv::Writer<std::fs::File>,
    receiver: Receiver<Vec<BackupRow>>,
    path: PathBuf,
) -> Result<usize> {
    let mut written = 0usize;
    for batch in receiver {
        for row in &batch {
            writer
                .write_record(row.to_fields())
                .map_err(|source| LinkageError::Write {
                    phase: Phase::Backup,
                    path: path.clone(),
                    source,
                })?;
        }
        writer.flush().map_err(|err| LinkageError::Write {
            phase: Phase::Backup,
            path: path.clone(),
            source: err.into(),
        })?;
        written += batch.len();
    }
    Ok(written)
}
