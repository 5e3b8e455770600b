use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Pipeline phase an error was raised in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Reading datasets, candidate files or ground truth.
    Load,
    /// Building block indices and emitting candidate pairs.
    Block,
    /// Scoring candidate pairs.
    Score,
    /// Merging worker results into final metrics.
    Aggregate,
    /// Writing the incremental backup file.
    Backup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Load => "load",
            Phase::Block => "block",
            Phase::Score => "score",
            Phase::Aggregate => "aggregate",
            Phase::Backup => "backup",
        };
        f.write_str(name)
    }
}

/// Fatal errors surfaced by the linkage pipeline.
///
/// Per-row and per-field problems never show up here: malformed rows are
/// skipped and counted, absent fields score zero.
#[derive(Debug, Error)]
pub enum LinkageError {
    #[error("{phase} phase failed: cannot read '{}': {source}", path.display())]
    DataAccess {
        phase: Phase,
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{phase} phase failed: '{}' has no '{column}' column", path.display())]
    MissingColumn {
        phase: Phase,
        path: PathBuf,
        column: String,
    },
    #[error("{phase} phase failed: cannot write '{}': {source}", path.display())]
    Write {
        phase: Phase,
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{phase} phase interrupted by operator")]
    Interrupted { phase: Phase },
    #[error("{phase} phase failed: {reason}")]
    Worker { phase: Phase, reason: String },
    #[error("configuration error: {0}")]
    Config(String),
}

impl LinkageError {
    /// Phase the error belongs to, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            LinkageError::DataAccess { phase, .. }
            | LinkageError::MissingColumn { phase, .. }
            | LinkageError::Write { phase, .. }
            | LinkageError::Interrupted { phase }
            | LinkageError::Worker { phase, .. } => Some(*phase),
            LinkageError::Config(_) => None,
        }
    }

    /// True when the run stopped because of operator cancellation.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, LinkageError::Interrupted { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LinkageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_names_phase() {
        let err = LinkageError::MissingColumn {
            phase: Phase::Load,
            path: PathBuf::from("truth.csv"),
            column: "match".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "load phase failed: 'truth.csv' has no 'match' column"
        );
        assert_eq!(err.phase(), Some(Phase::Load));
    }

    #[test]
    fn test_interrupted() {
        let err = LinkageError::Interrupted {
            phase: Phase::Score,
        };
        assert!(err.is_interrupted());
        assert_eq!(err.to_string(), "score phase interrupted by operator");
        assert!(!LinkageError::Config("x".into()).is_interrupted());
    }
}
