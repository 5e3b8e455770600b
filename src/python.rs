//! Python extension module.
//!
//! Long-running calls release the GIL and run on a helper thread while the
//! calling thread polls for signals, so Ctrl+C cancels the run and raises
//! `KeyboardInterrupt`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use pyo3::exceptions::{PyIOError, PyKeyboardInterrupt, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::candidates::{CandidatePairGenerator, GenerationSummary};
use crate::cancel::CancellationToken;
use crate::config::{ConfigOverrides, JoinMode, LinkageConfig};
use crate::error::LinkageError;
use crate::evaluation::{EvaluationResult, LinkageEvaluator};
use crate::record::{Field, VehicleRecord};
use crate::scoring::FieldScorer;
use crate::telemetry;
use crate::truth::GroundTruthIndex;

const SIGNAL_POLL: Duration = Duration::from_millis(100);

impl From<LinkageError> for PyErr {
    fn from(err: LinkageError) -> PyErr {
        let message = err.to_string();
        match err {
            LinkageError::DataAccess { .. } | LinkageError::Write { .. } => {
                PyIOError::new_err(message)
            }
            LinkageError::MissingColumn { .. } | LinkageError::Config(_) => {
                PyValueError::new_err(message)
            }
            LinkageError::Interrupted { .. } => PyKeyboardInterrupt::new_err(message),
            LinkageError::Worker { .. } => PyRuntimeError::new_err(message),
        }
    }
}

/// Summary of a candidate generation run
#[derive(Clone, Debug, IntoPyObject)]
struct GenerationReport {
    strategy: String,
    join_mode: String,
    pairs: usize,
    chunks: usize,
    blocks_joined: usize,
    rows_a: usize,
    rows_b: usize,
    skipped_rows: usize,
    excluded_a: usize,
    excluded_b: usize,
    elapsed_seconds: f64,
}

impl From<GenerationSummary> for GenerationReport {
    fn from(summary: GenerationSummary) -> Self {
        Self {
            strategy: summary.strategy,
            join_mode: match summary.join_mode {
                JoinMode::Streaming => "streaming".to_string(),
                JoinMode::InMemory => "in_memory".to_string(),
            },
            pairs: summary.pairs,
            chunks: summary.chunks,
            blocks_joined: summary.blocks_joined,
            rows_a: summary.stream_a.rows_read,
            rows_b: summary.stream_b.rows_read,
            skipped_rows: summary.stream_a.rows_skipped + summary.stream_b.rows_skipped,
            excluded_a: summary.index_a.excluded,
            excluded_b: summary.excluded_b,
            elapsed_seconds: summary.elapsed.as_secs_f64(),
        }
    }
}

#[derive(Clone, Debug, IntoPyObject)]
struct BlockReport {
    pairs: usize,
    predicted_matches: usize,
    true_matches: usize,
    true_positives: usize,
}

/// Metrics of an evaluation run
#[derive(Clone, Debug, IntoPyObject)]
struct EvaluationReport {
    precision: f64,
    recall: f64,
    f1: f64,
    true_positives: usize,
    false_positives: usize,
    true_negatives: usize,
    false_negatives: usize,
    rows_scanned: usize,
    pairs_scored: usize,
    truth_total: usize,
    truth_covered: usize,
    blocking_recall: f64,
    backup_rows: usize,
    elapsed_seconds: f64,
    per_block: BTreeMap<String, BlockReport>,
}

impl From<EvaluationResult> for EvaluationReport {
    fn from(result: EvaluationResult) -> Self {
        Self {
            precision: result.precision,
            recall: result.recall,
            f1: result.f1,
            true_positives: result.counts.true_positives,
            false_positives: result.counts.false_positives,
            true_negatives: result.counts.true_negatives,
            false_negatives: result.counts.false_negatives,
            rows_scanned: result.rows_scanned,
            pairs_scored: result.pairs_scored,
            truth_total: result.truth_total,
            truth_covered: result.truth_covered,
            blocking_recall: result.blocking_recall(),
            backup_rows: result.backup_rows,
            elapsed_seconds: result.elapsed.as_secs_f64(),
            per_block: result
                .per_block
                .into_iter()
                .map(|(key, stat)| {
                    (
                        key,
                        BlockReport {
                            pairs: stat.pairs,
                            predicted_matches: stat.predicted_matches,
                            true_matches: stat.true_matches,
                            true_positives: stat.true_positives,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Per-field breakdown of one pair's score
#[derive(Clone, Debug, IntoPyObject)]
struct ScoreReport {
    total: f64,
    is_match: bool,
    contributions: BTreeMap<String, f64>,
}

/// Run `job` off the GIL, cancelling it when Python sees a signal.
fn run_interruptible<T, F>(py: Python<'_>, job: F) -> PyResult<T>
where
    T: Send + 'static,
    F: FnOnce(CancellationToken) -> Result<T, LinkageError> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let (sender, receiver) = bounded(1);
    let worker_cancel = cancel.clone();
    let worker = thread::Builder::new()
        .name("linkage-job".to_string())
        .spawn(move || {
            let _ = sender.send(job(worker_cancel));
        })
        .map_err(|err| PyRuntimeError::new_err(format!("cannot start job thread: {err}")))?;

    loop {
        match py.allow_threads(|| receiver.recv_timeout(SIGNAL_POLL)) {
            Ok(result) => {
                let _ = worker.join();
                return result.map_err(PyErr::from);
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Err(signal) = py.check_signals() {
                    cancel.cancel();
                    let _ = py.allow_threads(|| worker.join());
                    return Err(signal);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(PyRuntimeError::new_err("linkage job panicked"));
            }
        }
    }
}

fn load_config(config_path: Option<&str>) -> Result<LinkageConfig, LinkageError> {
    match config_path {
        Some(path) => LinkageConfig::from_json_file(path),
        None => Ok(LinkageConfig::default()),
    }
}

/// Write every candidate pair of two CSV datasets to `output`.
#[pyfunction]
#[pyo3(signature = (path_a, path_b, output, strategy=None, chunk_size=None, join_mode=None, config_path=None))]
#[allow(clippy::too_many_arguments)]
fn generate_candidates(
    py: Python<'_>,
    path_a: String,
    path_b: String,
    output: String,
    strategy: Option<String>,
    chunk_size: Option<usize>,
    join_mode: Option<String>,
    config_path: Option<&str>,
) -> PyResult<GenerationReport> {
    let config = ConfigOverrides {
        strategy,
        join_mode,
        chunk_size,
        ..ConfigOverrides::default()
    }
    .apply(load_config(config_path)?)?;

    let generator = CandidatePairGenerator::from_config(&config);
    let summary = run_interruptible(py, move |cancel| {
        generator.generate_to_csv(&path_a, &path_b, &output, &cancel)
    })?;
    Ok(summary.into())
}

/// Score a candidate file against ground truth and return the metrics.
#[pyfunction]
#[pyo3(signature = (candidates, ground_truth, strategy=None, threshold=None, workers=None, chunk_size=None, backup_path=None, per_block_stats=None, config_path=None))]
#[allow(clippy::too_many_arguments)]
fn evaluate(
    py: Python<'_>,
    candidates: String,
    ground_truth: String,
    strategy: Option<String>,
    threshold: Option<f64>,
    workers: Option<usize>,
    chunk_size: Option<usize>,
    backup_path: Option<String>,
    per_block_stats: Option<bool>,
    config_path: Option<&str>,
) -> PyResult<EvaluationReport> {
    let config = ConfigOverrides {
        strategy,
        match_threshold: threshold,
        workers,
        chunk_size,
        backup_path: backup_path.map(PathBuf::from),
        per_block_stats,
        ..ConfigOverrides::default()
    }
    .apply(load_config(config_path)?)?;

    let result = run_interruptible(py, move |cancel| {
        let truth = GroundTruthIndex::load(&ground_truth, config.chunk_size)?;
        LinkageEvaluator::new(&config, truth)?.evaluate(&candidates, &cancel)
    })?;
    Ok(result.into())
}

fn vehicle_from_dict(record: &Bound<'_, PyDict>) -> PyResult<VehicleRecord> {
    let mut vehicle = VehicleRecord::default();
    for (key, value) in record.iter() {
        let Some(field) = Field::from_name(&key.str()?.to_string()) else {
            continue;
        };
        let value = if value.is_none() {
            None
        } else {
            Some(value.str()?.to_string())
        };
        vehicle.set(field, value);
    }
    Ok(vehicle)
}

/// Score one pair of records given as dicts keyed by field name.
#[pyfunction]
#[pyo3(signature = (a, b, threshold=None, config_path=None))]
fn score_pair(
    a: &Bound<'_, PyDict>,
    b: &Bound<'_, PyDict>,
    threshold: Option<f64>,
    config_path: Option<&str>,
) -> PyResult<ScoreReport> {
    let config = load_config(config_path)?;
    let threshold = threshold.unwrap_or(config.match_threshold);
    let scorer = FieldScorer::new(&config.scoring);
    let breakdown = scorer.breakdown(&vehicle_from_dict(a)?, &vehicle_from_dict(b)?);
    Ok(ScoreReport {
        total: breakdown.total,
        is_match: breakdown.total >= threshold,
        contributions: Field::ALL
            .iter()
            .map(|&field| (field.name().to_string(), breakdown.contribution(field)))
            .collect(),
    })
}

/// Send the crate's log events to stderr.
#[pyfunction]
#[pyo3(signature = (level="info", json=false))]
fn init_logging(level: &str, json: bool) -> PyResult<()> {
    let level = telemetry::parse_level(level)
        .ok_or_else(|| PyValueError::new_err(format!("unknown log level '{level}'")))?;
    telemetry::init_tracing(json, level);
    Ok(())
}

/// Vehicle record linkage: blocking, scoring and evaluation.
#[pymodule]
fn vehicle_linkage(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(generate_candidates, m)?)?;
    m.add_function(wrap_pyfunction!(evaluate, m)?)?;
    m.add_function(wrap_pyfunction!(score_pair, m)?)?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    Ok(())
}
