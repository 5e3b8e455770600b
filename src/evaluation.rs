//! Scoring of candidate pairs against ground truth.
//!
//! Only pairs found in the ground truth are scored. Each chunk of the
//! candidate file is turned into an immutable outcome; a single
//! accumulator merges outcomes in whatever order they arrive.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::backup::{BackupHandle, BackupRow, BackupSink};
use crate::blocking::BlockingStrategy;
use crate::cancel::CancellationToken;
use crate::candidates::CandidateColumns;
use crate::config::LinkageConfig;
use crate::error::{LinkageError, Phase, Result};
use crate::scoring::FieldScorer;
use crate::stream::{RecordChunk, RecordStream};
use crate::truth::GroundTruthIndex;

/// How often a waiting dispatcher looks at the cancellation token.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// True/false positive/negative counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConfusionCounts {
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
}

impl ConfusionCounts {
    pub fn record(&mut self, predicted: bool, actual: bool) {
        match (predicted, actual) {
            (true, true) => self.true_positives += 1,
            (true, false) => self.false_positives += 1,
            (false, false) => self.true_negatives += 1,
            (false, true) => self.false_negatives += 1,
        }
    }

    pub fn merge(&mut self, other: &ConfusionCounts) {
        self.true_positives += other.true_positives;
        self.false_positives += other.false_positives;
        self.true_negatives += other.true_negatives;
        self.false_negatives += other.false_negatives;
    }

    pub fn total(&self) -> usize {
        self.true_positives + self.false_positives + self.true_negatives + self.false_negatives
    }

    /// tp / (tp + fp), 0 when nothing was predicted positive.
    pub fn precision(&self) -> f64 {
        ratio(
            self.true_positives,
            self.true_positives + self.false_positives,
        )
    }

    /// tp / (tp + fn), 0 when there are no actual positives.
    pub fn recall(&self) -> f64 {
        ratio(
            self.true_positives,
            self.true_positives + self.false_negatives,
        )
    }

    pub fn f1(&self) -> f64 {
        let (precision, recall) = (self.precision(), self.recall());
        if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        }
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Per-block tallies over scored ground-truth pairs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockStat {
    pub pairs: usize,
    pub predicted_matches: usize,
    pub true_matches: usize,
    pub true_positives: usize,
}

impl BlockStat {
    fn record(&mut self, predicted: bool, actual: bool) {
        self.pairs += 1;
        self.predicted_matches += usize::from(predicted);
        self.true_matches += usize::from(actual);
        self.true_positives += usize::from(predicted && actual);
    }

    fn merge(&mut self, other: &BlockStat) {
        self.pairs += other.pairs;
        self.predicted_matches += other.predicted_matches;
        self.true_matches += other.true_matches;
        self.true_positives += other.true_positives;
    }
}

/// Final metrics of one evaluation run.
#[derive(Clone, Debug, PartialEq)]
pub struct EvaluationResult {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub counts: ConfusionCounts,
    /// Candidate rows read.
    pub rows_scanned: usize,
    /// Candidate rows found in ground truth and scored.
    pub pairs_scored: usize,
    pub truth_total: usize,
    /// Ground-truth pairs seen at least once among the candidates.
    pub truth_covered: usize,
    pub backup_rows: usize,
    pub elapsed: Duration,
    /// Keyed by the block key's display form. Empty unless requested.
    pub per_block: BTreeMap<String, BlockStat>,
}

impl EvaluationResult {
    /// Share of ground-truth pairs the blocking step produced.
    pub fn blocking_recall(&self) -> f64 {
        ratio(self.truth_covered, self.truth_total)
    }
}

/// Immutable result of scoring one candidate chunk.
#[derive(Debug, Default)]
struct ChunkOutcome {
    counts: ConfusionCounts,
    rows: usize,
    scored: usize,
    seen: Vec<usize>,
    per_block: AHashMap<String, BlockStat>,
}

/// Read-only state every worker needs.
struct ScoringContext {
    scorer: FieldScorer,
    truth: GroundTruthIndex,
    threshold: f64,
    per_block: bool,
}

impl ScoringContext {
    /// Score the ground-truth pairs of one chunk; `stop` is polled per row.
    fn score_chunk(
        &self,
        chunk: &RecordChunk,
        columns: &CandidateColumns,
        backup: Option<&BackupHandle>,
        stop: &dyn Fn() -> bool,
    ) -> Result<ChunkOutcome> {
        let mut outcome = ChunkOutcome {
            rows: chunk.len(),
            ..ChunkOutcome::default()
        };
        let mut batch = Vec::new();

        for record in &chunk.records {
            if stop() {
                return Err(LinkageError::Interrupted {
                    phase: Phase::Score,
                });
            }
            let identity = columns.identity(record);
            let Some(entry) = self.truth.get(&identity) else {
                continue;
            };

            let score = self
                .scorer
                .score(&columns.side_a(record), &columns.side_b(record));
            let predicted = score >= self.threshold;
            outcome.counts.record(predicted, entry.is_match);
            outcome.scored += 1;
            outcome.seen.push(entry.id);

            if self.per_block {
                let block = columns
                    .block_key(record)
                    .map_or_else(String::new, |key| key.to_string());
                outcome
                    .per_block
                    .entry(block)
                    .or_default()
                    .record(predicted, entry.is_match);
            }
            if backup.is_some() {
                batch.push(BackupRow {
                    identity,
                    score,
                    predicted,
                    actual: entry.is_match,
                });
            }
        }

        if let Some(handle) = backup {
            handle.send(batch)?;
        }
        Ok(outcome)
    }
}

/// Merges chunk outcomes; merge order does not affect the result.
struct Accumulator {
    counts: ConfusionCounts,
    rows: usize,
    scored: usize,
    seen: Vec<bool>,
    per_block: AHashMap<String, BlockStat>,
}

impl Accumulator {
    fn new(truth_len: usize) -> Self {
        Self {
            counts: ConfusionCounts::default(),
            rows: 0,
            scored: 0,
            seen: vec![false; truth_len],
            per_block: AHashMap::new(),
        }
    }

    fn merge(&mut self, outcome: ChunkOutcome) {
        self.counts.merge(&outcome.counts);
        self.rows += outcome.rows;
        self.scored += outcome.scored;
        for id in outcome.seen {
            if let Some(seen) = self.seen.get_mut(id) {
                *seen = true;
            }
        }
        for (block, stat) in outcome.per_block {
            self.per_block.entry(block).or_default().merge(&stat);
        }
    }

    /// Fold never-seen ground truth in as predicted non-matches.
    fn finish(
        mut self,
        truth: &GroundTruthIndex,
        backup_rows: usize,
        elapsed: Duration,
    ) -> EvaluationResult {
        let mut covered = 0usize;
        for (id, &label) in truth.labels().iter().enumerate() {
            if self.seen.get(id).copied().unwrap_or(false) {
                covered += 1;
            } else {
                self.counts.record(false, label);
            }
        }
        let missed = truth.len() - covered;
        if missed > 0 {
            debug!(missed, "ground-truth pairs absent from candidates");
        }

        EvaluationResult {
            precision: self.counts.precision(),
            recall: self.counts.recall(),
            f1: self.counts.f1(),
            counts: self.counts,
            rows_scanned: self.rows,
            pairs_scored: self.scored,
            truth_total: truth.len(),
            truth_covered: covered,
            backup_rows,
            elapsed,
            per_block: self.per_block.into_iter().collect(),
        }
    }
}

/// Sets a token when dropped, so workers stop once the dispatcher leaves.
struct HaltOnDrop(CancellationToken);

impl Drop for HaltOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Evaluates a candidate-pair file against ground truth.
pub struct LinkageEvaluator {
    config: LinkageConfig,
    strategy: BlockingStrategy,
    context: Arc<ScoringContext>,
}

impl LinkageEvaluator {
    pub fn new(config: &LinkageConfig, truth: GroundTruthIndex) -> Result<Self> {
        config.validate()?;
        let scorer = FieldScorer::new(&config.scoring);
        if !scorer.is_bounded() {
            warn!(
                total = scorer.max_score(),
                "field weights sum above 1.0; composite scores can exceed 1.0"
            );
        }
        Ok(Self {
            config: config.clone(),
            strategy: BlockingStrategy::from_kind(config.strategy),
            context: Arc::new(ScoringContext {
                scorer,
                truth,
                threshold: config.match_threshold,
                per_block: config.per_block_stats,
            }),
        })
    }

    pub fn truth(&self) -> &GroundTruthIndex {
        &self.context.truth
    }

    pub fn scorer(&self) -> &FieldScorer {
        &self.context.scorer
    }

    /// Run in the mode the configuration asks for.
    pub fn evaluate(
        &self,
        candidates: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<EvaluationResult> {
        if self.config.workers <= 1 {
            self.evaluate_sequential(candidates, cancel)
        } else {
            self.evaluate_parallel(candidates, cancel)
        }
    }

    /// One pass, one chunk at a time, on the calling thread.
    pub fn evaluate_sequential(
        &self,
        candidates: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<EvaluationResult> {
        let start = Instant::now();
        let (stream, columns) = self.open(candidates.as_ref())?;
        let backup = self.open_backup()?;
        let handle = backup.as_ref().and_then(BackupSink::handle);
        let mut acc = Accumulator::new(self.context.truth.len());

        info!(candidates = %candidates.as_ref().display(), "evaluating sequentially");
        for chunk in stream {
            cancel.check(Phase::Score)?;
            let chunk = chunk?;
            let outcome = self.context.score_chunk(&chunk, &columns, handle.as_ref(), &|| {
                cancel.is_cancelled()
            })?;
            debug!(chunk = chunk.index, scored = outcome.scored, "scored chunk");
            acc.merge(outcome);
        }

        drop(handle);
        self.finish(acc, backup, start)
    }

    /// Chunks fanned out to a pool of `workers` threads.
    ///
    /// At most `workers` chunks are in flight; the reader blocks until any
    /// one of them completes. Cancellation stops dispatch, tells running
    /// workers to stop and returns without metrics.
    pub fn evaluate_parallel(
        &self,
        candidates: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<EvaluationResult> {
        let start = Instant::now();
        let workers = self.config.workers.max(1);
        let (stream, columns) = self.open(candidates.as_ref())?;
        let columns = Arc::new(columns);
        let backup = self.open_backup()?;
        let handle = backup.as_ref().and_then(BackupSink::handle);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|idx| format!("linkage-worker-{idx}"))
            .build()
            .map_err(|err| LinkageError::Worker {
                phase: Phase::Score,
                reason: format!("cannot start worker pool: {err}"),
            })?;
        // declared after the backup sink so it drops first
        let halt = HaltOnDrop(CancellationToken::new());
        let (sender, receiver) = unbounded::<Result<ChunkOutcome>>();
        let mut acc = Accumulator::new(self.context.truth.len());
        let mut in_flight = 0usize;

        info!(
            candidates = %candidates.as_ref().display(),
            workers,
            "evaluating in parallel"
        );
        for chunk in stream {
            cancel.check(Phase::Score)?;
            let chunk = chunk?;
            while in_flight >= workers {
                self.wait_one(&receiver, cancel, &mut acc)?;
                in_flight -= 1;
            }

            let context = Arc::clone(&self.context);
            let columns = Arc::clone(&columns);
            let handle = handle.clone();
            let sender = sender.clone();
            let user = cancel.clone();
            let halt = halt.0.clone();
            pool.spawn(move || {
                let stop = || user.is_cancelled() || halt.is_cancelled();
                if stop() {
                    return;
                }
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    context.score_chunk(&chunk, &columns, handle.as_ref(), &stop)
                }))
                .unwrap_or_else(|_| {
                    Err(LinkageError::Worker {
                        phase: Phase::Score,
                        reason: format!("worker panicked on chunk {}", chunk.index),
                    })
                });
                let _ = sender.send(outcome);
            });
            in_flight += 1;
        }
        while in_flight > 0 {
            self.wait_one(&receiver, cancel, &mut acc)?;
            in_flight -= 1;
        }

        drop(handle);
        drop(halt);
        self.finish(acc, backup, start)
    }

    /// Block until one worker reports, checking for cancellation meanwhile.
    fn wait_one(
        &self,
        receiver: &Receiver<Result<ChunkOutcome>>,
        cancel: &CancellationToken,
        acc: &mut Accumulator,
    ) -> Result<()> {
        loop {
            cancel.check(Phase::Score)?;
            match receiver.recv_timeout(POLL_INTERVAL) {
                Ok(outcome) => {
                    acc.merge(outcome?);
                    return Ok(());
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(LinkageError::Worker {
                        phase: Phase::Aggregate,
                        reason: "worker pool stopped reporting".to_string(),
                    })
                }
            }
        }
    }

    fn open(&self, path: &Path) -> Result<(RecordStream, CandidateColumns)> {
        let stream = RecordStream::open(path, self.config.chunk_size, Phase::Load)?;
        let columns = CandidateColumns::resolve(stream.schema(), &self.strategy);
        let missing = columns.missing();
        if !missing.is_empty() {
            warn!(
                path = %path.display(),
                ?missing,
                "candidate file lacks fields, they score zero"
            );
        }
        Ok((stream, columns))
    }

    fn open_backup(&self) -> Result<Option<BackupSink>> {
        self.config
            .backup_path
            .as_ref()
            .map(BackupSink::spawn)
            .transpose()
    }

    fn finish(
        &self,
        acc: Accumulator,
        backup: Option<BackupSink>,
        start: Instant,
    ) -> Result<EvaluationResult> {
        let backup_rows = match backup {
            Some(sink) => sink.finish()?,
            None => 0,
        };
        let result = acc.finish(&self.context.truth, backup_rows, start.elapsed());
        info!(
            precision = result.precision,
            recall = result.recall,
            f1 = result.f1,
            tp = result.counts.true_positives,
            fp = result.counts.false_positives,
            tn = result.counts.true_negatives,
            fn_ = result.counts.false_negatives,
            scored = result.pairs_scored,
            covered = result.truth_covered,
            truth = result.truth_total,
            elapsed = ?result.elapsed,
            "evaluation finished"
        );
        Ok(result)
    }
}
