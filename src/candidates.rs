//! Candidate pair generation: equi-join of two datasets on a block key.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashSet;
use tracing::{debug, info, warn};

use crate::blocking::{BlockIndex, BlockKey, BlockStats, BlockingStrategy};
use crate::cancel::CancellationToken;
use crate::config::{JoinMode, LinkageConfig};
use crate::error::{LinkageError, Phase, Result};
use crate::record::{clean_value, Field, FieldSource, Record, Schema, VehicleRecord, FIELD_COUNT};
use crate::stream::{RecordStream, StreamStats};
use crate::truth::IdentityTuple;

/// A proposed pair, typed for scoring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidatePair {
    pub key: BlockKey,
    pub a: VehicleRecord,
    pub b: VehicleRecord,
}

impl CandidatePair {
    pub fn identity(&self) -> IdentityTuple {
        IdentityTuple::from_sides(&self.a, &self.b)
    }
}

/// Column layout of a candidate file for one strategy and two input schemas.
///
/// Key columns come first, then every side-A column suffixed `_a`, then
/// every side-B column suffixed `_b`. Fields written as shared key columns
/// are not repeated per side.
#[derive(Clone, Debug)]
pub struct PairLayout {
    header: Vec<String>,
    a_columns: Vec<usize>,
    b_columns: Vec<usize>,
}

impl PairLayout {
    pub fn new(strategy: &BlockingStrategy, schema_a: &Schema, schema_b: &Schema) -> Self {
        let shared = strategy.shared_fields();
        let kept = |schema: &Schema| -> Vec<usize> {
            schema
                .columns()
                .iter()
                .enumerate()
                .filter(|(_, name)| {
                    Field::from_name(name).map_or(true, |field| !shared.contains(&field))
                })
                .map(|(idx, _)| idx)
                .collect()
        };
        let a_columns = kept(schema_a);
        let b_columns = kept(schema_b);

        let mut header = strategy.key_columns();
        header.extend(
            a_columns
                .iter()
                .map(|&idx| format!("{}_a", schema_a.columns()[idx].trim())),
        );
        header.extend(
            b_columns
                .iter()
                .map(|&idx| format!("{}_b", schema_b.columns()[idx].trim())),
        );

        Self {
            header,
            a_columns,
            b_columns,
        }
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Flatten one pair into a row matching `header`.
    pub fn row<'r>(&self, key: &'r BlockKey, a: &'r Record, b: &'r Record) -> Vec<&'r str> {
        let cell = |record: &'r Record, idx: usize| -> &'r str {
            record.values().get(idx).map_or("", String::as_str)
        };
        let mut row = Vec::with_capacity(self.header.len());
        row.extend(key.parts().iter().map(String::as_str));
        row.extend(self.a_columns.iter().map(|&idx| cell(a, idx)));
        row.extend(self.b_columns.iter().map(|&idx| cell(b, idx)));
        row
    }
}

/// Destination of generated pairs.
pub trait PairSink {
    /// Called once before the first pair.
    fn begin(&mut self, layout: &PairLayout) -> Result<()>;

    fn accept(&mut self, key: &BlockKey, a: &Record, b: &Record) -> Result<()>;

    /// Called after each input chunk; pending output must reach storage.
    fn flush_chunk(&mut self) -> Result<()>;
}

/// Writes pairs as CSV rows, flushing after every input chunk.
pub struct CsvPairWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
    layout: Option<PairLayout>,
}

impl CsvPairWriter {
    /// Create (or truncate) the output file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&path)
            .map_err(|source| LinkageError::Write {
                phase: Phase::Block,
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            writer,
            layout: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_error(&self, source: csv::Error) -> LinkageError {
        LinkageError::Write {
            phase: Phase::Block,
            path: self.path.clone(),
            source,
        }
    }
}

impl PairSink for CsvPairWriter {
    fn begin(&mut self, layout: &PairLayout) -> Result<()> {
        self.writer
            .write_record(layout.header())
            .map_err(|err| self.write_error(err))?;
        self.layout = Some(layout.clone());
        Ok(())
    }

    fn accept(&mut self, key: &BlockKey, a: &Record, b: &Record) -> Result<()> {
        let Some(layout) = &self.layout else {
            return Err(LinkageError::Worker {
                phase: Phase::Block,
                reason: "pair written before the header".to_string(),
            });
        };
        let result = self.writer.write_record(layout.row(key, a, b));
        result.map_err(|err| self.write_error(err))
    }

    fn flush_chunk(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|err| self.write_error(err.into()))
    }
}

/// Keeps every pair in memory. Meant for small inputs and tests.
#[derive(Debug, Default)]
pub struct PairCollector {
    pub pairs: Vec<CandidatePair>,
    pub header: Vec<String>,
}

impl PairSink for PairCollector {
    fn begin(&mut self, layout: &PairLayout) -> Result<()> {
        self.header = layout.header().to_vec();
        Ok(())
    }

    fn accept(&mut self, key: &BlockKey, a: &Record, b: &Record) -> Result<()> {
        self.pairs.push(CandidatePair {
            key: key.clone(),
            a: a.to_vehicle(),
            b: b.to_vehicle(),
        });
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Outcome of one generation run.
#[derive(Clone, Debug)]
pub struct GenerationSummary {
    pub strategy: String,
    pub join_mode: JoinMode,
    pub pairs: usize,
    /// Flushes performed: B chunks when streaming, joined blocks in memory.
    pub chunks: usize,
    pub blocks_joined: usize,
    pub stream_a: StreamStats,
    pub stream_b: StreamStats,
    pub index_a: BlockStats,
    /// Side-B records dropped for a null key.
    pub excluded_b: usize,
    pub elapsed: Duration,
}

/// Emits every (A, B) pair sharing a block key.
#[derive(Clone, Debug)]
pub struct CandidatePairGenerator {
    strategy: BlockingStrategy,
    chunk_size: usize,
    join_mode: JoinMode,
}

impl CandidatePairGenerator {
    pub fn new(strategy: BlockingStrategy, chunk_size: usize) -> Self {
        Self {
            strategy,
            chunk_size,
            join_mode: JoinMode::Streaming,
        }
    }

    pub fn from_config(config: &LinkageConfig) -> Self {
        Self::new(BlockingStrategy::from_kind(config.strategy), config.chunk_size)
            .with_join_mode(config.effective_join_mode())
    }

    pub fn with_join_mode(mut self, join_mode: JoinMode) -> Self {
        self.join_mode = join_mode;
        self
    }

    pub fn strategy(&self) -> &BlockingStrategy {
        &self.strategy
    }

    pub fn join_mode(&self) -> JoinMode {
        self.join_mode
    }

    /// Join `path_a` against `path_b` and hand every pair to `sink`.
    ///
    /// Deterministic for unchanged inputs; rerunning reproduces the same
    /// pairs in the same order.
    pub fn generate<S: PairSink>(
        &self,
        path_a: impl AsRef<Path>,
        path_b: impl AsRef<Path>,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<GenerationSummary> {
        let start = Instant::now();
        info!(
            strategy = %self.strategy.name(),
            mode = ?self.join_mode,
            a = %path_a.as_ref().display(),
            b = %path_b.as_ref().display(),
            "generating candidate pairs"
        );

        let stream_a = RecordStream::open(&path_a, self.chunk_size, Phase::Load)?;
        let schema_a = Arc::clone(stream_a.schema());
        self.warn_missing_keys(&schema_a, stream_a.path());
        let (records_a, stats_a) = stream_a.read_all()?;
        cancel.check(Phase::Block)?;
        let index_a = self.strategy.index(records_a);

        let stream_b = RecordStream::open(&path_b, self.chunk_size, Phase::Load)?;
        let schema_b = Arc::clone(stream_b.schema());
        self.warn_missing_keys(&schema_b, stream_b.path());

        sink.begin(&PairLayout::new(&self.strategy, &schema_a, &schema_b))?;

        let mut summary = GenerationSummary {
            strategy: self.strategy.name().to_string(),
            join_mode: self.join_mode,
            pairs: 0,
            chunks: 0,
            blocks_joined: 0,
            stream_a: stats_a,
            stream_b: StreamStats::default(),
            index_a: index_a.stats(),
            excluded_b: 0,
            elapsed: Duration::ZERO,
        };

        match self.join_mode {
            JoinMode::Streaming => self.stream_join(&index_a, stream_b, sink, cancel, &mut summary)?,
            JoinMode::InMemory => self.memory_join(&index_a, stream_b, sink, cancel, &mut summary)?,
        }

        summary.elapsed = start.elapsed();
        info!(
            strategy = %summary.strategy,
            pairs = summary.pairs,
            blocks = summary.blocks_joined,
            excluded_a = summary.index_a.excluded,
            excluded_b = summary.excluded_b,
            elapsed = ?summary.elapsed,
            "candidate generation finished"
        );
        Ok(summary)
    }

    /// Convenience wrapper writing the pairs to a CSV file.
    pub fn generate_to_csv(
        &self,
        path_a: impl AsRef<Path>,
        path_b: impl AsRef<Path>,
        output: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<GenerationSummary> {
        let mut writer = CsvPairWriter::create(output)?;
        self.generate(path_a, path_b, &mut writer, cancel)
    }

    /// A resident and indexed, B probed one chunk at a time.
    fn stream_join<S: PairSink>(
        &self,
        index_a: &BlockIndex,
        mut stream_b: RecordStream,
        sink: &mut S,
        cancel: &CancellationToken,
        summary: &mut GenerationSummary,
    ) -> Result<()> {
        let mut joined: AHashSet<BlockKey> = AHashSet::new();

        for chunk in stream_b.by_ref() {
            cancel.check(Phase::Block)?;
            let chunk = chunk?;
            let before = summary.pairs;
            for record_b in &chunk.records {
                let Some(key) = self.strategy.key(record_b) else {
                    summary.excluded_b += 1;
                    continue;
                };
                let Some(bucket) = index_a.get(&key) else {
                    continue;
                };
                for record_a in bucket {
                    sink.accept(&key, record_a, record_b)?;
                }
                summary.pairs += bucket.len();
                joined.insert(key);
            }
            sink.flush_chunk()?;
            summary.chunks += 1;
            debug!(
                chunk = chunk.index,
                rows = chunk.len(),
                pairs = summary.pairs - before,
                "joined chunk"
            );
        }

        summary.stream_b = stream_b.stats();
        summary.blocks_joined = joined.len();
        Ok(())
    }

    /// Both sides indexed; products taken bucket by bucket over A's keys.
    fn memory_join<S: PairSink>(
        &self,
        index_a: &BlockIndex,
        stream_b: RecordStream,
        sink: &mut S,
        cancel: &CancellationToken,
        summary: &mut GenerationSummary,
    ) -> Result<()> {
        let (records_b, stats_b) = stream_b.read_all()?;
        let index_b = self.strategy.index(records_b);
        summary.stream_b = stats_b;
        summary.excluded_b = index_b.stats().excluded;

        for (key, bucket_a) in index_a.iter() {
            let Some(bucket_b) = index_b.get(key) else {
                continue;
            };
            cancel.check(Phase::Block)?;
            for record_a in bucket_a {
                for record_b in bucket_b {
                    sink.accept(key, record_a, record_b)?;
                }
            }
            sink.flush_chunk()?;
            summary.pairs += bucket_a.len() * bucket_b.len();
            summary.blocks_joined += 1;
            summary.chunks += 1;
        }
        Ok(())
    }

    fn warn_missing_keys(&self, schema: &Schema, path: &Path) {
        let missing: Vec<&str> = self
            .strategy
            .components()
            .iter()
            .filter(|component| schema.field_position(component.field).is_none())
            .map(|component| component.field.name())
            .collect();
        if !missing.is_empty() {
            warn!(
                path = %path.display(),
                ?missing,
                "key columns absent, every record of this file gets a null key"
            );
        }
    }
}

/// Field positions of both sides in a candidate file.
///
/// Each side reads `<field>_a` / `<field>_b` and falls back to the shared
/// unprefixed column. Only the identity tuple lets side B fall back further
/// to side A; scoring sees a field B lacks as missing.
#[derive(Clone, Debug)]
pub struct CandidateColumns {
    side_a: [Option<usize>; FIELD_COUNT],
    side_b: [Option<usize>; FIELD_COUNT],
    identity_b: [Option<usize>; FIELD_COUNT],
    key: Option<Vec<usize>>,
    strategy: BlockingStrategy,
}

impl CandidateColumns {
    pub fn resolve(schema: &Schema, strategy: &BlockingStrategy) -> Self {
        let mut side_a = [None; FIELD_COUNT];
        let mut side_b = [None; FIELD_COUNT];
        let mut identity_b = [None; FIELD_COUNT];
        for field in Field::ALL {
            let shared = schema.position(field.name());
            let a = schema
                .position(&format!("{}_a", field.name()))
                .or(shared);
            let b = schema
                .position(&format!("{}_b", field.name()))
                .or(shared);
            side_a[field.index()] = a;
            side_b[field.index()] = b;
            identity_b[field.index()] = b.or(a);
        }
        let key = strategy
            .key_columns()
            .iter()
            .map(|column| schema.position(column))
            .collect::<Option<Vec<usize>>>();

        Self {
            side_a,
            side_b,
            identity_b,
            key,
            strategy: strategy.clone(),
        }
    }

    /// Fields absent on both sides.
    pub fn missing(&self) -> Vec<Field> {
        Field::ALL
            .into_iter()
            .filter(|field| {
                self.side_a[field.index()].is_none() && self.side_b[field.index()].is_none()
            })
            .collect()
    }

    pub fn side_a<'r>(&'r self, record: &'r Record) -> SideView<'r> {
        SideView {
            values: record.values(),
            positions: &self.side_a,
        }
    }

    pub fn side_b<'r>(&'r self, record: &'r Record) -> SideView<'r> {
        SideView {
            values: record.values(),
            positions: &self.side_b,
        }
    }

    /// Identity tuple of a candidate row. Values side B lacks are taken
    /// from side A.
    pub fn identity(&self, record: &Record) -> IdentityTuple {
        let side_b = SideView {
            values: record.values(),
            positions: &self.identity_b,
        };
        IdentityTuple::from_sides(&self.side_a(record), &side_b)
    }

    /// Typed pair of a candidate row.
    pub fn pair(&self, record: &Record) -> Option<CandidatePair> {
        let a = self.side_a(record).to_vehicle();
        let b = self.side_b(record).to_vehicle();
        let key = self.block_key(record)?;
        Some(CandidatePair { key, a, b })
    }

    /// Block key of a candidate row, read from the key columns when the file
    /// has them and recomputed from side A otherwise.
    pub fn block_key(&self, record: &Record) -> Option<BlockKey> {
        match &self.key {
            Some(positions) => positions
                .iter()
                .map(|&idx| {
                    clean_value(record.values().get(idx).map(String::as_str)).map(str::to_string)
                })
                .collect::<Option<Vec<String>>>()
                .map(BlockKey::new),
            None => self.strategy.key(&self.side_a(record)),
        }
    }
}

/// One side of a candidate row.
#[derive(Clone, Copy, Debug)]
pub struct SideView<'r> {
    values: &'r [String],
    positions: &'r [Option<usize>; FIELD_COUNT],
}

impl SideView<'_> {
    pub fn to_vehicle(&self) -> VehicleRecord {
        let mut vehicle = VehicleRecord::default();
        for field in Field::ALL {
            vehicle.set(field, self.raw_field(field).map(str::to_string));
        }
        vehicle
    }
}

impl FieldSource for SideView<'_> {
    fn raw_field(&self, field: Field) -> Option<&str> {
        self.positions[field.index()]
            .and_then(|idx| self.values.get(idx))
            .map(String::as_str)
    }
}
