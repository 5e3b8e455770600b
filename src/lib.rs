//! Record linkage between two vehicle-listing datasets.
//!
//! Records are blocked on cheap shared keys, every pair sharing a key is
//! written out as a candidate, and candidates found in a labelled ground
//! truth are scored with a weighted per-field rule table and evaluated.
//!
//! ```no_run
//! use vehicle_linkage::{
//!     CancellationToken, CandidatePairGenerator, GroundTruthIndex, LinkageConfig,
//!     LinkageEvaluator,
//! };
//!
//! # fn main() -> vehicle_linkage::Result<()> {
//! let config = LinkageConfig::default().with_workers(4);
//! let cancel = CancellationToken::new();
//! CandidatePairGenerator::from_config(&config)
//!     .generate_to_csv("a.csv", "b.csv", "pairs.csv", &cancel)?;
//! let truth = GroundTruthIndex::load("truth.csv", config.chunk_size)?;
//! let result = LinkageEvaluator::new(&config, truth)?.evaluate("pairs.csv", &cancel)?;
//! println!("f1 = {:.3}", result.f1);
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod blocking;
pub mod cancel;
pub mod candidates;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod pipeline;
pub mod record;
pub mod scoring;
pub mod stream;
pub mod telemetry;
pub mod truth;

#[cfg(feature = "python")]
mod python;

pub use backup::{BackupHandle, BackupRow, BackupSink};
pub use blocking::{BlockIndex, BlockKey, BlockStats, BlockingStrategy, KeyComponent, KeyNormalizer};
pub use cancel::CancellationToken;
pub use candidates::{
    CandidateColumns, CandidatePair, CandidatePairGenerator, CsvPairWriter, GenerationSummary,
    PairCollector, PairLayout, PairSink,
};
pub use config::{
    ConfigOverrides, FieldWeights, JoinMode, LinkageConfig, ScoringConfig, StrategyKind,
};
pub use error::{LinkageError, Phase, Result};
pub use evaluation::{BlockStat, ConfusionCounts, EvaluationResult, LinkageEvaluator};
pub use pipeline::{LinkagePipeline, PipelineReport};
pub use record::{clean_value, Field, FieldSource, Record, Schema, VehicleRecord};
pub use scoring::{FieldRule, FieldScorer, RuleKind, ScoreBreakdown};
pub use stream::{RecordChunk, RecordStream, StreamStats};
pub use telemetry::init_tracing;
pub use truth::{GroundTruthIndex, IdentityTuple, TruthEntry};
