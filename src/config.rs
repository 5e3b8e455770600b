use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LinkageError, Result};
use crate::record::{Field, FIELD_COUNT};

/// Built-in blocking strategies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    /// Same manufacturer and same year, raw values.
    #[default]
    B1,
    /// Same transmission, same year and same normalized fuel type.
    B2,
}

/// How candidate pairs are joined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinMode {
    /// Side A resident, side B streamed in chunks.
    Streaming,
    /// Both sides indexed in memory, bucket-by-bucket products.
    InMemory,
}

impl StrategyKind {
    /// Join mode used when the configuration does not force one.
    pub fn default_join_mode(self) -> JoinMode {
        match self {
            StrategyKind::B1 => JoinMode::Streaming,
            StrategyKind::B2 => JoinMode::InMemory,
        }
    }
}

impl FromStr for StrategyKind {
    type Err = LinkageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "B1" => Ok(StrategyKind::B1),
            "B2" => Ok(StrategyKind::B2),
            other => Err(LinkageError::Config(format!(
                "unknown blocking strategy '{other}', expected B1 or B2"
            ))),
        }
    }
}

impl FromStr for JoinMode {
    type Err = LinkageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "streaming" => Ok(JoinMode::Streaming),
            "in_memory" | "inmemory" => Ok(JoinMode::InMemory),
            other => Err(LinkageError::Config(format!(
                "unknown join mode '{other}', expected streaming or in_memory"
            ))),
        }
    }
}

/// Per-field maximum contributions.
///
/// The defaults add up to 1.12, not 1.0. They are kept as found; the evaluator
/// logs a warning whenever the total exceeds 1.0.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldWeights {
    pub model: f64,
    pub manufacturer: f64,
    pub year: f64,
    pub mileage: f64,
    pub fuel_type: f64,
    pub transmission: f64,
    pub body_type: f64,
    pub cylinders: f64,
    pub drive: f64,
    pub color: f64,
}

impl Default for FieldWeights {
    fn default() -> Self {
        Self {
            model: 0.5,
            manufacturer: 0.2,
            year: 0.1,
            mileage: 0.1,
            fuel_type: 0.05,
            transmission: 0.05,
            body_type: 0.05,
            cylinders: 0.03,
            drive: 0.02,
            color: 0.02,
        }
    }
}

impl FieldWeights {
    pub fn get(&self, field: Field) -> f64 {
        match field {
            Field::Manufacturer => self.manufacturer,
            Field::Model => self.model,
            Field::Year => self.year,
            Field::Mileage => self.mileage,
            Field::FuelType => self.fuel_type,
            Field::Transmission => self.transmission,
            Field::BodyType => self.body_type,
            Field::Cylinders => self.cylinders,
            Field::Drive => self.drive,
            Field::Color => self.color,
        }
    }

    /// Weights in canonical field order.
    pub fn as_array(&self) -> [f64; FIELD_COUNT] {
        Field::ALL.map(|field| self.get(field))
    }

    /// Theoretical maximum composite score.
    pub fn total(&self) -> f64 {
        self.as_array().iter().sum()
    }
}

/// Scoring parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: FieldWeights,
    /// Mileage difference at which the mileage contribution reaches zero.
    pub mileage_max_diff: f64,
    /// Share of the weight granted to declared equivalent values.
    pub equivalence_credit: f64,
    /// Share of the weight granted when either side is `other`.
    pub other_credit: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: FieldWeights::default(),
            mileage_max_diff: 50_000.0,
            equivalence_credit: 0.8,
            other_credit: 0.3,
        }
    }
}

impl ScoringConfig {
    pub fn with_weights(mut self, weights: FieldWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_mileage_max_diff(mut self, max_diff: f64) -> Self {
        self.mileage_max_diff = max_diff;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for field in Field::ALL {
            let weight = self.weights.get(field);
            if !weight.is_finite() || weight < 0.0 {
                return Err(LinkageError::Config(format!(
                    "weight for '{field}' must be a non-negative number, got {weight}"
                )));
            }
        }
        if !self.mileage_max_diff.is_finite() || self.mileage_max_diff <= 0.0 {
            return Err(LinkageError::Config(format!(
                "mileage_max_diff must be positive, got {}",
                self.mileage_max_diff
            )));
        }
        for (name, ratio) in [
            ("equivalence_credit", self.equivalence_credit),
            ("other_credit", self.other_credit),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(LinkageError::Config(format!(
                    "{name} must lie in [0, 1], got {ratio}"
                )));
            }
        }
        Ok(())
    }
}

/// Run configuration handed to every component at construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkageConfig {
    /// Rows per chunk when streaming any file.
    pub chunk_size: usize,
    pub strategy: StrategyKind,
    /// Forces a join mode; `None` lets the strategy pick.
    pub join_mode: Option<JoinMode>,
    /// A pair is a predicted match iff its score is at least this value.
    pub match_threshold: f64,
    /// Evaluation worker pool width; 0 or 1 runs sequentially.
    pub workers: usize,
    /// Append every ground-truth-labelled scored pair to this file.
    pub backup_path: Option<PathBuf>,
    /// Collect the per-block evaluation breakdown.
    pub per_block_stats: bool,
    pub scoring: ScoringConfig,
}

impl Default for LinkageConfig {
    fn default() -> Self {
        Self {
            chunk_size: 200_000,
            strategy: StrategyKind::B1,
            join_mode: None,
            match_threshold: 0.70,
            workers: 8,
            backup_path: None,
            per_block_stats: false,
            scoring: ScoringConfig::default(),
        }
    }
}

impl LinkageConfig {
    /// Load a configuration from a JSON file; absent keys take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            LinkageError::Config(format!("cannot open '{}': {err}", path.display()))
        })?;
        let config: Self = serde_json::from_reader(BufReader::new(file)).map_err(|err| {
            LinkageError::Config(format!("cannot parse '{}': {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_join_mode(mut self, join_mode: JoinMode) -> Self {
        self.join_mode = Some(join_mode);
        self
    }

    pub fn with_match_threshold(mut self, threshold: f64) -> Self {
        self.match_threshold = threshold;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_backup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_path = Some(path.into());
        self
    }

    pub fn with_per_block_stats(mut self, enabled: bool) -> Self {
        self.per_block_stats = enabled;
        self
    }

    pub fn with_scoring(mut self, scoring: ScoringConfig) -> Self {
        self.scoring = scoring;
        self
    }

    /// Join mode in effect for this run.
    pub fn effective_join_mode(&self) -> JoinMode {
        self.join_mode
            .unwrap_or_else(|| self.strategy.default_join_mode())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(LinkageError::Config("chunk_size must be positive".into()));
        }
        if !self.match_threshold.is_finite() || self.match_threshold < 0.0 {
            return Err(LinkageError::Config(format!(
                "match_threshold must be a non-negative number, got {}",
                self.match_threshold
            )));
        }
        self.scoring.validate()
    }
}

/// Caller-supplied settings layered over a loaded configuration. Only the
/// fields that are set replace what the configuration holds.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub strategy: Option<String>,
    pub join_mode: Option<String>,
    pub match_threshold: Option<f64>,
    pub workers: Option<usize>,
    pub chunk_size: Option<usize>,
    pub backup_path: Option<PathBuf>,
    pub per_block_stats: Option<bool>,
}

impl ConfigOverrides {
    /// Apply to `config` and validate the result.
    pub fn apply(self, mut config: LinkageConfig) -> Result<LinkageConfig> {
        if let Some(strategy) = self.strategy {
            config = config.with_strategy(strategy.parse()?);
        }
        if let Some(join_mode) = self.join_mode {
            config = config.with_join_mode(join_mode.parse()?);
        }
        if let Some(threshold) = self.match_threshold {
            config = config.with_match_threshold(threshold);
        }
        if let Some(workers) = self.workers {
            config = config.with_workers(workers);
        }
        if let Some(chunk_size) = self.chunk_size {
            config = config.with_chunk_size(chunk_size);
        }
        if let Some(path) = self.backup_path {
            config = config.with_backup_path(path);
        }
        if let Some(enabled) = self.per_block_stats {
            config = config.with_per_block_stats(enabled);
        }
        config.validate()?;
        Ok(config)
    }
}
