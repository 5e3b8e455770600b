use std::path::{Path, PathBuf};

use tracing::info;

use crate::cancel::CancellationToken;
use crate::candidates::{CandidatePairGenerator, GenerationSummary};
use crate::config::LinkageConfig;
use crate::error::{Phase, Result};
use crate::evaluation::{EvaluationResult, LinkageEvaluator};
use crate::truth::GroundTruthIndex;

/// Both stages of one run.
#[derive(Clone, Debug)]
pub struct PipelineReport {
    pub generation: GenerationSummary,
    pub evaluation: EvaluationResult,
}

/// Candidate generation followed by evaluation, sharing one configuration.
#[derive(Clone, Debug)]
pub struct LinkagePipeline {
    config: LinkageConfig,
}

impl LinkagePipeline {
    pub fn new(config: LinkageConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &LinkageConfig {
        &self.config
    }

    /// Block `path_a` against `path_b` into `candidates`, then score the
    /// candidates against `ground_truth`.
    ///
    /// The candidate file is rewritten on every run.
    pub fn run(
        &self,
        path_a: impl AsRef<Path>,
        path_b: impl AsRef<Path>,
        candidates: impl Into<PathBuf>,
        ground_truth: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport> {
        let candidates = candidates.into();
        let generation = CandidatePairGenerator::from_config(&self.config)
            .generate_to_csv(path_a, path_b, &candidates, cancel)?;

        cancel.check(Phase::Load)?;
        let truth = GroundTruthIndex::load(ground_truth, self.config.chunk_size)?;
        let evaluation = LinkageEvaluator::new(&self.config, truth)?.evaluate(&candidates, cancel)?;

        info!(
            pairs = generation.pairs,
            f1 = evaluation.f1,
            blocking_recall = evaluation.blocking_recall(),
            "linkage run finished"
        );
        Ok(PipelineReport {
            generation,
            evaluation,
        })
    }
}
