use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use vehicle_linkage::{
    BlockingStrategy, CancellationToken, CandidatePairGenerator, ConfusionCounts, Field,
    GroundTruthIndex, JoinMode, LinkageConfig, LinkageError, LinkageEvaluator, LinkagePipeline,
    PairCollector, Phase, StrategyKind,
};

const HEADER: &str =
    "manufacturer,model,year,mileage,fuel_type,transmission,body_type,cylinders,drive,color";

const A: [&str; 5] = [
    "toyota,camry,2015,50000,gasoline,automatic,sedan,4,fwd,white",
    "ford,f-150,2012,90000,gasoline,automatic,pickup,6,4wd,blue",
    "ford,focus,2012,40000,flex fuel vehicle,manual,sedan,4,fwd,black",
    "honda,civic,2018,20000,gasoline,manual,sedan,4,fwd,red",
    "kia,rio,nan,15000,gasoline,manual,sedan,4,fwd,red",
];

const B: [&str; 4] = [
    "toyota,camry,2015,52000,gasoline,automatic,sedan,4,fwd,white",
    "ford,f-150 xlt,2012,91000,gasoline,automatic,truck,6,awd,blue",
    "ford,escape,2012,41000,gasoline,automatic,suv,4,fwd,black",
    "honda,civic,2019,21000,gasoline,manual,sedan,4,fwd,red",
];

/// (row of A, row of B, label)
const TRUTH: [(usize, usize, u8); 5] = [(0, 0, 1), (1, 1, 1), (2, 2, 0), (3, 3, 1), (1, 2, 0)];

struct Fixture {
    dir: TempDir,
    a: PathBuf,
    b: PathBuf,
    truth: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        let truth = dir.path().join("truth.csv");
        fs::write(&a, format!("{HEADER}\n{}\n", A.join("\n"))).unwrap();
        fs::write(&b, format!("{HEADER}\n{}\n", B.join("\n"))).unwrap();

        let mut lines = Vec::new();
        let side = |prefix: &str| -> Vec<String> {
            HEADER.split(',').map(|f| format!("{prefix}_{f}")).collect()
        };
        let mut header = side("a");
        header.extend(side("b"));
        header.push("match".to_string());
        lines.push(header.join(","));
        for (ia, ib, label) in TRUTH {
            lines.push(format!("{},{},{label}", A[ia], B[ib]));
        }
        fs::write(&truth, lines.join("\n") + "\n").unwrap();

        Self { dir, a, b, truth }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn candidates(&self, strategy: StrategyKind) -> PathBuf {
        let out = self.path(&format!("pairs_{strategy:?}.csv"));
        let config = LinkageConfig::default()
            .with_strategy(strategy)
            .with_chunk_size(2);
        CandidatePairGenerator::from_config(&config)
            .generate_to_csv(&self.a, &self.b, &out, &CancellationToken::new())
            .unwrap();
        out
    }
}

fn evaluate(
    config: &LinkageConfig,
    truth: &Path,
    candidates: &Path,
) -> vehicle_linkage::EvaluationResult {
    let truth = GroundTruthIndex::load(truth, config.chunk_size).unwrap();
    LinkageEvaluator::new(config, truth)
        .unwrap()
        .evaluate(candidates, &CancellationToken::new())
        .unwrap()
}

const EXPECTED: ConfusionCounts = ConfusionCounts {
    true_positives: 2,
    false_positives: 0,
    true_negatives: 2,
    false_negatives: 1,
};

#[test]
fn test_b1_end_to_end() {
    let fixture = Fixture::new();
    let candidates = fixture.candidates(StrategyKind::B1);
    let config = LinkageConfig::default().with_workers(1).with_chunk_size(2);
    let result = evaluate(&config, &fixture.truth, &candidates);

    assert_eq!(result.rows_scanned, 5);
    assert_eq!(result.pairs_scored, 4);
    assert_eq!(result.counts, EXPECTED);
    assert_eq!(result.truth_total, 5);
    assert_eq!(result.truth_covered, 4);
    assert!((result.precision - 1.0).abs() < 1e-9);
    assert!((result.recall - 2.0 / 3.0).abs() < 1e-9);
    assert!((result.f1 - 0.8).abs() < 1e-9);
}

#[test]
fn test_b2_end_to_end() {
    let fixture = Fixture::new();
    let candidates = fixture.candidates(StrategyKind::B2);
    let config = LinkageConfig::default()
        .with_strategy(StrategyKind::B2)
        .with_workers(1);
    let result = evaluate(&config, &fixture.truth, &candidates);

    assert_eq!(result.rows_scanned, 3);
    assert_eq!(result.pairs_scored, 3);
    assert_eq!(result.truth_covered, 3);
    // the focus/escape pair is never blocked together and its label is 0
    assert_eq!(result.counts, EXPECTED);
}

#[test]
fn test_parallel_and_sequential_agree() {
    let fixture = Fixture::new();
    let candidates = fixture.candidates(StrategyKind::B1);
    let sequential = evaluate(
        &LinkageConfig::default().with_workers(1).with_chunk_size(1),
        &fixture.truth,
        &candidates,
    );
    for workers in [2, 4] {
        let parallel = evaluate(
            &LinkageConfig::default()
                .with_workers(workers)
                .with_chunk_size(1),
            &fixture.truth,
            &candidates,
        );
        assert_eq!(parallel.counts, sequential.counts);
        assert_eq!(parallel.precision, sequential.precision);
        assert_eq!(parallel.recall, sequential.recall);
        assert_eq!(parallel.f1, sequential.f1);
        assert_eq!(parallel.truth_covered, sequential.truth_covered);
    }
}

#[test]
fn test_blocked_pairs_share_keys() {
    let fixture = Fixture::new();
    for (strategy, mode) in [
        (BlockingStrategy::b1(), JoinMode::Streaming),
        (BlockingStrategy::b1(), JoinMode::InMemory),
        (BlockingStrategy::b2(), JoinMode::Streaming),
        (BlockingStrategy::b2(), JoinMode::InMemory),
    ] {
        let mut collector = PairCollector::default();
        CandidatePairGenerator::new(strategy.clone(), 2)
            .with_join_mode(mode)
            .generate(&fixture.a, &fixture.b, &mut collector, &CancellationToken::new())
            .unwrap();
        assert!(!collector.pairs.is_empty());
        for pair in &collector.pairs {
            assert_eq!(strategy.key(&pair.a), strategy.key(&pair.b));
            assert_eq!(strategy.key(&pair.a).as_ref(), Some(&pair.key));
            assert_ne!(pair.a.get(Field::Model), Some("rio"));
        }
    }
}

#[test]
fn test_backup_survives_reruns() {
    let fixture = Fixture::new();
    let candidates = fixture.candidates(StrategyKind::B1);
    let backup = fixture.path("backup.csv");
    let config = LinkageConfig::default()
        .with_workers(2)
        .with_chunk_size(1)
        .with_backup_path(&backup);

    let first = evaluate(&config, &fixture.truth, &candidates);
    assert_eq!(first.backup_rows, 4);
    let second = evaluate(&config, &fixture.truth, &candidates);
    assert_eq!(second.backup_rows, 4);

    let contents = fs::read_to_string(&backup).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 1 + 8);
    assert!(lines[0].ends_with("score,predicted,match"));
    assert_eq!(lines.iter().filter(|line| line.ends_with(",1,1")).count(), 4);
}

#[test]
fn test_cancelled_evaluation_keeps_backup_appendable() {
    let fixture = Fixture::new();
    let candidates = fixture.candidates(StrategyKind::B1);
    let backup = fixture.path("backup.csv");
    let config = LinkageConfig::default()
        .with_workers(2)
        .with_backup_path(&backup);
    let truth = GroundTruthIndex::load(&fixture.truth, 10).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = LinkageEvaluator::new(&config, truth)
        .unwrap()
        .evaluate(&candidates, &cancel)
        .unwrap_err();
    assert!(matches!(err, LinkageError::Interrupted { phase: Phase::Score }));

    let result = evaluate(&config, &fixture.truth, &candidates);
    assert_eq!(result.backup_rows, 4);
    let contents = fs::read_to_string(&backup).unwrap();
    assert_eq!(contents.lines().count(), 5);
}

/// Candidate and truth files with `rows` labelled pairs, all of them found
/// among the candidates.
fn write_large_run(fixture: &Fixture, rows: usize) -> (PathBuf, PathBuf) {
    let fields: Vec<&str> = HEADER.split(',').collect();
    let suffixed = |suffix: &str| -> Vec<String> {
        fields.iter().map(|f| format!("{f}_{suffix}")).collect()
    };
    let prefixed = |prefix: &str| -> Vec<String> {
        fields.iter().map(|f| format!("{prefix}_{f}")).collect()
    };

    let mut candidates = vec![[suffixed("a"), suffixed("b")].concat().join(",")];
    let mut truth = vec![[prefixed("a"), prefixed("b")].concat().join(",") + ",match"];
    for i in 0..rows {
        let a = format!("ford,model {i},2012,{i},gasoline,automatic,sedan,4,fwd,blue");
        let b = format!("ford,model {i} xl,2012,{},gasoline,automatic,sedan,4,fwd,blue", i + 500);
        candidates.push(format!("{a},{b}"));
        truth.push(format!("{a},{b},{}", i % 2));
    }

    let candidates_path = fixture.path("large_pairs.csv");
    let truth_path = fixture.path("large_truth.csv");
    fs::write(&candidates_path, candidates.join("\n") + "\n").unwrap();
    fs::write(&truth_path, truth.join("\n") + "\n").unwrap();
    (candidates_path, truth_path)
}

#[test]
fn test_cancel_during_parallel_run_stops_promptly() {
    let fixture = Fixture::new();
    let (candidates, truth_path) = write_large_run(&fixture, 50_000);
    let backup = fixture.path("backup.csv");
    let config = LinkageConfig::default()
        .with_workers(4)
        .with_chunk_size(100)
        .with_backup_path(&backup);
    let truth = GroundTruthIndex::load(&truth_path, 1000).unwrap();
    let evaluator = LinkageEvaluator::new(&config, truth).unwrap();

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        let backup = backup.clone();
        thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(30);
            // wait until some scored rows have reached the backup file
            while Instant::now() < deadline {
                let lines = fs::read_to_string(&backup)
                    .map(|contents| contents.lines().count())
                    .unwrap_or(0);
                if lines > 1 {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            cancel.cancel();
            Instant::now()
        })
    };

    let err = evaluator.evaluate(&candidates, &cancel).unwrap_err();
    let cancelled_at = canceller.join().unwrap();
    assert!(matches!(err, LinkageError::Interrupted { phase: Phase::Score }));
    assert!(cancelled_at.elapsed() < Duration::from_secs(5));

    let contents = fs::read_to_string(&backup).unwrap();
    let written = contents.lines().count() - 1;
    assert!(written > 0 && written < 50_000);
    for line in contents.lines() {
        assert_eq!(line.split(',').count(), 23);
    }

    let small = fixture.candidates(StrategyKind::B1);
    let config = LinkageConfig::default()
        .with_workers(2)
        .with_chunk_size(1)
        .with_backup_path(&backup);
    let result = evaluate(&config, &fixture.truth, &small);
    assert_eq!(result.backup_rows, 4);
    let contents = fs::read_to_string(&backup).unwrap();
    assert_eq!(contents.lines().count(), 1 + written + 4);
    assert_eq!(
        contents
            .lines()
            .filter(|line| line.ends_with("score,predicted,match"))
            .count(),
        1
    );
}

#[test]
fn test_pipeline_from_json_config() {
    let fixture = Fixture::new();
    let config_path = fixture.path("config.json");
    fs::write(
        &config_path,
        r#"{"strategy": "B1", "workers": 3, "chunk_size": 2, "per_block_stats": true}"#,
    )
    .unwrap();
    let config = LinkageConfig::from_json_file(&config_path).unwrap();
    let pipeline = LinkagePipeline::new(config).unwrap();
    let report = pipeline
        .run(
            &fixture.a,
            &fixture.b,
            fixture.path("pairs.csv"),
            &fixture.truth,
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(report.generation.pairs, 5);
    assert_eq!(report.generation.index_a.excluded, 1);
    assert_eq!(report.evaluation.counts, EXPECTED);
    assert_eq!(report.evaluation.per_block.len(), 2);
    assert_eq!(report.evaluation.per_block["ford|2012"].pairs, 3);
    assert!((report.evaluation.blocking_recall() - 0.8).abs() < 1e-9);
}

#[test]
fn test_missing_truth_file_names_load_phase() {
    let fixture = Fixture::new();
    let pipeline = LinkagePipeline::new(LinkageConfig::default()).unwrap();
    let err = pipeline
        .run(
            &fixture.a,
            &fixture.b,
            fixture.path("pairs.csv"),
            fixture.path("absent.csv"),
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert_eq!(err.phase(), Some(Phase::Load));
    assert!(err.to_string().starts_with("load phase failed"));
}
