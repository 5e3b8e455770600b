use ahash::AHashMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::ScoringConfig;
use crate::record::{clean_value, Field, FieldSource, FIELD_COUNT};

// Word tokens of two or more characters, as used by common TF-IDF tokenizers.
static RE_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\w\w+\b").expect("invalid RE_TOKEN"));

/// Fuel types treated as interchangeable.
pub const FUEL_EQUIVALENCES: &[(&str, &str)] =
    &[("flex fuel vehicle", "gasoline"), ("biodiesel", "diesel")];

/// Body types treated as interchangeable.
pub const BODY_EQUIVALENCES: &[(&str, &str)] =
    &[("truck", "pickup"), ("offroad", "suv"), ("offroad", "pickup")];

/// Drive types treated as interchangeable.
pub const DRIVE_EQUIVALENCES: &[(&str, &str)] =
    &[("4wd", "awd"), ("fwd", "4x2"), ("rwd", "4x2")];

const NO_EQUIVALENCES: &[(&str, &str)] = &[];

/// How a field is compared.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RuleKind {
    /// TF-IDF cosine similarity fit on the two values alone.
    TextCosine,
    /// Case-sensitive equality after trimming.
    Exact,
    /// Linear decay with the absolute numeric difference.
    NumericDecay { max_diff: f64 },
    /// Case-insensitive equality with optional partial credit.
    Categorical {
        equivalences: &'static [(&'static str, &'static str)],
        other_credit: bool,
    },
}

fn categorical(equivalences: &'static [(&'static str, &'static str)], other_credit: bool) -> RuleKind {
    RuleKind::Categorical {
        equivalences,
        other_credit,
    }
}

/// One row of the weighted rule table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FieldRule {
    pub field: Field,
    pub max_weight: f64,
    pub kind: RuleKind,
}

/// Every field contribution of one pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreBreakdown {
    pub contributions: [f64; FIELD_COUNT],
    pub total: f64,
}

impl ScoreBreakdown {
    pub fn contribution(&self, field: Field) -> f64 {
        self.contributions[field.index()]
    }
}

/// Weighted, field-aware pair scorer.
///
/// The composite score is the plain sum of the field contributions; each
/// contribution lies in `[0, max_weight]` of its rule.
#[derive(Clone, Debug)]
pub struct FieldScorer {
    rules: Vec<FieldRule>,
    equivalence_credit: f64,
    other_credit: f64,
}

impl Default for FieldScorer {
    fn default() -> Self {
        Self::new(&ScoringConfig::default())
    }
}

impl FieldScorer {
    /// Build the standard vehicle rule table from a scoring configuration.
    pub fn new(config: &ScoringConfig) -> Self {
        let weights = &config.weights;
        let rules = vec![
            FieldRule {
                field: Field::Model,
                max_weight: weights.model,
                kind: RuleKind::TextCosine,
            },
            FieldRule {
                field: Field::Manufacturer,
                max_weight: weights.manufacturer,
                kind: RuleKind::Exact,
            },
            FieldRule {
                field: Field::Year,
                max_weight: weights.year,
                kind: RuleKind::Exact,
            },
            FieldRule {
                field: Field::Mileage,
                max_weight: weights.mileage,
                kind: RuleKind::NumericDecay {
                    max_diff: config.mileage_max_diff,
                },
            },
            FieldRule {
                field: Field::FuelType,
                max_weight: weights.fuel_type,
                kind: categorical(FUEL_EQUIVALENCES, true),
            },
            FieldRule {
                field: Field::Transmission,
                max_weight: weights.transmission,
                kind: RuleKind::Exact,
            },
            FieldRule {
                field: Field::BodyType,
                max_weight: weights.body_type,
                kind: categorical(BODY_EQUIVALENCES, true),
            },
            FieldRule {
                field: Field::Cylinders,
                max_weight: weights.cylinders,
                kind: categorical(NO_EQUIVALENCES, true),
            },
            FieldRule {
                field: Field::Drive,
                max_weight: weights.drive,
                kind: categorical(DRIVE_EQUIVALENCES, false),
            },
            FieldRule {
                field: Field::Color,
                max_weight: weights.color,
                kind: categorical(NO_EQUIVALENCES, false),
            },
        ];
        Self::with_rules(rules, config.equivalence_credit, config.other_credit)
    }

    /// Build a scorer from an arbitrary rule table.
    pub fn with_rules(rules: Vec<FieldRule>, equivalence_credit: f64, other_credit: f64) -> Self {
        Self {
            rules,
            equivalence_credit,
            other_credit,
        }
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    /// Theoretical maximum composite score.
    pub fn max_score(&self) -> f64 {
        self.rules.iter().map(|rule| rule.max_weight).sum()
    }

    /// Whether composite scores stay within `[0, 1]`.
    pub fn is_bounded(&self) -> bool {
        self.max_score() <= 1.0 + 1e-9
    }

    /// Contribution of a single rule for two raw values.
    pub fn score_rule(&self, rule: &FieldRule, a: Option<&str>, b: Option<&str>) -> f64 {
        match rule.kind {
            RuleKind::TextCosine => score_model(a, b, rule.max_weight),
            RuleKind::Exact => score_exact(a, b, rule.max_weight),
            RuleKind::NumericDecay { max_diff } => score_mileage(a, b, rule.max_weight, max_diff),
            RuleKind::Categorical {
                equivalences,
                other_credit,
            } => score_categorical(
                a,
                b,
                rule.max_weight,
                equivalences,
                self.equivalence_credit,
                other_credit.then_some(self.other_credit),
            ),
        }
    }

    /// Composite score of a pair.
    pub fn score<A: FieldSource, B: FieldSource>(&self, a: &A, b: &B) -> f64 {
        self.rules
            .iter()
            .map(|rule| self.score_rule(rule, a.raw_field(rule.field), b.raw_field(rule.field)))
            .sum()
    }

    /// Composite score together with every field contribution.
    pub fn breakdown<A: FieldSource, B: FieldSource>(&self, a: &A, b: &B) -> ScoreBreakdown {
        let mut contributions = [0.0; FIELD_COUNT];
        for rule in &self.rules {
            contributions[rule.field.index()] +=
                self.score_rule(rule, a.raw_field(rule.field), b.raw_field(rule.field));
        }
        ScoreBreakdown {
            contributions,
            total: contributions.iter().sum(),
        }
    }
}

/// Exact string equality after trimming; no partial credit.
pub fn score_exact(a: Option<&str>, b: Option<&str>, max_weight: f64) -> f64 {
    match (clean_value(a), clean_value(b)) {
        (Some(a), Some(b)) if a == b => max_weight,
        _ => 0.0,
    }
}

/// TF-IDF cosine similarity of two model names, scaled by `max_weight`.
pub fn score_model(a: Option<&str>, b: Option<&str>, max_weight: f64) -> f64 {
    match (clean_value(a), clean_value(b)) {
        (Some(a), Some(b)) => tfidf_cosine(a, b) * max_weight,
        _ => 0.0,
    }
}

/// Linear decay: full weight at equal mileage, zero once the difference
/// exceeds `max_diff`. Values that do not parse as numbers score zero.
pub fn score_mileage(a: Option<&str>, b: Option<&str>, max_weight: f64, max_diff: f64) -> f64 {
    let (Some(a), Some(b)) = (parse_number(a), parse_number(b)) else {
        return 0.0;
    };
    let diff = (a.trunc() - b.trunc()).abs();
    if diff > max_diff {
        return 0.0;
    }
    max_weight * (1.0 - diff / max_diff)
}

/// Lowercased categorical comparison.
///
/// Exact match earns the full weight, a declared equivalence (either
/// direction) earns `equivalence_credit` of it, and when `other_credit` is
/// set a literal `other` on either side earns that share.
pub fn score_categorical(
    a: Option<&str>,
    b: Option<&str>,
    max_weight: f64,
    equivalences: &[(&str, &str)],
    equivalence_credit: f64,
    other_credit: Option<f64>,
) -> f64 {
    let (Some(a), Some(b)) = (clean_value(a), clean_value(b)) else {
        return 0.0;
    };
    let a = a.to_lowercase();
    let b = b.to_lowercase();

    if a == b {
        return max_weight;
    }
    let equivalent = equivalences
        .iter()
        .any(|&(x, y)| (a == x && b == y) || (a == y && b == x));
    if equivalent {
        return max_weight * equivalence_credit;
    }
    match other_credit {
        Some(credit) if a == "other" || b == "other" => max_weight * credit,
        _ => 0.0,
    }
}

fn parse_number(raw: Option<&str>) -> Option<f64> {
    clean_value(raw)?
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

fn term_counts(text: &str) -> AHashMap<String, f64> {
    let lowered = text.to_lowercase();
    let mut counts = AHashMap::new();
    for token in RE_TOKEN.find_iter(&lowered) {
        *counts.entry(token.as_str().to_string()).or_insert(0.0) += 1.0;
    }
    counts
}

/// Cosine similarity of two strings under a TF-IDF model fit on just them.
///
/// Smoothed idf (`ln(3 / (1 + df)) + 1`), raw term counts, l2 norm. A string
/// without any token has a zero vector and similarity 0.
pub fn tfidf_cosine(a: &str, b: &str) -> f64 {
    let counts_a = term_counts(a);
    let counts_b = term_counts(b);
    if counts_a.is_empty() || counts_b.is_empty() {
        return 0.0;
    }

    let idf = |term: &str| {
        let df = if counts_a.contains_key(term) && counts_b.contains_key(term) {
            2.0
        } else {
            1.0
        };
        (3.0_f64 / (1.0 + df)).ln() + 1.0
    };

    let norm = |counts: &AHashMap<String, f64>| {
        counts
            .iter()
            .map(|(term, tf)| (tf * idf(term.as_str())).powi(2))
            .sum::<f64>()
            .sqrt()
    };

    let dot: f64 = counts_a
        .iter()
        .filter_map(|(term, tf_a)| {
            counts_b.get(term).map(|tf_b| {
                let weight = idf(term.as_str());
                tf_a * weight * tf_b * weight
            })
        })
        .sum();

    let denom = norm(&counts_a) * norm(&counts_b);
    if denom == 0.0 {
        return 0.0;
    }
    (dot / denom).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldWeights;
    use crate::record::VehicleRecord;

    fn camry() -> VehicleRecord {
        VehicleRecord::default()
            .with(Field::Manufacturer, "toyota")
            .with(Field::Model, "camry")
            .with(Field::Year, "2015")
            .with(Field::Mileage, "50000")
            .with(Field::FuelType, "gasoline")
            .with(Field::Transmission, "automatic")
            .with(Field::BodyType, "sedan")
            .with(Field::Cylinders, "4")
            .with(Field::Drive, "fwd")
            .with(Field::Color, "white")
    }

    #[test]
    fn test_tfidf_identical() {
        assert!((tfidf_cosine("camry", "camry") - 1.0).abs() < 1e-9);
        assert!((tfidf_cosine("camry le", "le camry") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_tfidf_disjoint() {
        assert!(tfidf_cosine("camry", "corolla").abs() < 1e-12);
    }

    #[test]
    fn test_tfidf_partial_overlap() {
        // Shared term idf = 1, unique terms idf = ln(1.5) + 1.
        let unique = 1.5_f64.ln() + 1.0;
        let expected = 1.0 / (1.0 + unique * unique);
        let score = tfidf_cosine("civic lx", "civic ex");
        assert!((score - expected).abs() < 1e-9);
        assert!(score > 0.0 && score < 1.0);
    }

    #[test]
    fn test_tfidf_single_char_tokens_ignored() {
        // "3" alone yields no token, so there is nothing to compare.
        assert!(tfidf_cosine("3", "3").abs() < 1e-12);
        assert!((tfidf_cosine("Mazda 3", "mazda") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_exact_is_case_sensitive() {
        assert!((score_exact(Some(" ford "), Some("ford"), 0.2) - 0.2).abs() < 1e-12);
        assert!(score_exact(Some("Ford"), Some("ford"), 0.2).abs() < 1e-12);
        assert!(score_exact(Some("ford"), None, 0.2).abs() < 1e-12);
        assert!(score_exact(Some("nan"), Some("nan"), 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_score_mileage_decay() {
        let score = score_mileage(Some("50000"), Some("52000"), 0.1, 50_000.0);
        assert!((score - 0.096).abs() < 1e-12);
        assert!((score_mileage(Some("1000.7"), Some("1000.2"), 0.1, 50_000.0) - 0.1).abs() < 1e-12);
        assert!(score_mileage(Some("0"), Some("60000"), 0.1, 50_000.0).abs() < 1e-12);
        assert!(score_mileage(Some("0"), Some("50000"), 0.1, 50_000.0).abs() < 1e-12);
        assert!(score_mileage(Some("abc"), Some("10"), 0.1, 50_000.0).abs() < 1e-12);
        assert!(score_mileage(Some("nan"), Some("10"), 0.1, 50_000.0).abs() < 1e-12);
        assert!(score_mileage(None, Some("10"), 0.1, 50_000.0).abs() < 1e-12);
    }

    #[test]
    fn test_body_type_equivalence() {
        let scorer = FieldScorer::default();
        let a = VehicleRecord::default().with(Field::BodyType, "truck");
        let b = VehicleRecord::default().with(Field::BodyType, "pickup");
        let breakdown = scorer.breakdown(&a, &b);
        assert!((breakdown.contribution(Field::BodyType) - 0.04).abs() < 1e-12);
        assert!((scorer.breakdown(&b, &a).contribution(Field::BodyType) - 0.04).abs() < 1e-12);
    }

    #[test]
    fn test_fuel_other_partial_credit() {
        let scorer = FieldScorer::default();
        let a = VehicleRecord::default().with(Field::FuelType, "other");
        let b = VehicleRecord::default().with(Field::FuelType, "diesel");
        let breakdown = scorer.breakdown(&a, &b);
        assert!((breakdown.contribution(Field::FuelType) - 0.015).abs() < 1e-12);

        let c = VehicleRecord::default().with(Field::FuelType, "Biodiesel");
        let breakdown = scorer.breakdown(&c, &b);
        assert!((breakdown.contribution(Field::FuelType) - 0.04).abs() < 1e-12);
    }

    #[test]
    fn test_drive_and_color_rules() {
        assert!(
            (score_categorical(Some("4WD"), Some("awd"), 0.02, DRIVE_EQUIVALENCES, 0.8, None)
                - 0.016)
                .abs()
                < 1e-12
        );
        assert!(score_categorical(Some("other"), Some("awd"), 0.02, DRIVE_EQUIVALENCES, 0.8, None)
            .abs()
            < 1e-12);
        assert!(
            (score_categorical(Some("White"), Some("white"), 0.02, &[], 0.8, None) - 0.02).abs()
                < 1e-12
        );
        assert!(score_categorical(Some("white"), Some("silver"), 0.02, &[], 0.8, None).abs() < 1e-12);
    }

    #[test]
    fn test_cylinders_other() {
        assert!(
            (score_categorical(Some("other"), Some("6"), 0.03, &[], 0.8, Some(0.3)) - 0.009).abs()
                < 1e-12
        );
        assert!(score_categorical(Some("4"), Some("6"), 0.03, &[], 0.8, Some(0.3)).abs() < 1e-12);
    }

    #[test]
    fn test_reference_pair_scores_expected_total() {
        let scorer = FieldScorer::default();
        let a = camry();
        let b = camry().with(Field::Mileage, "52000");
        let breakdown = scorer.breakdown(&a, &b);
        assert!((breakdown.contribution(Field::Model) - 0.5).abs() < 1e-9);
        assert!((breakdown.contribution(Field::Manufacturer) - 0.2).abs() < 1e-12);
        assert!((breakdown.contribution(Field::Mileage) - 0.096).abs() < 1e-12);
        assert!((breakdown.total - 1.116).abs() < 1e-9);
        assert!((scorer.score(&a, &b) - breakdown.total).abs() < 1e-12);
        assert!(breakdown.total >= 0.70);
    }

    #[test]
    fn test_bounded_only_when_weights_fit() {
        assert!(!FieldScorer::default().is_bounded());
        let weights = FieldWeights {
            model: 0.38,
            ..FieldWeights::default()
        };
        let config = ScoringConfig::default().with_weights(weights);
        assert!(FieldScorer::new(&config).is_bounded());
    }

    #[test]
    fn test_identical_pair_reaches_max() {
        let scorer = FieldScorer::default();
        let total = scorer.score(&camry(), &camry());
        assert!((total - scorer.max_score()).abs() < 1e-9);
    }

    #[test]
    fn test_contributions_bounded_by_weight() {
        let scorer = FieldScorer::default();
        let a = camry();
        let b = VehicleRecord::default()
            .with(Field::Manufacturer, "toyota")
            .with(Field::Model, "camry hybrid")
            .with(Field::Year, "2016")
            .with(Field::Mileage, "49000")
            .with(Field::FuelType, "other")
            .with(Field::BodyType, "other")
            .with(Field::Drive, "4x2");
        let breakdown = scorer.breakdown(&a, &b);
        for rule in scorer.rules() {
            let value = breakdown.contribution(rule.field);
            assert!(value >= 0.0 && value <= rule.max_weight + 1e-12, "{}", rule.field);
        }
        assert!(breakdown.total <= scorer.max_score());
    }

    #[test]
    fn test_blanking_a_field_never_increases_score() {
        let scorer = FieldScorer::default();
        let a = camry();
        let b = camry().with(Field::Mileage, "51000");
        let base = scorer.score(&a, &b);
        for field in Field::ALL {
            let mut blank_a = a.clone();
            blank_a.set(field, Some(String::new()));
            assert!(scorer.score(&blank_a, &b) <= base + 1e-12, "{field}");
            let mut blank_b = b.clone();
            blank_b.set(field, None);
            assert!(scorer.score(&a, &blank_b) <= base + 1e-12, "{field}");
        }
    }
}
