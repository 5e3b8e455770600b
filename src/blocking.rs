use std::fmt;

use ahash::AHashMap;
use tracing::debug;

use crate::config::StrategyKind;
use crate::record::{clean_value, Field, FieldSource, Record};

/// Tuple of normalized field values. Two records are candidates iff their
/// keys are equal; equality is on the literal values, never on a digest.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey(Vec<String>);

impl BlockKey {
    pub fn new(parts: Vec<String>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("|"))
    }
}

/// Cheap value normalization applied to a key component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyNormalizer {
    Identity,
    /// Folds fuel types onto the coarse classes shared by both datasets.
    FuelType,
}

impl KeyNormalizer {
    pub fn apply(self, value: &str) -> String {
        match self {
            KeyNormalizer::Identity => value.to_string(),
            KeyNormalizer::FuelType => normalize_fuel_type(value),
        }
    }
}

/// Map a fuel type onto its lowercase blocking class; unknown values pass
/// through lowercased, so keys compare case-insensitively.
pub fn normalize_fuel_type(value: &str) -> String {
    let value = value.to_lowercase();
    match value.as_str() {
        "flex fuel vehicle" => "gasoline".to_string(),
        "biodiesel" => "diesel".to_string(),
        "compressed natural gas" | "propane" => "other".to_string(),
        _ => value,
    }
}

/// One field of a blocking key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyComponent {
    pub field: Field,
    pub normalizer: KeyNormalizer,
}

impl KeyComponent {
    pub fn raw(field: Field) -> Self {
        Self {
            field,
            normalizer: KeyNormalizer::Identity,
        }
    }

    pub fn normalized(field: Field, normalizer: KeyNormalizer) -> Self {
        Self { field, normalizer }
    }

    /// Column name for this component in candidate files.
    ///
    /// Raw components share the field's own name; normalized components get
    /// a `_key` suffix since the raw value may differ between sides.
    pub fn column_name(&self) -> String {
        match self.normalizer {
            KeyNormalizer::Identity => self.field.name().to_string(),
            KeyNormalizer::FuelType => format!("{}_key", self.field.name()),
        }
    }

    /// True when both sides are guaranteed to carry the same raw value.
    pub fn is_shared(&self) -> bool {
        self.normalizer == KeyNormalizer::Identity
    }
}

/// Key extractor: an ordered list of components.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockingStrategy {
    name: String,
    components: Vec<KeyComponent>,
}

impl BlockingStrategy {
    pub fn new(name: impl Into<String>, components: Vec<KeyComponent>) -> Self {
        Self {
            name: name.into(),
            components,
        }
    }

    /// Exact manufacturer and year.
    pub fn b1() -> Self {
        Self::new(
            "B1",
            vec![
                KeyComponent::raw(Field::Manufacturer),
                KeyComponent::raw(Field::Year),
            ],
        )
    }

    /// Transmission, year and normalized fuel type.
    pub fn b2() -> Self {
        Self::new(
            "B2",
            vec![
                KeyComponent::raw(Field::Transmission),
                KeyComponent::raw(Field::Year),
                KeyComponent::normalized(Field::FuelType, KeyNormalizer::FuelType),
            ],
        )
    }

    pub fn from_kind(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::B1 => Self::b1(),
            StrategyKind::B2 => Self::b2(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn components(&self) -> &[KeyComponent] {
        &self.components
    }

    /// Key columns, in component order.
    pub fn key_columns(&self) -> Vec<String> {
        self.components.iter().map(KeyComponent::column_name).collect()
    }

    /// Fields written once, unprefixed, in candidate files.
    pub fn shared_fields(&self) -> Vec<Field> {
        self.components
            .iter()
            .filter(|component| component.is_shared())
            .map(|component| component.field)
            .collect()
    }

    /// Compute the block key of a record.
    ///
    /// Returns `None` when any key field is missing, so the record is kept
    /// out of every block instead of being joined against everything.
    pub fn key<R: FieldSource>(&self, record: &R) -> Option<BlockKey> {
        let mut parts = Vec::with_capacity(self.components.len());
        for component in &self.components {
            let value = clean_value(record.raw_field(component.field))?;
            parts.push(component.normalizer.apply(value));
        }
        Some(BlockKey(parts))
    }

    /// Partition records into buckets by block key.
    pub fn index(&self, records: impl IntoIterator<Item = Record>) -> BlockIndex {
        let mut index = BlockIndex::default();
        for record in records {
            index.insert(self, record);
        }
        debug!(
            strategy = %self.name,
            buckets = index.len(),
            excluded = index.excluded,
            "built block index"
        );
        index
    }
}

/// Summary of a block index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub buckets: usize,
    pub records: usize,
    pub excluded: usize,
    pub largest_bucket: usize,
}

/// Block key to records, iterated in first-seen key order.
#[derive(Debug, Default)]
pub struct BlockIndex {
    buckets: AHashMap<BlockKey, Vec<Record>>,
    order: Vec<BlockKey>,
    records: usize,
    excluded: usize,
}

impl BlockIndex {
    /// Add one record; records with a null key are only counted.
    pub fn insert(&mut self, strategy: &BlockingStrategy, record: Record) {
        let Some(key) = strategy.key(&record) else {
            self.excluded += 1;
            return;
        };
        self.records += 1;
        if let Some(bucket) = self.buckets.get_mut(&key) {
            bucket.push(record);
        } else {
            self.order.push(key.clone());
            self.buckets.insert(key, vec![record]);
        }
    }

    pub fn get(&self, key: &BlockKey) -> Option<&[Record]> {
        self.buckets.get(key).map(Vec::as_slice)
    }

    /// Buckets in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = (&BlockKey, &[Record])> + '_ {
        self.order
            .iter()
            .filter_map(move |key| self.buckets.get(key).map(|bucket| (key, bucket.as_slice())))
    }

    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn stats(&self) -> BlockStats {
        BlockStats {
            buckets: self.buckets.len(),
            records: self.records,
            excluded: self.excluded,
            largest_bucket: self.buckets.values().map(Vec::len).max().unwrap_or(0),
        }
    }
}
