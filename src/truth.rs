use std::path::Path;

use ahash::AHashMap;
use tracing::{info, warn};

use crate::error::{LinkageError, Phase, Result};
use crate::record::{clean_value, Field, FieldSource};
use crate::stream::RecordStream;

/// Canonical identity of a pair: the ten compared values of side A followed
/// by the ten of side B, missing values as empty strings.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IdentityTuple(Box<[String]>);

impl IdentityTuple {
    /// Build from twenty values, side A first. Each value goes through the
    /// missing-value policy.
    pub fn from_values<'a>(values: impl IntoIterator<Item = Option<&'a str>>) -> Self {
        Self(
            values
                .into_iter()
                .map(|value| clean_value(value).unwrap_or("").to_string())
                .collect(),
        )
    }

    /// Identity of a pair of records.
    pub fn from_sides<A: FieldSource, B: FieldSource>(a: &A, b: &B) -> Self {
        Self::from_values(
            Field::ALL
                .iter()
                .map(|&field| a.raw_field(field))
                .chain(Field::ALL.iter().map(|&field| b.raw_field(field))),
        )
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }

    /// Column names matching `values`, in ground-truth file naming.
    pub fn column_names() -> Vec<String> {
        let side_a = Field::ALL.iter().map(|field| format!("a_{}", field.name()));
        let side_b = Field::ALL.iter().map(|field| format!("b_{}", field.name()));
        side_a.chain(side_b).collect()
    }
}

/// Label and stable id of a ground-truth pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TruthEntry {
    pub id: usize,
    pub is_match: bool,
}

/// Resident lookup from identity tuple to true label.
///
/// Built once per evaluation run and never mutated afterwards. Duplicate
/// identities keep their first id and the last label seen.
#[derive(Debug, Default)]
pub struct GroundTruthIndex {
    entries: AHashMap<IdentityTuple, TruthEntry>,
    labels: Vec<bool>,
}

impl GroundTruthIndex {
    pub fn build(rows: impl IntoIterator<Item = (IdentityTuple, bool)>) -> Self {
        let mut index = Self::default();
        for (identity, is_match) in rows {
            index.insert(identity, is_match);
        }
        index
    }

    fn insert(&mut self, identity: IdentityTuple, is_match: bool) {
        if let Some(entry) = self.entries.get_mut(&identity) {
            entry.is_match = is_match;
            self.labels[entry.id] = is_match;
            return;
        }
        let id = self.labels.len();
        self.labels.push(is_match);
        self.entries.insert(identity, TruthEntry { id, is_match });
    }

    /// Load a ground-truth CSV with `a_<field>`, `b_<field>` and `match`
    /// columns.
    ///
    /// A missing field column reads as empty for every row; a missing `match`
    /// column is fatal. Rows with an unreadable label are skipped.
    pub fn load(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let stream = RecordStream::open(path, chunk_size, Phase::Load)?;
        let schema = stream.schema().clone();

        let label_idx = schema
            .position("match")
            .ok_or_else(|| LinkageError::MissingColumn {
                phase: Phase::Load,
                path: path.to_path_buf(),
                column: "match".to_string(),
            })?;

        let columns = IdentityTuple::column_names();
        let positions: Vec<Option<usize>> = columns.iter().map(|c| schema.position(c)).collect();
        let missing: Vec<&str> = columns
            .iter()
            .zip(&positions)
            .filter(|(_, pos)| pos.is_none())
            .map(|(name, _)| name.as_str())
            .collect();
        if !missing.is_empty() {
            warn!(path = %path.display(), ?missing, "ground truth lacks columns, reading them as empty");
        }

        let mut index = Self::default();
        let mut unlabeled = 0usize;
        for chunk in stream {
            for record in chunk?.records {
                let values = record.values();
                let Some(is_match) = values.get(label_idx).and_then(|v| parse_label(v)) else {
                    unlabeled += 1;
                    continue;
                };
                let identity = IdentityTuple::from_values(
                    positions
                        .iter()
                        .map(|pos| pos.and_then(|idx| values.get(idx)).map(String::as_str)),
                );
                index.insert(identity, is_match);
            }
        }

        if unlabeled > 0 {
            warn!(path = %path.display(), unlabeled, "skipped ground-truth rows without a 0/1 label");
        }
        info!(
            path = %path.display(),
            pairs = index.len(),
            matches = index.positives(),
            "loaded ground truth"
        );
        Ok(index)
    }

    pub fn get(&self, identity: &IdentityTuple) -> Option<TruthEntry> {
        self.entries.get(identity).copied()
    }

    /// Label of an entry by id.
    pub fn label(&self, id: usize) -> Option<bool> {
        self.labels.get(id).copied()
    }

    /// Labels indexed by entry id.
    pub fn labels(&self) -> &[bool] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of pairs labelled as matches.
    pub fn positives(&self) -> usize {
        self.labels.iter().filter(|&&label| label).count()
    }
}

fn parse_label(raw: &str) -> Option<bool> {
    match raw.trim() {
        "1" | "1.0" | "True" | "true" => Some(true),
        "0" | "0.0" | "False" | "false" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::VehicleRecord;
    use std::fs;

    #[test]
    fn test_identity_from_sides() {
        let a = VehicleRecord::default()
            .with(Field::Manufacturer, "ford")
            .with(Field::Color, "nan");
        let b = VehicleRecord::default().with(Field::Manufacturer, " ford ");
        let identity = IdentityTuple::from_sides(&a, &b);
        assert_eq!(identity.values().len(), 20);
        assert_eq!(identity.values()[0], "ford");
        assert_eq!(identity.values()[9], "");
        assert_eq!(identity.values()[10], "ford");
        assert_eq!(IdentityTuple::column_names()[10], "b_manufacturer");
    }

    #[test]
    fn test_build_keeps_first_id_last_label() {
        let key = IdentityTuple::from_values(vec![Some("x"); 20]);
        let other = IdentityTuple::from_values(vec![Some("y"); 20]);
        let index = GroundTruthIndex::build(vec![
            (key.clone(), true),
            (other.clone(), false),
            (key.clone(), false),
        ]);
        assert_eq!(index.len(), 2);
        assert_eq!(
            index.get(&key),
            Some(TruthEntry {
                id: 0,
                is_match: false
            })
        );
        assert_eq!(index.get(&other).map(|e| e.id), Some(1));
        assert_eq!(index.positives(), 0);
    }

    #[test]
    fn test_load_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truth.csv");
        let mut header: Vec<String> = IdentityTuple::column_names();
        header.push("match".to_string());
        let row_match: Vec<&str> = vec![
            "ford", "f-150", "2012", "90000", "gasoline", "automatic", "pickup", "6", "4wd",
            "white", "ford", "f-150 xlt", "2012", "91000", "gasoline", "automatic", "truck", "6",
            "4wd", "white", "1",
        ];
        let mut row_other = row_match.clone();
        row_other[20] = "0";
        row_other[1] = "focus";
        let mut row_bad = row_match.clone();
        row_bad[20] = "maybe";
        let contents = [header.join(","), row_match.join(","), row_other.join(","), row_bad.join(",")]
            .join("\n");
        fs::write(&path, contents).unwrap();

        let index = GroundTruthIndex::load(&path, 2).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.positives(), 1);
        let identity = IdentityTuple::from_values(row_match[..20].iter().map(|v| Some(*v)));
        assert_eq!(index.get(&identity).map(|e| e.is_match), Some(true));
    }

    #[test]
    fn test_load_requires_match_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truth.csv");
        fs::write(&path, "a_manufacturer,b_manufacturer\nford,ford\n").unwrap();
        let err = GroundTruthIndex::load(&path, 10).unwrap_err();
        assert!(matches!(err, LinkageError::MissingColumn { ref column, .. } if column == "match"));
    }
}
