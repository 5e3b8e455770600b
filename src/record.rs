use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;

/// Number of compared fields.
pub const FIELD_COUNT: usize = 10;

/// The ten vehicle fields compared between the two datasets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Manufacturer,
    Model,
    Year,
    Mileage,
    FuelType,
    Transmission,
    BodyType,
    Cylinders,
    Drive,
    Color,
}

impl Field {
    /// All fields in canonical (identity tuple) order.
    pub const ALL: [Field; FIELD_COUNT] = [
        Field::Manufacturer,
        Field::Model,
        Field::Year,
        Field::Mileage,
        Field::FuelType,
        Field::Transmission,
        Field::BodyType,
        Field::Cylinders,
        Field::Drive,
        Field::Color,
    ];

    /// Column name used by both aligned datasets.
    pub fn name(self) -> &'static str {
        match self {
            Field::Manufacturer => "manufacturer",
            Field::Model => "model",
            Field::Year => "year",
            Field::Mileage => "mileage",
            Field::FuelType => "fuel_type",
            Field::Transmission => "transmission",
            Field::BodyType => "body_type",
            Field::Cylinders => "cylinders",
            Field::Drive => "drive",
            Field::Color => "color",
        }
    }

    /// Position in canonical order.
    pub fn index(self) -> usize {
        match self {
            Field::Manufacturer => 0,
            Field::Model => 1,
            Field::Year => 2,
            Field::Mileage => 3,
            Field::FuelType => 4,
            Field::Transmission => 5,
            Field::BodyType => 6,
            Field::Cylinders => 7,
            Field::Drive => 8,
            Field::Color => 9,
        }
    }

    /// Look a field up by column name (trimmed, case-insensitive).
    pub fn from_name(name: &str) -> Option<Field> {
        let name = name.trim();
        Field::ALL
            .into_iter()
            .find(|field| field.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Apply the missing-value policy to a raw cell.
///
/// Returns the trimmed value, or `None` when the cell is absent, blank or the
/// literal `nan` (any case).
pub fn clean_value(raw: Option<&str>) -> Option<&str> {
    let value = raw?.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(value)
    }
}

/// Anything that can hand out the raw value of a compared field.
pub trait FieldSource {
    fn raw_field(&self, field: Field) -> Option<&str>;
}

/// Column layout of one tabular file.
#[derive(Debug)]
pub struct Schema {
    columns: Vec<String>,
    lookup: AHashMap<String, usize>,
    fields: [Option<usize>; FIELD_COUNT],
}

impl Schema {
    /// Build a schema from header names, resolving the ten compared fields.
    pub fn new(columns: Vec<String>) -> Self {
        let mut lookup = AHashMap::with_capacity(columns.len());
        for (idx, column) in columns.iter().enumerate() {
            lookup
                .entry(column.trim().to_lowercase())
                .or_insert(idx);
        }

        let mut fields = [None; FIELD_COUNT];
        for field in Field::ALL {
            fields[field.index()] = lookup.get(field.name()).copied();
        }

        Self {
            columns,
            lookup,
            fields,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Position of a column by name (trimmed, case-insensitive).
    pub fn position(&self, name: &str) -> Option<usize> {
        self.lookup.get(&name.trim().to_lowercase()).copied()
    }

    /// Position of a compared field, `None` when the file lacks it.
    pub fn field_position(&self, field: Field) -> Option<usize> {
        self.fields[field.index()]
    }

    /// Compared fields this file has no column for.
    pub fn missing_fields(&self) -> Vec<Field> {
        Field::ALL
            .into_iter()
            .filter(|field| self.fields[field.index()].is_none())
            .collect()
    }
}

/// One raw row, all cells kept as strings.
#[derive(Clone, Debug)]
pub struct Record {
    schema: Arc<Schema>,
    values: Vec<String>,
}

impl Record {
    pub fn new(schema: Arc<Schema>, values: Vec<String>) -> Self {
        Self { schema, values }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Raw cell of a compared field; `None` when the column is absent.
    pub fn field(&self, field: Field) -> Option<&str> {
        self.schema
            .field_position(field)
            .and_then(|idx| self.values.get(idx))
            .map(String::as_str)
    }

    /// Raw cell by column name.
    pub fn column(&self, name: &str) -> Option<&str> {
        self.schema
            .position(name)
            .and_then(|idx| self.values.get(idx))
            .map(String::as_str)
    }

    /// Convert into the typed view used for scoring.
    pub fn to_vehicle(&self) -> VehicleRecord {
        let mut vehicle = VehicleRecord::default();
        for field in Field::ALL {
            vehicle.set(field, self.field(field).map(str::to_string));
        }
        vehicle
    }
}

impl FieldSource for Record {
    fn raw_field(&self, field: Field) -> Option<&str> {
        self.field(field)
    }
}

/// Typed view of a listing: one optional raw value per compared field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VehicleRecord {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub year: Option<String>,
    pub mileage: Option<String>,
    pub fuel_type: Option<String>,
    pub transmission: Option<String>,
    pub body_type: Option<String>,
    pub cylinders: Option<String>,
    pub drive: Option<String>,
    pub color: Option<String>,
}

impl VehicleRecord {
    /// Raw value of a field.
    pub fn get(&self, field: Field) -> Option<&str> {
        self.slot(field).as_deref()
    }

    /// Value after the missing-value policy.
    pub fn cleaned(&self, field: Field) -> Option<&str> {
        clean_value(self.get(field))
    }

    pub fn set(&mut self, field: Field, value: Option<String>) {
        *self.slot_mut(field) = value;
    }

    /// Builder-style setter, mostly for fixtures.
    pub fn with(mut self, field: Field, value: impl Into<String>) -> Self {
        self.set(field, Some(value.into()));
        self
    }

    fn slot(&self, field: Field) -> &Option<String> {
        match field {
            Field::Manufacturer => &self.manufacturer,
            Field::Model => &self.model,
            Field::Year => &self.year,
            Field::Mileage => &self.mileage,
            Field::FuelType => &self.fuel_type,
            Field::Transmission => &self.transmission,
            Field::BodyType => &self.body_type,
            Field::Cylinders => &self.cylinders,
            Field::Drive => &self.drive,
            Field::Color => &self.color,
        }
    }

    fn slot_mut(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::Manufacturer => &mut self.manufacturer,
            Field::Model => &mut self.model,
            Field::Year => &mut self.year,
            Field::Mileage => &mut self.mileage,
            Field::FuelType => &mut self.fuel_type,
            Field::Transmission => &mut self.transmission,
            Field::BodyType => &mut self.body_type,
            Field::Cylinders => &mut self.cylinders,
            Field::Drive => &mut self.drive,
            Field::Color => &mut self.color,
        }
    }
}

impl FieldSource for VehicleRecord {
    fn raw_field(&self, field: Field) -> Option<&str> {
        self.get(field)
    }
}
