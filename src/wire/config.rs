/// Field mapping and codec settings shared by encoder and decoder.
///
/// Both ends of a replication stream agree out of band on which numeric field
/// id stands for which column. The encoder holds the column -> id direction
/// ([`FieldMapping`]); the decoder holds its inverse ([`FieldIndex`]).
///
/// A mapping serializes as a plain JSON object:
///
/// ```
/// use reactive_tables::wire::FieldMapping;
///
/// let mapping = FieldMapping::from_json(r#"{ "symbol": 1, "price": 2 }"#).unwrap();
/// let index = mapping.inverse();
/// assert_eq!(mapping.field_id("price"), Some(2));
/// assert_eq!(index.column(1), Some("symbol"));
/// ```

use crate::error::{Error, Result};
use crate::table::Schema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

/// Largest frame body accepted by default (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Column name -> wire field id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapping {
    fields: BTreeMap<String, u16>,
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a column to a field id, replacing any previous id for the column.
    pub fn with_field(mut self, column: &str, field_id: u16) -> Self {
        self.fields.insert(column.to_string(), field_id);
        self
    }

    /// Number every column of a schema from 1 in schema order.
    pub fn for_schema(schema: &Schema) -> Self {
        let fields = schema
            .column_names()
            .into_iter()
            .zip(1u16..)
            .map(|(name, id)| (name.to_string(), id))
            .collect();
        FieldMapping { fields }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let mapping: FieldMapping = serde_json::from_str(json)?;
        mapping.validate()?;
        Ok(mapping)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_id(&self, column: &str) -> Option<u16> {
        self.fields.get(column).copied()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, u16)> {
        self.fields.iter().map(|(name, id)| (name.as_str(), *id))
    }

    /// Every field id must identify exactly one column.
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashMap<u16, &str> = HashMap::new();
        for (column, id) in &self.fields {
            if let Some(other) = seen.insert(*id, column) {
                return Err(Error::Config(format!(
                    "Field id {} is mapped to both '{}' and '{}'",
                    id, other, column
                )));
            }
        }
        Ok(())
    }

    /// Check that every mapped column exists in `schema`.
    pub fn check_schema(&self, schema: &Schema) -> Result<()> {
        match self.fields.keys().find(|c| schema.column_type(c).is_none()) {
            Some(missing) => Err(Error::UnknownColumn(missing.clone())),
            None => Ok(()),
        }
    }

    /// The decoder's view of this mapping.
    ///
    /// If two columns share an id, the later one in name order wins; call
    /// [`validate`](Self::validate) first to rule that out.
    pub fn inverse(&self) -> FieldIndex {
        FieldIndex {
            columns: self
                .fields
                .iter()
                .map(|(name, id)| (*id, name.clone()))
                .collect(),
        }
    }
}

/// Wire field id -> column name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldIndex {
    columns: HashMap<u16, String>,
}

impl FieldIndex {
    pub fn column(&self, field_id: u16) -> Option<&str> {
        self.columns.get(&field_id).map(|c| c.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn check_schema(&self, schema: &Schema) -> Result<()> {
        match self.columns.values().find(|c| schema.column_type(c).is_none()) {
            Some(missing) => Err(Error::UnknownColumn(missing.clone())),
            None => Ok(()),
        }
    }
}

/// Decoder settings.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub fields: FieldIndex,
    /// Frames with a longer body are a protocol error
    pub max_frame_len: usize,
    /// Upper bound on how long a blocked read delays noticing a stop request
    pub poll_interval: Duration,
}

impl DecoderConfig {
    pub fn new(mapping: &FieldMapping) -> Result<Self> {
        mapping.validate()?;
        Ok(DecoderConfig {
            fields: mapping.inverse(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            poll_interval: Duration::from_millis(100),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColumnType;

    #[test]
    fn test_for_schema_and_inverse() {
        let schema = Schema::new(vec![
            ("a".to_string(), ColumnType::Int32),
            ("b".to_string(), ColumnType::String),
        ]);
        let mapping = FieldMapping::for_schema(&schema);
        assert_eq!(mapping.field_id("a"), Some(1));
        assert_eq!(mapping.field_id("b"), Some(2));

        let index = mapping.inverse();
        assert_eq!(index.column(2), Some("b"));
        assert_eq!(index.column(3), None);
        assert!(mapping.check_schema(&schema).is_ok());
        assert!(index.check_schema(&schema).is_ok());
    }

    #[test]
    fn test_duplicate_field_ids_rejected() {
        let err = FieldMapping::from_json(r#"{ "a": 1, "b": 1 }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let mapping = FieldMapping::new().with_field("a", 4).with_field("b", 4);
        assert!(DecoderConfig::new(&mapping).is_err());
    }

    #[test]
    fn test_json_round_trip_and_bad_json() {
        let mapping = FieldMapping::new().with_field("qty", 3).with_field("px", 9);
        let parsed = FieldMapping::from_json(&mapping.to_json().unwrap()).unwrap();
        assert_eq!(parsed, mapping);

        assert!(matches!(FieldMapping::from_json("[1, 2]"), Err(Error::Json(_))));
    }

    #[test]
    fn test_unknown_columns_detected() {
        let schema = Schema::new(vec![("a".to_string(), ColumnType::Int32)]);
        let mapping = FieldMapping::new().with_field("a", 1).with_field("zzz", 2);
        assert!(matches!(mapping.check_schema(&schema), Err(Error::UnknownColumn(ref c)) if c == "zzz"));
        assert!(matches!(
            mapping.inverse().check_schema(&schema),
            Err(Error::UnknownColumn(_))
        ));
    }
}
