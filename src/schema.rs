//! Result schema description and the schema-compatibility validator (§4.6).
//!
//! Grounded on `backend/pool/connection/multi_shard/validator.rs`: a
//! first-reader-wins ground truth compared structurally against every
//! subsequent reader, plus the same "null schema must stay null" rule
//! generalized from its row-description special case.

use crate::endpoint::ShardEndpoint;
use crate::error::{Error, InternalKind, SchemaMismatch};

/// Declared (engine-level) type of a result column. Deliberately a small
/// closed set rather than provider type OIDs, since the shard client is an
/// external abstraction (§1, §4.1) and value kinds are limited to
/// [`crate::Value`]'s variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaredType {
    Boolean,
    Integer,
    Float,
    Text,
    Bytes,
}

/// One result column's shape, as reported by the shard client (§4.1).
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub declared_type: DeclaredType,
    pub data_type_name: String,
    pub allow_null: bool,
    pub max_length: Option<i32>,
    pub provider_type: Option<i32>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, declared_type: DeclaredType, data_type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared_type,
            data_type_name: data_type_name.into(),
            allow_null: true,
            max_length: None,
            provider_type: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.allow_null = false;
        self
    }

    pub fn with_max_length(mut self, max_length: i32) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

/// The shape of one shard's result set (§3 "schema table"). `None` at the
/// client level represents a reader with no schema information at all
/// (§4.6 "null-schema" case), which is not the same as an empty column list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaTable(pub Vec<ColumnDescriptor>);

impl SchemaTable {
    pub fn new(columns: Vec<ColumnDescriptor>) -> Self {
        Self(columns)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.0
    }

    /// The schema table with the synthetic shard-name column appended at
    /// the end (§3: "occupies the ordinal equal to the number of
    /// underlying result columns").
    pub fn with_synthetic_column(&self) -> SchemaTable {
        let mut columns = self.0.clone();
        columns.push(
            ColumnDescriptor::new("$ShardName", DeclaredType::Text, "text").not_null(),
        );
        SchemaTable(columns)
    }
}

#[derive(Debug, Default)]
enum GroundTruth {
    #[default]
    Empty,
    NonNull(SchemaTable),
    Null,
}

/// Establishes ground truth from the first non-empty observation and
/// structurally validates every later one against it (§4.6). Used
/// sequentially by the merged-reader constructor over the collected set of
/// labeled readers — not shared across the concurrent per-shard executors.
#[derive(Debug, Default)]
pub struct SchemaValidator {
    ground_truth: GroundTruth,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate one shard's schema against the running ground truth,
    /// establishing it if this is the first observation.
    pub fn validate(&mut self, shard: &ShardEndpoint, schema: Option<&SchemaTable>) -> Result<(), Error> {
        match (&self.ground_truth, schema) {
            (GroundTruth::Empty, Some(s)) => {
                self.ground_truth = GroundTruth::NonNull(s.clone());
                Ok(())
            }
            (GroundTruth::Empty, None) => {
                self.ground_truth = GroundTruth::Null;
                Ok(())
            }
            (GroundTruth::NonNull(truth), Some(s)) => compare(shard, truth, s),
            (GroundTruth::NonNull(_), None) => Err(Error::Internal(InternalKind::MixedNullSchema {
                shard: shard.clone(),
            })),
            (GroundTruth::Null, None) => Ok(()),
            (GroundTruth::Null, Some(_)) => Err(Error::Internal(InternalKind::MixedNullSchema {
                shard: shard.clone(),
            })),
        }
    }

    /// The ground-truth schema, if any non-null schema has been observed.
    pub fn ground_truth(&self) -> Option<&SchemaTable> {
        match &self.ground_truth {
            GroundTruth::NonNull(s) => Some(s),
            _ => None,
        }
    }
}

fn compare(shard: &ShardEndpoint, truth: &SchemaTable, candidate: &SchemaTable) -> Result<(), Error> {
    if truth.len() != candidate.len() {
        return Err(Error::SchemaMismatch(SchemaMismatch {
            shard: shard.clone(),
            detail: format!(
                "expected {} columns, got {}",
                truth.len(),
                candidate.len()
            ),
        }));
    }

    for (ordinal, (expected, actual)) in truth.columns().iter().zip(candidate.columns()).enumerate() {
        if expected.name != actual.name {
            return Err(mismatch(shard, ordinal, "name", &expected.name, &actual.name));
        }
        if expected.declared_type != actual.declared_type {
            return Err(mismatch(
                shard,
                ordinal,
                "declared type",
                &format!("{:?}", expected.declared_type),
                &format!("{:?}", actual.declared_type),
            ));
        }
        if expected.allow_null != actual.allow_null {
            return Err(mismatch(
                shard,
                ordinal,
                "nullability",
                &expected.allow_null.to_string(),
                &actual.allow_null.to_string(),
            ));
        }
        if expected.max_length != actual.max_length {
            return Err(mismatch(
                shard,
                ordinal,
                "max length",
                &format!("{:?}", expected.max_length),
                &format!("{:?}", actual.max_length),
            ));
        }
    }

    Ok(())
}

fn mismatch(shard: &ShardEndpoint, ordinal: usize, field: &str, expected: &str, actual: &str) -> Error {
    Error::SchemaMismatch(SchemaMismatch {
        shard: shard.clone(),
        detail: format!("column {ordinal} {field} differs: expected {expected}, got {actual}"),
    })
}
