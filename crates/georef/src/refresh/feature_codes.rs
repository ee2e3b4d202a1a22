//! Feature code lookup table
//!
//! Input lines look like `A.ADM1\tfirst-order administrative division\tdescription`.
//! The dotted identifier splits into feature class and feature code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::lookup::{LookupSchema, RawRecord};
use crate::error::ValidationError;
use crate::store::SqlValue;

const FIELD_COUNT: usize = 3;

const COLUMNS: &[&str] = &[
    "feature_class",
    "feature_code",
    "name",
    "description",
    "language_code",
    "created_at",
    "updated_at",
];

/// One validated feature code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureCode {
    pub feature_class: String,
    pub feature_code: String,
    pub name: String,
    pub description: String,
    pub language_code: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Split `A.ADM1` into `("A", "ADM1")`; exactly two non-empty segments
fn split_identifier(identifier: &str) -> Option<(&str, &str)> {
    let (class, code) = identifier.split_once('.')?;
    if class.is_empty() || code.is_empty() || code.contains('.') {
        return None;
    }
    Some((class, code))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureCodeSchema;

impl LookupSchema for FeatureCodeSchema {
    type Record = FeatureCode;

    fn dataset(&self) -> &'static str {
        "feature_codes"
    }

    fn columns(&self) -> &'static [&'static str] {
        COLUMNS
    }

    fn validate(&self, raw: &RawRecord) -> Result<(), ValidationError> {
        if raw.fields.len() != FIELD_COUNT {
            return Err(ValidationError::FieldCount {
                expected: FIELD_COUNT,
                found: raw.fields.len(),
            });
        }
        match split_identifier(&raw.fields[0]) {
            Some(_) => Ok(()),
            None => Err(ValidationError::Identifier(raw.fields[0].clone())),
        }
    }

    fn transform(&self, raw: RawRecord, language_code: &str, at: DateTime<Utc>) -> FeatureCode {
        let mut fields = raw.fields.into_iter();
        let identifier = fields.next().unwrap_or_default();
        let name = fields.next().unwrap_or_default();
        let description = fields.next().unwrap_or_default();
        let (feature_class, feature_code) = split_identifier(&identifier).unwrap_or_default();

        FeatureCode {
            feature_class: feature_class.to_string(),
            feature_code: feature_code.to_string(),
            name,
            description,
            language_code: language_code.to_string(),
            created_at: at,
            updated_at: at,
        }
    }

    fn to_row(&self, record: &FeatureCode) -> Vec<SqlValue> {
        vec![
            SqlValue::Text(record.feature_class.clone()),
            SqlValue::Text(record.feature_code.clone()),
            SqlValue::Text(record.name.clone()),
            SqlValue::Text(record.description.clone()),
            SqlValue::Text(record.language_code.clone()),
            SqlValue::Timestamp(record.created_at),
            SqlValue::Timestamp(record.updated_at),
        ]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_admin_division() {
        let at = Utc::now();
        let raw = RawRecord::parse(
            1,
            "A.ADM1\tfirst-order admin division\tan administrative division",
        );
        let schema = FeatureCodeSchema;
        schema.validate(&raw).unwrap();

        let record = schema.transform(raw, "en", at);
        assert_eq!(record.feature_class, "A");
        assert_eq!(record.feature_code, "ADM1");
        assert_eq!(record.name, "first-order admin division");
        assert_eq!(record.description, "an administrative division");
        assert_eq!(record.language_code, "en");
        assert_eq!(record.created_at, at);
    }

    #[test]
    fn test_validation_failures() {
        let schema = FeatureCodeSchema;
        let cases = [
            ("null\tnot available", ValidationError::FieldCount { expected: 3, found: 2 }),
            ("null\tnot available\t", ValidationError::Identifier("null".to_string())),
            ("A.\tname\tdesc", ValidationError::Identifier("A.".to_string())),
            (".ADM1\tname\tdesc", ValidationError::Identifier(".ADM1".to_string())),
            ("A.ADM.1\tname\tdesc", ValidationError::Identifier("A.ADM.1".to_string())),
        ];
        for (line, expected) in cases {
            assert_eq!(schema.validate(&RawRecord::parse(1, line)).unwrap_err(), expected);
        }
    }

    #[test]
    fn test_row_follows_columns() {
        let schema = FeatureCodeSchema;
        let record = schema.transform(RawRecord::parse(1, "P.PPL\tpopulated place\t"), "en", Utc::now());
        let row = schema.to_row(&record);
        assert_eq!(row.len(), schema.columns().len());
        assert_eq!(row[3], SqlValue::Text(String::new()));
    }
}
