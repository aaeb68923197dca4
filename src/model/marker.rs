//! Completeness markers ("has all" records).

use std::fmt;
use std::hash::{Hash, Hasher};

use rusqlite::types::Value;
use serde::Serialize;

use super::{Column, Row, RowValues, SqlType};
use crate::error::StoreError;

/// Records whether the store holds the entire known population of an
/// entity type. Identity is the entity type alone.
#[derive(Debug, Clone, Serialize)]
pub struct CompletenessMarker {
    pub entity_type: String,
    pub complete: bool,
}

impl CompletenessMarker {
    pub fn complete(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            complete: true,
        }
    }
}

impl PartialEq for CompletenessMarker {
    fn eq(&self, other: &Self) -> bool {
        self.entity_type == other.entity_type
    }
}

impl Eq for CompletenessMarker {}

impl Hash for CompletenessMarker {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity_type.hash(state);
    }
}

impl fmt::Display for CompletenessMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.entity_type, self.complete)
    }
}

impl Row for CompletenessMarker {
    const TABLE: &'static str = "hasall";
    const COLUMNS: &'static [Column] = &[
        Column::primary_key("entity_type", SqlType::Text),
        Column::new("has_all", SqlType::Integer),
    ];

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.entity_type.clone()),
            Value::Integer(i64::from(self.complete)),
        ]
    }

    fn from_values(mut values: RowValues) -> Result<Self, StoreError> {
        Ok(Self {
            entity_type: values.next()?,
            complete: values.next()?,
        })
    }
}
