//! Relation schemas seen on the stream and the row transform that uses them.
//!
//! The server sends a Relation message before the first row change of a
//! table in a session and again whenever that table's schema changes, so the
//! cache only ever grows or replaces entries.

use std::collections::HashMap;

use super::decoder::{ColumnInfo, ColumnValue, LogicalMessage, RelationInfo, TupleData};
use super::types::{binary_to_hex, parse_postgres_value, ChangeEvent, ChangeOperation, Row};
use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct RelationCache {
    relations: HashMap<u32, RelationInfo>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores or replaces the schema for `relation.id`.
    pub fn insert(&mut self, relation: RelationInfo) {
        self.relations.insert(relation.id, relation);
    }

    pub fn get(&self, relation_id: u32) -> Option<&RelationInfo> {
        self.relations.get(&relation_id)
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    /// Turns an Insert, Update or Delete into a [`ChangeEvent`]; any other
    /// message yields `None`.
    ///
    /// A row change for a relation id that has not been described is an
    /// [`Error::UnknownRelation`].
    pub fn transform(&self, message: &LogicalMessage) -> Result<Option<ChangeEvent>> {
        let (op, relation_id, old_tuple, new_tuple) = match message {
            LogicalMessage::Insert {
                relation_id,
                tuple_data,
            } => (ChangeOperation::Insert, *relation_id, None, Some(tuple_data)),
            LogicalMessage::Update {
                relation_id,
                old_tuple_data,
                tuple_data,
            } => (
                ChangeOperation::Update,
                *relation_id,
                old_tuple_data.as_ref(),
                Some(tuple_data),
            ),
            LogicalMessage::Delete {
                relation_id,
                old_tuple_data,
            } => (ChangeOperation::Delete, *relation_id, Some(old_tuple_data), None),
            _ => return Ok(None),
        };

        let relation = self
            .get(relation_id)
            .ok_or(Error::UnknownRelation(relation_id))?;

        let old_row = old_tuple
            .map(|tuple| tuple_to_row(tuple, &relation.columns))
            .transpose()?;
        let new_row = new_tuple
            .map(|tuple| tuple_to_row(tuple, &relation.columns))
            .transpose()?;

        Ok(Some(ChangeEvent {
            op,
            schema: relation.namespace.clone(),
            table: relation.name.clone(),
            old_row,
            new_row,
        }))
    }
}

fn tuple_to_row(tuple: &TupleData, columns: &[ColumnInfo]) -> Result<Row> {
    if tuple.len() != columns.len() {
        return Err(Error::InvalidMessage {
            message: format!("Column count mismatch: {} vs {}", tuple.len(), columns.len()),
        });
    }

    let mut row = Row::new();
    for (column, value) in columns.iter().zip(tuple) {
        let value = match value {
            ColumnValue::Null => serde_json::Value::Null,
            // Unchanged TOAST values are not resent; leave the column out.
            ColumnValue::Unchanged => continue,
            ColumnValue::Text(text) => parse_postgres_value(text, column.type_id),
            ColumnValue::Binary(raw) => binary_to_hex(raw),
        };
        row.insert(column.name.clone(), value);
    }
    Ok(row)
}
