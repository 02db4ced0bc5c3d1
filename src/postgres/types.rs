use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Column name to value for one tuple.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// One row-level change, ready for the downstream hooks.
///
/// `old_row` and `new_row` are `None` when the stream carried no image for
/// that side of the change, which is different from an empty row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: ChangeOperation,
    pub schema: String,
    pub table: String,
    pub old_row: Option<Row>,
    pub new_row: Option<Row>,
}

impl ChangeEvent {
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// Types a text-format column value by its type OID.
pub fn parse_postgres_value(text: &str, type_id: u32) -> Value {
    match type_id {
        16 => {
            // bool
            match text {
                "t" => Value::Bool(true),
                "f" => Value::Bool(false),
                _ => Value::String(text.to_string()),
            }
        }
        20 | 21 | 23 | 26 => {
            // int8, int2, int4, oid
            text.parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(text.to_string()))
        }
        700 | 701 => {
            // float4, float8; NaN and infinities have no JSON form
            text.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(text.to_string()))
        }
        114 | 3802 => {
            // json, jsonb
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        _ => Value::String(text.to_string()),
    }
}

/// Renders a binary-format column value as lower case hex.
pub fn binary_to_hex(raw: &[u8]) -> Value {
    let mut hex = String::with_capacity(2 + raw.len() * 2);
    hex.push_str("\\x");
    for byte in raw {
        hex.push_str(&format!("{:02x}", byte));
    }
    Value::String(hex)
}
