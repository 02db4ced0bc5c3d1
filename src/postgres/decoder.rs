//! Decoder for the pgoutput logical replication message format.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-logicalrep-message-formats.html

use bytes::{Buf, Bytes};
use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::lsn::Lsn;
use super::protocol::{ensure_remaining, from_pg_timestamp};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RelationInfo {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<ColumnInfo>,
}

impl RelationInfo {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_id: u32,
    pub type_modifier: i32,
    pub is_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    /// TOASTed value that did not change; the server does not resend it.
    Unchanged,
    Text(String),
    Binary(Bytes),
}

pub type TupleData = Vec<ColumnValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum LogicalMessage {
    Begin {
        final_lsn: Lsn,
        commit_timestamp: DateTime<Utc>,
        xid: u32,
    },
    Commit {
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_timestamp: DateTime<Utc>,
    },
    Origin {
        commit_lsn: Lsn,
        name: String,
    },
    Relation(RelationInfo),
    Type {
        id: u32,
        namespace: String,
        name: String,
    },
    Insert {
        relation_id: u32,
        tuple_data: TupleData,
    },
    Update {
        relation_id: u32,
        old_tuple_data: Option<TupleData>,
        tuple_data: TupleData,
    },
    Delete {
        relation_id: u32,
        old_tuple_data: TupleData,
    },
    Truncate {
        options: u8,
        relation_ids: Vec<u32>,
    },
    /// A message whose tag this decoder does not know, kept verbatim.
    Unsupported {
        data: Bytes,
    },
}

/// Decodes the payload of an XLogData frame.
///
/// Unknown tags (and an empty payload) come back as
/// [`LogicalMessage::Unsupported`]. A payload whose tag is known but whose
/// body does not match that tag's layout is an [`Error::InvalidMessage`].
pub fn decode(data: Bytes) -> Result<LogicalMessage> {
    let Some(&tag) = data.first() else {
        return Ok(LogicalMessage::Unsupported { data });
    };

    let mut cursor = &data[1..];
    let decoded = match tag {
        b'B' => decode_begin(&mut cursor),
        b'C' => decode_commit(&mut cursor),
        b'O' => decode_origin(&mut cursor),
        b'R' => decode_relation(&mut cursor),
        b'Y' => decode_type(&mut cursor),
        b'I' => decode_insert(&mut cursor),
        b'U' => decode_update(&mut cursor),
        b'D' => decode_delete(&mut cursor),
        b'T' => decode_truncate(&mut cursor),
        _ => {
            debug!("Unsupported pgoutput message type: {}", tag as char);
            return Ok(LogicalMessage::Unsupported { data });
        }
    };

    if let Err(e) = &decoded {
        warn!(tag = %(tag as char), error = %e, "Malformed pgoutput message");
    }
    decoded
}

fn decode_begin(cursor: &mut &[u8]) -> Result<LogicalMessage> {
    ensure_remaining(cursor.remaining(), 20, "BEGIN message")?;
    let final_lsn = Lsn(cursor.get_u64());
    let commit_timestamp = from_pg_timestamp(cursor.get_i64());
    let xid = cursor.get_u32();

    trace!("BEGIN: lsn={}, xid={}", final_lsn, xid);
    Ok(LogicalMessage::Begin {
        final_lsn,
        commit_timestamp,
        xid,
    })
}

fn decode_commit(cursor: &mut &[u8]) -> Result<LogicalMessage> {
    ensure_remaining(cursor.remaining(), 25, "COMMIT message")?;
    let flags = cursor.get_u8();
    let commit_lsn = Lsn(cursor.get_u64());
    let end_lsn = Lsn(cursor.get_u64());
    let commit_timestamp = from_pg_timestamp(cursor.get_i64());

    trace!("COMMIT: lsn={}", end_lsn);
    Ok(LogicalMessage::Commit {
        flags,
        commit_lsn,
        end_lsn,
        commit_timestamp,
    })
}

fn decode_origin(cursor: &mut &[u8]) -> Result<LogicalMessage> {
    ensure_remaining(cursor.remaining(), 8, "ORIGIN message")?;
    let commit_lsn = Lsn(cursor.get_u64());
    let name = read_cstr(cursor)?;
    Ok(LogicalMessage::Origin { commit_lsn, name })
}

fn decode_relation(cursor: &mut &[u8]) -> Result<LogicalMessage> {
    ensure_remaining(cursor.remaining(), 4, "RELATION message")?;
    let id = cursor.get_u32();
    let namespace = read_cstr(cursor)?;
    let name = read_cstr(cursor)?;

    ensure_remaining(cursor.remaining(), 3, "RELATION message")?;
    let replica_identity = cursor.get_u8();
    let num_columns = cursor.get_u16();

    let mut columns = Vec::with_capacity(num_columns as usize);
    for _ in 0..num_columns {
        ensure_remaining(cursor.remaining(), 1, "RELATION column")?;
        let flags = cursor.get_u8();
        let column_name = read_cstr(cursor)?;
        ensure_remaining(cursor.remaining(), 8, "RELATION column")?;
        let type_id = cursor.get_u32();
        let type_modifier = cursor.get_i32();

        columns.push(ColumnInfo {
            name: column_name,
            type_id,
            type_modifier,
            is_key: flags & 1 != 0,
        });
    }

    debug!("RELATION: {}={}.{}", id, namespace, name);
    Ok(LogicalMessage::Relation(RelationInfo {
        id,
        namespace,
        name,
        replica_identity,
        columns,
    }))
}

fn decode_type(cursor: &mut &[u8]) -> Result<LogicalMessage> {
    ensure_remaining(cursor.remaining(), 4, "TYPE message")?;
    let id = cursor.get_u32();
    let namespace = read_cstr(cursor)?;
    let name = read_cstr(cursor)?;
    Ok(LogicalMessage::Type {
        id,
        namespace,
        name,
    })
}

fn decode_insert(cursor: &mut &[u8]) -> Result<LogicalMessage> {
    ensure_remaining(cursor.remaining(), 5, "INSERT message")?;
    let relation_id = cursor.get_u32();
    let tuple_type = cursor.get_u8();

    if tuple_type != b'N' {
        return Err(Error::InvalidMessage {
            message: format!("Unexpected tuple type in INSERT: {}", tuple_type as char),
        });
    }

    let tuple_data = decode_tuple_data(cursor)?;
    Ok(LogicalMessage::Insert {
        relation_id,
        tuple_data,
    })
}

fn decode_update(cursor: &mut &[u8]) -> Result<LogicalMessage> {
    ensure_remaining(cursor.remaining(), 5, "UPDATE message")?;
    let relation_id = cursor.get_u32();

    let mut old_tuple_data = None;
    let mut tuple_type = cursor.get_u8();
    if tuple_type == b'K' || tuple_type == b'O' {
        old_tuple_data = Some(decode_tuple_data(cursor)?);
        ensure_remaining(cursor.remaining(), 1, "UPDATE message")?;
        tuple_type = cursor.get_u8();
    }

    if tuple_type != b'N' {
        return Err(Error::InvalidMessage {
            message: format!("Unexpected tuple type in UPDATE: {}", tuple_type as char),
        });
    }

    let tuple_data = decode_tuple_data(cursor)?;
    Ok(LogicalMessage::Update {
        relation_id,
        old_tuple_data,
        tuple_data,
    })
}

fn decode_delete(cursor: &mut &[u8]) -> Result<LogicalMessage> {
    ensure_remaining(cursor.remaining(), 5, "DELETE message")?;
    let relation_id = cursor.get_u32();
    let tuple_type = cursor.get_u8();

    if tuple_type != b'O' && tuple_type != b'K' {
        return Err(Error::InvalidMessage {
            message: format!("Unexpected tuple type in DELETE: {}", tuple_type as char),
        });
    }

    let old_tuple_data = decode_tuple_data(cursor)?;
    Ok(LogicalMessage::Delete {
        relation_id,
        old_tuple_data,
    })
}

fn decode_truncate(cursor: &mut &[u8]) -> Result<LogicalMessage> {
    ensure_remaining(cursor.remaining(), 5, "TRUNCATE message")?;
    let count = cursor.get_u32() as usize;
    let options = cursor.get_u8();

    ensure_remaining(cursor.remaining(), count.saturating_mul(4), "TRUNCATE relation list")?;
    let relation_ids = (0..count).map(|_| cursor.get_u32()).collect();

    Ok(LogicalMessage::Truncate {
        options,
        relation_ids,
    })
}

fn decode_tuple_data(cursor: &mut &[u8]) -> Result<TupleData> {
    ensure_remaining(cursor.remaining(), 2, "tuple data")?;
    let num_columns = cursor.get_u16();
    let mut tuple = Vec::with_capacity(num_columns as usize);

    for _ in 0..num_columns {
        ensure_remaining(cursor.remaining(), 1, "tuple column")?;
        let value = match cursor.get_u8() {
            b'n' => ColumnValue::Null,
            b'u' => ColumnValue::Unchanged,
            kind @ (b't' | b'b') => {
                ensure_remaining(cursor.remaining(), 4, "tuple column length")?;
                let len = cursor.get_u32() as usize;
                ensure_remaining(cursor.remaining(), len, "tuple column value")?;
                let raw = &cursor[..len];
                let value = if kind == b't' {
                    ColumnValue::Text(String::from_utf8_lossy(raw).into_owned())
                } else {
                    ColumnValue::Binary(Bytes::copy_from_slice(raw))
                };
                cursor.advance(len);
                value
            }
            other => {
                return Err(Error::InvalidMessage {
                    message: format!("Unknown column type: {}", other as char),
                });
            }
        };
        tuple.push(value);
    }

    Ok(tuple)
}

fn read_cstr(cursor: &mut &[u8]) -> Result<String> {
    let end = cursor
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::InvalidMessage {
            message: "Unterminated string".to_string(),
        })?;
    let value = String::from_utf8_lossy(&cursor[..end]).into_owned();
    cursor.advance(end + 1);
    Ok(value)
}
