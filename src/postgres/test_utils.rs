use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::protocol::to_pg_timestamp;

/// Builds pgoutput payloads and the CopyData frames that carry them.
///
/// Message methods (`begin`, `insert`, ...) return the bare logical message;
/// wrap it with [`frame`](Self::frame) to get what arrives on the wire.
pub struct MockMessageBuilder {
    lsn: u64,
    timestamp: i64,
    relations: HashMap<u32, MockRelation>,
}

#[derive(Debug, Clone)]
pub struct MockRelation {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub columns: Vec<MockColumn>,
}

#[derive(Debug, Clone)]
pub struct MockColumn {
    pub name: String,
    pub type_id: u32,
    pub is_key: bool,
}

/// One column of a tuple.
#[derive(Debug, Clone)]
pub enum MockValue {
    Null,
    Unchanged,
    Text(String),
    Binary(Vec<u8>),
}

pub fn text(value: &str) -> MockValue {
    MockValue::Text(value.to_string())
}

impl MockMessageBuilder {
    pub fn new() -> Self {
        Self {
            lsn: 0x1000,
            timestamp: 750_681_000_000_000, // 2023-10-15 10:30:00 UTC, Postgres epoch
            relations: HashMap::new(),
        }
    }

    /// Position stamped on frames built from now on.
    pub fn with_lsn(mut self, lsn: u64) -> Self {
        self.lsn = lsn;
        self
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.lsn = lsn;
    }

    pub fn with_commit_time(mut self, time: DateTime<Utc>) -> Self {
        self.timestamp = to_pg_timestamp(time);
        self
    }

    pub fn set_commit_time(&mut self, time: DateTime<Utc>) {
        self.timestamp = to_pg_timestamp(time);
    }

    pub fn add_relation(
        mut self,
        id: u32,
        schema: &str,
        table: &str,
        columns: Vec<(&str, u32, bool)>,
    ) -> Self {
        let columns = columns
            .into_iter()
            .map(|(name, type_id, is_key)| MockColumn {
                name: name.to_string(),
                type_id,
                is_key,
            })
            .collect();

        self.relations.insert(
            id,
            MockRelation {
                id,
                schema: schema.to_string(),
                table: table.to_string(),
                columns,
            },
        );
        self
    }

    /// XLogData frame carrying `payload` at the current position.
    pub fn frame(&self, payload: Bytes) -> Bytes {
        let mut buf = BytesMut::with_capacity(25 + payload.len());
        buf.put_u8(b'w');
        buf.put_u64(self.lsn);
        buf.put_u64(self.lsn);
        buf.put_i64(self.timestamp);
        buf.put(payload);
        buf.freeze()
    }

    /// Primary keepalive frame.
    pub fn keepalive(&self, wal_end: u64, reply_now: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(18);
        buf.put_u8(b'k');
        buf.put_u64(wal_end);
        buf.put_i64(self.timestamp);
        buf.put_u8(u8::from(reply_now));
        buf.freeze()
    }

    pub fn begin(&self, xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(self.lsn);
        buf.put_i64(self.timestamp);
        buf.put_u32(xid);
        buf.freeze()
    }

    pub fn commit(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0);
        buf.put_u64(self.lsn);
        buf.put_u64(self.lsn + 0x28);
        buf.put_i64(self.timestamp);
        buf.freeze()
    }

    pub fn origin(&self, name: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'O');
        buf.put_u64(self.lsn);
        put_cstr(&mut buf, name);
        buf.freeze()
    }

    pub fn type_message(&self, id: u32, schema: &str, name: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'Y');
        buf.put_u32(id);
        put_cstr(&mut buf, schema);
        put_cstr(&mut buf, name);
        buf.freeze()
    }

    /// Relation message for a relation registered with
    /// [`add_relation`](Self::add_relation).
    pub fn relation(&self, id: u32) -> Bytes {
        let relation = self
            .relations
            .get(&id)
            .expect("Relation not found. Use add_relation() first.");

        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(relation.id);
        put_cstr(&mut buf, &relation.schema);
        put_cstr(&mut buf, &relation.table);
        buf.put_u8(b'd');
        buf.put_u16(relation.columns.len() as u16);

        for column in &relation.columns {
            buf.put_u8(u8::from(column.is_key));
            put_cstr(&mut buf, &column.name);
            buf.put_u32(column.type_id);
            buf.put_i32(-1);
        }

        buf.freeze()
    }

    pub fn insert(&self, relation_id: u32, values: &[MockValue]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(relation_id);
        buf.put_u8(b'N');
        put_tuple(&mut buf, values);
        buf.freeze()
    }

    /// Update with an optional full old image (`O`).
    pub fn update(
        &self,
        relation_id: u32,
        old_values: Option<&[MockValue]>,
        new_values: &[MockValue],
    ) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(relation_id);
        if let Some(old) = old_values {
            buf.put_u8(b'O');
            put_tuple(&mut buf, old);
        }
        buf.put_u8(b'N');
        put_tuple(&mut buf, new_values);
        buf.freeze()
    }

    /// Delete carrying a key-only old image (`K`).
    pub fn delete(&self, relation_id: u32, key_values: &[MockValue]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(relation_id);
        buf.put_u8(b'K');
        put_tuple(&mut buf, key_values);
        buf.freeze()
    }

    pub fn truncate(&self, relation_ids: &[u32]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'T');
        buf.put_u32(relation_ids.len() as u32);
        buf.put_u8(0);
        for id in relation_ids {
            buf.put_u32(*id);
        }
        buf.freeze()
    }
}

fn put_cstr(buf: &mut BytesMut, value: &str) {
    buf.put(value.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, values: &[MockValue]) {
    buf.put_u16(values.len() as u16);
    for value in values {
        match value {
            MockValue::Null => buf.put_u8(b'n'),
            MockValue::Unchanged => buf.put_u8(b'u'),
            MockValue::Text(text) => {
                buf.put_u8(b't');
                buf.put_u32(text.len() as u32);
                buf.put(text.as_bytes());
            }
            MockValue::Binary(data) => {
                buf.put_u8(b'b');
                buf.put_u32(data.len() as u32);
                buf.put(data.as_slice());
            }
        }
    }
}

/// Common PostgreSQL type OIDs for testing
pub mod type_oids {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const INT8: u32 = 20;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const JSON: u32 = 114;
    pub const FLOAT8: u32 = 701;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const JSONB: u32 = 3802;
}

/// Predefined test scenarios
pub mod scenarios {
    use super::*;

    /// `public.users (id int4 key, name text, active bool)` as relation 16384,
    /// with transactions committed just now.
    pub fn users_builder() -> MockMessageBuilder {
        MockMessageBuilder::new().with_commit_time(Utc::now()).add_relation(
            16384,
            "public",
            "users",
            vec![
                ("id", type_oids::INT4, true),
                ("name", type_oids::TEXT, false),
                ("active", type_oids::BOOL, false),
            ],
        )
    }

    /// Begin, relation, one insert and commit, as frames.
    pub fn single_insert_transaction(builder: &MockMessageBuilder, id: &str) -> Vec<Bytes> {
        vec![
            builder.frame(builder.begin(700)),
            builder.frame(builder.relation(16384)),
            builder.frame(builder.insert(16384, &[text(id), text("alice"), text("t")])),
            builder.frame(builder.commit()),
        ]
    }
}
