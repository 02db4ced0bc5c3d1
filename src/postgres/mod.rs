pub mod connection;
pub mod decoder;
pub mod lsn;
pub mod protocol;
pub mod relation;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;
#[cfg(test)]
mod type_parser_tests;

pub use connection::{PgConnection, QueryRow, Transport};
pub use decoder::{decode, ColumnInfo, ColumnValue, LogicalMessage, RelationInfo, TupleData};
pub use lsn::Lsn;
pub use protocol::{ReplicationFrame, ReplyMode};
pub use relation::RelationCache;
pub use types::*;
