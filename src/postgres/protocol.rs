//! Streaming replication frames carried inside CopyData.
//!
//! The server sends `XLogData` (`w`) and primary keepalive (`k`) frames; the
//! client answers with standby status updates (`r`).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use tracing::trace;

use super::lsn::Lsn;
use crate::{Error, Result};

const XLOG_DATA_TAG: u8 = b'w';
const KEEPALIVE_TAG: u8 = b'k';
const STATUS_UPDATE_TAG: u8 = b'r';

/// Microseconds between the Unix epoch and 2000-01-01 00:00:00 UTC.
pub const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// The server wants a status update right away.
    Now,
    /// No reply requested; the server will ask again.
    Later,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationFrame {
    KeepAlive {
        wal_end: Lsn,
        server_clock: i64,
        reply: ReplyMode,
    },
    Write {
        wal_start: Lsn,
        server_wal_end: Lsn,
        server_clock: i64,
        message: Bytes,
    },
}

impl ReplicationFrame {
    /// Classifies one CopyData payload.
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidMessage {
                message: "Empty replication frame".to_string(),
            });
        }

        match data.get_u8() {
            XLOG_DATA_TAG => {
                ensure_remaining(data.remaining(), 24, "XLogData header")?;
                let wal_start = Lsn(data.get_u64());
                let server_wal_end = Lsn(data.get_u64());
                let server_clock = data.get_i64();
                trace!(wal_start = %wal_start, wal_end = %server_wal_end, "XLogData frame");
                Ok(ReplicationFrame::Write {
                    wal_start,
                    server_wal_end,
                    server_clock,
                    message: data,
                })
            }
            KEEPALIVE_TAG => {
                ensure_remaining(data.remaining(), 17, "keepalive")?;
                let wal_end = Lsn(data.get_u64());
                let server_clock = data.get_i64();
                let reply = if data.get_u8() == 1 {
                    ReplyMode::Now
                } else {
                    ReplyMode::Later
                };
                trace!(wal_end = %wal_end, ?reply, "keepalive frame");
                Ok(ReplicationFrame::KeepAlive {
                    wal_end,
                    server_clock,
                    reply,
                })
            }
            tag => Err(Error::InvalidMessage {
                message: format!("Unknown replication frame tag: {}", tag as char),
            }),
        }
    }
}

/// Encodes a standby status update reporting `lsn` as written, flushed and
/// applied.
pub fn encode_status_update(lsn: Lsn, now: DateTime<Utc>, reply: ReplyMode) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(STATUS_UPDATE_TAG);
    buf.put_u64(lsn.0);
    buf.put_u64(lsn.0);
    buf.put_u64(lsn.0);
    buf.put_i64(to_pg_timestamp(now));
    buf.put_u8(match reply {
        ReplyMode::Now => 1,
        ReplyMode::Later => 0,
    });
    buf.freeze()
}

pub fn to_pg_timestamp(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}

pub fn from_pg_timestamp(micros: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(micros.saturating_add(PG_EPOCH_OFFSET_MICROS))
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn ensure_remaining(remaining: usize, needed: usize, what: &str) -> Result<()> {
    if remaining < needed {
        return Err(Error::InvalidMessage {
            message: format!(
                "Truncated {}: need {} bytes, have {}",
                what, needed, remaining
            ),
        });
    }
    Ok(())
}
