//! Downstream consumers of decoded row changes.
//!
//! Hooks run synchronously on the session's task, one change at a time in
//! commit order. Returning an error ends the session; a hook that wants to
//! tolerate its own failures has to handle them itself.

use serde_json::json;
use std::io::Write;
use tracing::info;

use crate::postgres::{ChangeOperation, Lsn, Row};

pub trait ChangeHooks {
    fn on_insert(&mut self, _lsn: Lsn, _table: &str, _new_row: &Row) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_update(
        &mut self,
        _lsn: Lsn,
        _table: &str,
        _old_row: Option<&Row>,
        _new_row: &Row,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_delete(&mut self, _lsn: Lsn, _table: &str, _old_row: &Row) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<H: ChangeHooks + ?Sized> ChangeHooks for Box<H> {
    fn on_insert(&mut self, lsn: Lsn, table: &str, new_row: &Row) -> anyhow::Result<()> {
        (**self).on_insert(lsn, table, new_row)
    }

    fn on_update(
        &mut self,
        lsn: Lsn,
        table: &str,
        old_row: Option<&Row>,
        new_row: &Row,
    ) -> anyhow::Result<()> {
        (**self).on_update(lsn, table, old_row, new_row)
    }

    fn on_delete(&mut self, lsn: Lsn, table: &str, old_row: &Row) -> anyhow::Result<()> {
        (**self).on_delete(lsn, table, old_row)
    }
}

/// Accepts every change and does nothing with it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl ChangeHooks for NoopHooks {}

/// Logs one line per change.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHooks;

impl ChangeHooks for LoggingHooks {
    fn on_insert(&mut self, lsn: Lsn, table: &str, new_row: &Row) -> anyhow::Result<()> {
        info!(%lsn, table, columns = new_row.len(), "INSERT");
        Ok(())
    }

    fn on_update(
        &mut self,
        lsn: Lsn,
        table: &str,
        old_row: Option<&Row>,
        new_row: &Row,
    ) -> anyhow::Result<()> {
        info!(%lsn, table, has_old_row = old_row.is_some(), columns = new_row.len(), "UPDATE");
        Ok(())
    }

    fn on_delete(&mut self, lsn: Lsn, table: &str, old_row: &Row) -> anyhow::Result<()> {
        info!(%lsn, table, columns = old_row.len(), "DELETE");
        Ok(())
    }
}

/// Writes each change as one JSON object per line.
pub struct JsonLinesHooks<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesHooks<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write(
        &mut self,
        op: ChangeOperation,
        lsn: Lsn,
        table: &str,
        old_row: Option<&Row>,
        new_row: Option<&Row>,
    ) -> anyhow::Result<()> {
        let line = json!({
            "op": op,
            "lsn": lsn.to_string(),
            "table": table,
            "old_row": old_row,
            "new_row": new_row,
        });
        serde_json::to_writer(&mut self.out, &line)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

impl<W: Write> ChangeHooks for JsonLinesHooks<W> {
    fn on_insert(&mut self, lsn: Lsn, table: &str, new_row: &Row) -> anyhow::Result<()> {
        self.write(ChangeOperation::Insert, lsn, table, None, Some(new_row))
    }

    fn on_update(
        &mut self,
        lsn: Lsn,
        table: &str,
        old_row: Option<&Row>,
        new_row: &Row,
    ) -> anyhow::Result<()> {
        self.write(ChangeOperation::Update, lsn, table, old_row, Some(new_row))
    }

    fn on_delete(&mut self, lsn: Lsn, table: &str, old_row: &Row) -> anyhow::Result<()> {
        self.write(ChangeOperation::Delete, lsn, table, Some(old_row), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_noop_hooks_accept_everything() {
        let mut hooks = NoopHooks;
        let r = row(json!({"id": 1}));
        assert!(hooks.on_insert(Lsn(1), "public.users", &r).is_ok());
        assert!(hooks.on_update(Lsn(2), "public.users", None, &r).is_ok());
        assert!(hooks.on_delete(Lsn(3), "public.users", &r).is_ok());
    }

    #[test]
    fn test_json_lines_output() {
        let mut hooks = JsonLinesHooks::new(Vec::new());
        let old = row(json!({"id": 1, "name": "old"}));
        let new = row(json!({"id": 1, "name": "new"}));

        hooks.on_insert(Lsn(0x10), "public.users", &new).unwrap();
        hooks.on_update(Lsn(0x20), "public.users", Some(&old), &new).unwrap();
        hooks.on_delete(Lsn(0x30), "public.users", &old).unwrap();

        let output = String::from_utf8(hooks.into_inner()).unwrap();
        let lines: Vec<Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["op"], "INSERT");
        assert_eq!(lines[0]["lsn"], "0/10");
        assert!(lines[0]["old_row"].is_null());
        assert_eq!(lines[0]["new_row"]["name"], "new");
        assert_eq!(lines[1]["op"], "UPDATE");
        assert_eq!(lines[1]["old_row"]["name"], "old");
        assert_eq!(lines[2]["op"], "DELETE");
        assert!(lines[2]["new_row"].is_null());
        assert_eq!(lines[2]["table"], "public.users");
    }
}
