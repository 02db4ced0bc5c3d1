//! Brings the publication and replication slot into the configured state
//! before streaming starts.
//!
//! The machine is driven by query results: each call to
//! [`Provisioner::handle_result`] consumes the rows of the previously issued
//! query, advances one step and names the next query. Running it against a
//! server that is already provisioned only issues the read-only checks and
//! `START_REPLICATION`.

use std::collections::HashSet;
use tracing::{debug, info};

use crate::config::ReplicationConfig;
use crate::postgres::QueryRow;
use crate::{Error, Result};

/// Where the session is in its lifetime. During provisioning a step names
/// the result the machine is waiting for.
///
/// `CreatePublication` is never waited on: the CREATE is issued from
/// `CheckPublication` and its result is consumed by `CheckReplicationSlot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Disconnected,
    CheckPublication,
    CheckPublicationTables,
    RemovePublicationTables,
    CreatePublication,
    /// Waiting for the result of the publication change (CREATE, or the
    /// final ALTER ... DROP TABLE); the slot check is issued next.
    CheckReplicationSlot,
    /// Waiting for the slot-existence check; the slot is created if it
    /// returned no rows.
    CreateSlot,
    /// Waiting for the result of `CREATE_REPLICATION_SLOT`.
    StartReplicationSlot,
    Streaming,
}

/// What the session must send next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Query(String),
    /// Switch the connection into CopyBoth mode with this command.
    StartStreaming(String),
}

/// Outcome of diffing desired against current publication members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDiff {
    pub to_add: Vec<String>,
    pub to_remove: Vec<String>,
}

impl TableDiff {
    /// Exact, case-sensitive comparison on `namespace.table`. Output keeps
    /// the order of the input lists.
    pub fn compute(desired: &[String], current: &[String]) -> Self {
        let desired_set: HashSet<&String> = desired.iter().collect();
        let current_set: HashSet<&String> = current.iter().collect();

        Self {
            to_add: desired
                .iter()
                .filter(|t| !current_set.contains(t))
                .cloned()
                .collect(),
            to_remove: current
                .iter()
                .filter(|t| !desired_set.contains(t))
                .cloned()
                .collect(),
        }
    }
}

pub struct Provisioner {
    step: Step,
    publication: String,
    slot_name: String,
    output_plugin: String,
    proto_version: u32,
    table_subscriptions: Vec<String>,
    tables_to_remove: Vec<String>,
}

impl Provisioner {
    pub fn new(config: &ReplicationConfig) -> Self {
        Self {
            step: Step::Disconnected,
            publication: config.publication.clone(),
            slot_name: config.slot_name.clone(),
            output_plugin: config.output_plugin.clone(),
            proto_version: config.proto_version,
            table_subscriptions: config.qualified_tables(),
            tables_to_remove: Vec::new(),
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    /// Marks the connection as lost. Provisioning restarts from the top on
    /// the next [`start`](Self::start).
    pub fn disconnect(&mut self) {
        self.step = Step::Disconnected;
        self.tables_to_remove.clear();
    }

    /// First query of a fresh connection.
    pub fn start(&mut self) -> Command {
        self.tables_to_remove.clear();
        self.transition(Step::CheckPublication);
        Command::Query(format!(
            "SELECT 1 FROM pg_publication WHERE pubname = {}",
            quote_literal(&self.publication)
        ))
    }

    /// Consumes the result of the last issued command.
    pub fn handle_result(&mut self, rows: &[QueryRow]) -> Result<Command> {
        match self.step {
            Step::CheckPublication => {
                if rows.is_empty() {
                    info!(publication = %self.publication, "Publication not found, creating it");
                    self.transition(Step::CheckReplicationSlot);
                    Ok(Command::Query(format!(
                        "CREATE PUBLICATION {} FOR TABLE {}",
                        quote_identifier(&self.publication),
                        self.table_list(&self.table_subscriptions)
                    )))
                } else {
                    self.transition(Step::CheckPublicationTables);
                    Ok(Command::Query(format!(
                        "SELECT schemaname, tablename FROM pg_publication_tables WHERE pubname = {}",
                        quote_literal(&self.publication)
                    )))
                }
            }
            Step::CheckPublicationTables => {
                let current = rows
                    .iter()
                    .map(|row| {
                        match (row.get("schemaname"), row.get("tablename")) {
                            (Some(schema), Some(table)) => Ok(format!("{}.{}", schema, table)),
                            _ => Err(Error::Protocol(
                                "publication table row without schemaname/tablename".to_string(),
                            )),
                        }
                    })
                    .collect::<Result<Vec<_>>>()?;

                let diff = TableDiff::compute(&self.table_subscriptions, &current);
                debug!(to_add = ?diff.to_add, to_remove = ?diff.to_remove, "Publication diff");

                if !diff.to_add.is_empty() {
                    let query = self.alter_publication("ADD", &diff.to_add);
                    self.tables_to_remove = diff.to_remove;
                    self.transition(Step::RemovePublicationTables);
                    Ok(Command::Query(query))
                } else if !diff.to_remove.is_empty() {
                    let query = self.alter_publication("DROP", &diff.to_remove);
                    self.transition(Step::CheckReplicationSlot);
                    Ok(Command::Query(query))
                } else {
                    info!(publication = %self.publication, "Publication already up to date");
                    Ok(self.check_slot())
                }
            }
            Step::RemovePublicationTables => {
                if self.tables_to_remove.is_empty() {
                    Ok(self.check_slot())
                } else {
                    let to_remove = std::mem::take(&mut self.tables_to_remove);
                    let query = self.alter_publication("DROP", &to_remove);
                    self.transition(Step::CheckReplicationSlot);
                    Ok(Command::Query(query))
                }
            }
            Step::CheckReplicationSlot => Ok(self.check_slot()),
            Step::CreateSlot => {
                if rows.is_empty() {
                    info!(slot = %self.slot_name, "Replication slot not found, creating it");
                    self.transition(Step::StartReplicationSlot);
                    Ok(Command::Query(format!(
                        "CREATE_REPLICATION_SLOT {} LOGICAL {} NOEXPORT_SNAPSHOT",
                        self.slot_name, self.output_plugin
                    )))
                } else {
                    info!(slot = %self.slot_name, "Replication slot already exists");
                    Ok(self.start_replication())
                }
            }
            Step::StartReplicationSlot => Ok(self.start_replication()),
            step @ (Step::Disconnected | Step::CreatePublication | Step::Streaming) => {
                Err(Error::Protocol(format!(
                    "unexpected query result in step {:?}",
                    step
                )))
            }
        }
    }

    fn check_slot(&mut self) -> Command {
        self.transition(Step::CreateSlot);
        Command::Query(format!(
            "SELECT 1 FROM pg_replication_slots WHERE slot_name = {}",
            quote_literal(&self.slot_name)
        ))
    }

    fn start_replication(&mut self) -> Command {
        self.transition(Step::Streaming);
        Command::StartStreaming(format!(
            "START_REPLICATION SLOT {} LOGICAL 0/0 (proto_version '{}', publication_names {})",
            self.slot_name,
            self.proto_version,
            quote_literal(&quote_identifier(&self.publication))
        ))
    }

    fn alter_publication(&self, action: &str, tables: &[String]) -> String {
        format!(
            "ALTER PUBLICATION {} {} TABLE {}",
            quote_identifier(&self.publication),
            action,
            self.table_list(tables)
        )
    }

    fn table_list(&self, tables: &[String]) -> String {
        tables
            .iter()
            .map(|table| quote_qualified(table))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn transition(&mut self, next: Step) {
        debug!(from = ?self.step, to = ?next, "Provisioning step");
        self.step = next;
    }
}

fn quote_qualified(table: &str) -> String {
    match table.split_once('.') {
        Some((namespace, name)) => {
            format!("{}.{}", quote_identifier(namespace), quote_identifier(name))
        }
        None => quote_identifier(table),
    }
}

pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

pub fn quote_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}
