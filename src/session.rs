//! The replication session: provisions the server side, then decodes the
//! stream, feeds the hooks and acknowledges every processed position.
//!
//! A session owns all of its state and processes frames strictly one at a
//! time on the task that runs it. It never reconnects; when the connection
//! goes away it returns and whoever supervises it starts a new one, which
//! resumes from the position retained by the replication slot.

use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::config::ReplicationConfig;
use crate::hooks::ChangeHooks;
use crate::lag::LagMonitor;
use crate::postgres::decoder::{self, LogicalMessage};
use crate::postgres::protocol::{encode_status_update, ReplicationFrame, ReplyMode};
use crate::postgres::{ChangeEvent, ChangeOperation, Lsn, RelationCache, Transport};
use crate::provisioning::{Command, Provisioner, Step};
use crate::{Error, Result};

/// Stops a running [`Session`]. Cheap to clone and hand to signal handlers.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    /// Asks the session to close its connection and return `Ok(())`.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

pub struct Session<T: Transport, H: ChangeHooks> {
    config: ReplicationConfig,
    transport: T,
    hooks: H,
    provisioner: Provisioner,
    relations: RelationCache,
    lag: LagMonitor,
    counter: u64,
    acked: Lsn,
    shutdown: watch::Receiver<bool>,
    handle: SessionHandle,
}

impl<T: Transport, H: ChangeHooks> Session<T, H> {
    /// Validates `config` and builds a session in the `Disconnected` step.
    pub fn new(
        config: ReplicationConfig,
        transport: T,
        hooks: H,
    ) -> Result<(Self, SessionHandle)> {
        config.validate()?;

        let (tx, rx) = watch::channel(false);
        let handle = SessionHandle {
            shutdown: Arc::new(tx),
        };

        let session = Self {
            provisioner: Provisioner::new(&config),
            lag: LagMonitor::new(config.warning_threshold(), config.error_threshold()),
            config,
            transport,
            hooks,
            relations: RelationCache::new(),
            counter: 0,
            acked: Lsn::ZERO,
            shutdown: rx,
            handle: handle.clone(),
        };
        Ok((session, handle))
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn step(&self) -> Step {
        self.provisioner.step()
    }

    /// Write frames processed so far.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Highest position reported to the server.
    pub fn acked_lsn(&self) -> Lsn {
        self.acked
    }

    pub fn relations(&self) -> &RelationCache {
        &self.relations
    }

    pub fn warning_threshold_exceeded(&self) -> bool {
        self.lag.warning_threshold_exceeded()
    }

    pub fn error_threshold_exceeded(&self) -> bool {
        self.lag.error_threshold_exceeded()
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Provisions and streams until shutdown, connection loss or a fatal
    /// error. The step is `Disconnected` whenever this returns.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.run_until_stopped().await;
        self.provisioner.disconnect();
        result
    }

    async fn run_until_stopped(&mut self) -> Result<()> {
        if *self.shutdown.borrow() {
            return self.close().await;
        }

        self.provision().await?;

        if *self.shutdown.borrow() {
            return self.close().await;
        }

        self.stream().await
    }

    /// Drives the provisioning state machine until the connection is in
    /// streaming mode. Returns early, without streaming, once shutdown is
    /// requested.
    pub async fn provision(&mut self) -> Result<()> {
        info!(
            publication = %self.config.publication,
            slot = %self.config.slot_name,
            "Provisioning replication session"
        );

        let mut command = self.provisioner.start();
        loop {
            match command {
                Command::Query(query) => {
                    debug!(step = ?self.provisioner.step(), %query, "Provisioning query");
                    let rows = tokio::select! {
                        biased;

                        _ = shutdown_requested(&mut self.shutdown) => {
                            info!(
                                step = ?self.provisioner.step(),
                                "Shutdown requested during provisioning"
                            );
                            return Ok(());
                        }
                        rows = self.transport.simple_query(&query) => rows?,
                    };
                    command = self.provisioner.handle_result(&rows)?;
                }
                Command::StartStreaming(query) => {
                    tokio::select! {
                        biased;

                        _ = shutdown_requested(&mut self.shutdown) => {
                            info!("Shutdown requested before streaming started");
                            return Ok(());
                        }
                        started = self.transport.start_replication(&query) => started?,
                    }
                    info!(slot = %self.config.slot_name, "Replication streaming started");
                    return Ok(());
                }
            }
        }
    }

    async fn stream(&mut self) -> Result<()> {
        let mut liveness = tokio::time::interval(self.config.liveness_interval());
        liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        liveness.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!("Shutdown requested");
                        return self.close().await;
                    }
                }
                _ = liveness.tick() => {
                    info!(
                        messages = self.counter,
                        acked_lsn = %self.acked,
                        lag_ms = self.lag.last_lag().as_millis() as u64,
                        "Replication session alive"
                    );
                }
                frame = self.transport.recv_frame() => {
                    match frame? {
                        Some(frame) => self.handle_frame(frame).await?,
                        None => {
                            return Err(Error::Connection(
                                "replication stream ended by server".to_string(),
                            ));
                        }
                    }
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }

    /// Processes one CopyData payload from the replication stream.
    pub async fn handle_frame(&mut self, frame: Bytes) -> Result<()> {
        match ReplicationFrame::parse(frame)? {
            ReplicationFrame::KeepAlive { wal_end, reply, .. } => match reply {
                ReplyMode::Now => self.acknowledge(wal_end.next()).await,
                ReplyMode::Later => Ok(()),
            },
            ReplicationFrame::Write {
                server_wal_end,
                message,
                ..
            } => {
                self.counter += 1;
                let message = decoder::decode(message)?;
                self.handle_message(server_wal_end, message)?;
                self.acknowledge(server_wal_end.next()).await
            }
        }
    }

    fn handle_message(&mut self, lsn: Lsn, message: LogicalMessage) -> Result<()> {
        match message {
            LogicalMessage::Relation(relation) => {
                debug!(
                    relation_id = relation.id,
                    table = %relation.qualified_name(),
                    columns = relation.columns.len(),
                    "Relation cached"
                );
                self.relations.insert(relation);
            }
            LogicalMessage::Begin {
                commit_timestamp,
                xid,
                ..
            } => {
                trace!(xid, "BEGIN");
                self.lag.observe(commit_timestamp, Utc::now());
            }
            LogicalMessage::Commit { end_lsn, .. } => trace!(%end_lsn, "COMMIT"),
            change @ (LogicalMessage::Insert { .. }
            | LogicalMessage::Update { .. }
            | LogicalMessage::Delete { .. }) => {
                if self.lag.error_threshold_exceeded() {
                    trace!(%lsn, "Lag above error threshold, change not dispatched");
                } else if let Some(event) = self.relations.transform(&change)? {
                    self.dispatch(lsn, event)?;
                }
            }
            LogicalMessage::Origin { .. }
            | LogicalMessage::Truncate { .. }
            | LogicalMessage::Type { .. } => {}
            LogicalMessage::Unsupported { data } => {
                debug!(
                    %lsn,
                    tag = ?data.first().map(|&b| b as char),
                    len = data.len(),
                    "Ignoring unsupported message"
                );
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, lsn: Lsn, event: ChangeEvent) -> Result<()> {
        let table = event.qualified_table();
        let outcome = match (event.op, event.old_row.as_ref(), event.new_row.as_ref()) {
            (ChangeOperation::Insert, _, Some(new_row)) => {
                self.hooks.on_insert(lsn, &table, new_row)
            }
            (ChangeOperation::Update, old_row, Some(new_row)) => {
                self.hooks.on_update(lsn, &table, old_row, new_row)
            }
            (ChangeOperation::Delete, Some(old_row), _) => {
                self.hooks.on_delete(lsn, &table, old_row)
            }
            (op, _, _) => {
                return Err(Error::Protocol(format!(
                    "{:?} on {} without a row image",
                    op, table
                )));
            }
        };
        outcome.map_err(Error::Hook)
    }

    async fn acknowledge(&mut self, lsn: Lsn) -> Result<()> {
        self.acked = self.acked.max(lsn);
        trace!(lsn = %self.acked, "Sending status update");
        let frame = encode_status_update(self.acked, Utc::now(), ReplyMode::Later);
        self.transport.send_frame(frame).await
    }
}

/// Resolves once shutdown has been requested.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // The session keeps a handle, so the sender outlives every receiver.
    let _ = shutdown.wait_for(|stop| *stop).await;
}
