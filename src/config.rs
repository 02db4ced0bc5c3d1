use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_application_name")]
    pub application_name: String,
}

/// Settings that stay fixed for the lifetime of one replication session.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    /// Namespace applied to table entries that are not already qualified.
    pub schema: String,
    pub publication: String,
    pub slot_name: String,
    #[serde(default = "default_output_plugin")]
    pub output_plugin: String,
    #[serde(default = "default_proto_version")]
    pub proto_version: u32,
    /// Tables the publication must contain, as `table` or `namespace.table`.
    pub tables: Vec<String>,
    pub warning_lag_ms: u64,
    pub error_lag_ms: u64,
    #[serde(default = "default_liveness_interval_secs")]
    pub liveness_interval_secs: u64,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_WALSESSION")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.replication.validate()?;
        Ok(config)
    }

    /// Connection parameters for the replication connection.
    pub fn postgres_config(&self) -> tokio_postgres::Config {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.postgres.host)
            .port(self.postgres.port)
            .dbname(&self.postgres.database)
            .user(&self.postgres.username)
            .application_name(&self.postgres.application_name)
            .connect_timeout(Duration::from_secs(self.postgres.connect_timeout_secs));
        if !self.postgres.password.is_empty() {
            pg.password(&self.postgres.password);
        }
        pg
    }
}

impl ReplicationConfig {
    /// Checks the settings a session cannot start without.
    pub fn validate(&self) -> Result<()> {
        require_non_empty("schema", &self.schema)?;
        require_non_empty("publication", &self.publication)?;
        require_non_empty("slot_name", &self.slot_name)?;
        require_non_empty("output_plugin", &self.output_plugin)?;

        if !self
            .slot_name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(Error::Config(format!(
                "slot_name '{}' may only contain lower case letters, digits and underscores",
                self.slot_name
            )));
        }

        if !(1..=4).contains(&self.proto_version) {
            return Err(Error::Config(format!(
                "proto_version must be between 1 and 4, got {}",
                self.proto_version
            )));
        }

        if self.tables.is_empty() {
            return Err(Error::Config(
                "at least one table must be listed in tables".to_string(),
            ));
        }
        for table in &self.tables {
            let valid = match table.split_once('.') {
                Some((namespace, name)) => {
                    !namespace.is_empty() && !name.is_empty() && !name.contains('.')
                }
                None => !table.is_empty(),
            };
            if !valid {
                return Err(Error::Config(format!("invalid table entry '{}'", table)));
            }
        }

        if self.liveness_interval_secs == 0 {
            return Err(Error::Config(
                "liveness_interval_secs must be greater than zero".to_string(),
            ));
        }

        if self.error_lag_ms < self.warning_lag_ms {
            warn!(
                warning_lag_ms = self.warning_lag_ms,
                error_lag_ms = self.error_lag_ms,
                "error lag threshold is below the warning threshold"
            );
        }

        Ok(())
    }

    /// Desired publication members as `namespace.table`, in configuration
    /// order with duplicates removed.
    pub fn qualified_tables(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.tables
            .iter()
            .map(|table| {
                if table.contains('.') {
                    table.clone()
                } else {
                    format!("{}.{}", self.schema, table)
                }
            })
            .filter(|table| seen.insert(table.clone()))
            .collect()
    }

    pub fn warning_threshold(&self) -> Duration {
        Duration::from_millis(self.warning_lag_ms)
    }

    pub fn error_threshold(&self) -> Duration {
        Duration::from_millis(self.error_lag_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Config(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_application_name() -> String {
    "pg-walsession".to_string()
}

fn default_output_plugin() -> String {
    "pgoutput".to_string()
}

fn default_proto_version() -> u32 {
    1
}

fn default_liveness_interval_secs() -> u64 {
    60
}

#[cfg(test)]
pub(crate) fn test_replication_config() -> ReplicationConfig {
    ReplicationConfig {
        schema: "public".to_string(),
        publication: "walsession_pub".to_string(),
        slot_name: "walsession_slot".to_string(),
        output_plugin: default_output_plugin(),
        proto_version: 1,
        tables: vec!["users".to_string(), "audit.events".to_string()],
        warning_lag_ms: 1_000,
        error_lag_ms: 5_000,
        liveness_interval_secs: 60,
    }
}
