use pg_walsession::config::{Config, PostgresConfig, ReplicationConfig};
use std::env;

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    // Use TEST_ prefix for test environment variables
    let postgres = PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 10,
        application_name: "pg-walsession-test".to_string(),
    };

    let replication = ReplicationConfig {
        schema: "public".to_string(),
        publication: format!("test_publication_{}", std::process::id()),
        slot_name: format!("test_slot_{}", std::process::id()),
        output_plugin: "pgoutput".to_string(),
        proto_version: 1,
        tables: vec![format!("walsession_test_{}", std::process::id())],
        warning_lag_ms: 5_000,
        error_lag_ms: 60_000,
        liveness_interval_secs: 5,
    };

    Config {
        postgres,
        replication,
    }
}

/// libpq-style connection string for the setup client.
pub fn connection_string(config: &Config) -> String {
    format!(
        "host={} port={} user={} password={} dbname={}",
        config.postgres.host,
        config.postgres.port,
        config.postgres.username,
        config.postgres.password,
        config.postgres.database
    )
}
