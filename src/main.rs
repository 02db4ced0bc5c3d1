use clap::{Parser, ValueEnum};
use pg_walsession::postgres::PgConnection;
use pg_walsession::{ChangeHooks, JsonLinesHooks, LoggingHooks, NoopHooks};
use pg_walsession::{Config, Result, Session};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum HooksKind {
    /// Log one line per change
    Log,
    /// Print each change to stdout as a JSON line
    Json,
    /// Discard changes
    Noop,
}

#[derive(Parser, Debug)]
#[command(name = "pg-walsession")]
#[command(about = "PostgreSQL logical replication session", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, value_enum, default_value = "log", help = "Where decoded changes go")]
    hooks: HooksKind,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-walsession");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        publication = %config.replication.publication,
        slot = %config.replication.slot_name,
        tables = ?config.replication.qualified_tables(),
        "Configuration summary"
    );

    let hooks: Box<dyn ChangeHooks> = match args.hooks {
        HooksKind::Log => Box::new(LoggingHooks),
        HooksKind::Json => Box::new(JsonLinesHooks::new(std::io::stdout())),
        HooksKind::Noop => Box::new(NoopHooks),
    };

    let connection = PgConnection::connect(&config.postgres_config()).await?;
    let (mut session, handle) = Session::new(config.replication, connection, hooks)?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
            handle.shutdown();
        }
    });

    match session.run().await {
        Ok(()) => {
            info!(
                messages = session.counter(),
                acked_lsn = %session.acked_lsn(),
                "Replication session stopped"
            );
            Ok(())
        }
        Err(e) => {
            error!(
                error = %e,
                acked_lsn = %session.acked_lsn(),
                "Replication session ended"
            );
            Err(e)
        }
    }
}

/// Logs go to stderr so `--hooks json` owns stdout.
fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_walsession=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_walsession=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
