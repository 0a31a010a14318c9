//! rawload - main entry point

use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rawload::catalog::olist_catalog;
use rawload::cli::{Cli, SummaryFormat};
use rawload::config::Config;
use rawload::pipeline::{Pipeline, PipelineOptions};
use rawload::store::{Destination, ObjectSource, PgDestination, S3ObjectSource};
use rawload_common::env::EnvReader;
use rawload_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.markdown_help {
        println!("{}", clap_markdown::help_markdown::<Cli>());
        return;
    }

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("rawload")
        .build();

    // Environment variables take precedence over the flags
    let (log_config, env_error) = log_config.merge_env_or_keep(EnvReader::new());
    if let Some(e) = env_error {
        eprintln!("Warning: ignoring LOG_* settings: {:#}", e);
    }

    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        },
    };

    let code = match execute(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "rawload failed");
            eprintln!("Error: {:#}", e);
            1
        },
    };

    // flush file logs before exiting
    drop(guard);
    process::exit(code);
}

async fn execute(cli: &Cli) -> Result<i32> {
    let config = Config::load().context("Invalid configuration")?;
    let catalog = Arc::new(olist_catalog().context("Invalid dataset catalog")?);

    if cli.check_connections {
        return check_connections(&config).await;
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let source = Arc::new(S3ObjectSource::new(&config.storage));
    let destination = Arc::new(
        PgDestination::connect(&config.database)
            .await
            .context("Cannot connect to the database")?,
    );

    let pipeline = Pipeline::new(
        catalog,
        source,
        destination.clone(),
        PipelineOptions::from_config(&config, cli.force_schema_recreate),
    );
    let summary = pipeline.run(&cancel).await;

    match cli.summary_format {
        SummaryFormat::Text => println!("{}", summary.render_text()),
        SummaryFormat::Json => println!("{}", summary.to_json()?),
    }

    destination.close().await;
    Ok(summary.exit_code())
}

/// Report on both stores without touching any data
async fn check_connections(config: &Config) -> Result<i32> {
    let mut healthy = true;

    let source = S3ObjectSource::new(&config.storage);
    match source.list_keys().await {
        Ok(keys) => println!("Object storage: OK, {} objects under {}", keys.len(), source.location()),
        Err(e) => {
            healthy = false;
            println!("Object storage: FAILED, {}", e);
        },
    }

    match PgDestination::connect(&config.database).await {
        Ok(destination) => {
            match destination.server_version().await {
                Ok(version) => println!("Database: OK, {}", version),
                Err(e) => {
                    healthy = false;
                    println!("Database: FAILED, {}", e);
                },
            }
            match destination.managed_tables().await {
                Ok(tables) if tables.is_empty() => println!("Managed tables: none"),
                Ok(tables) => println!(
                    "Managed tables: {}",
                    tables.into_iter().collect::<Vec<_>>().join(", ")
                ),
                Err(e) => {
                    healthy = false;
                    println!("Managed tables: FAILED, {}", e);
                },
            }
            destination.close().await;
        },
        Err(e) => {
            healthy = false;
            println!("Database: FAILED, {}", e);
        },
    }

    info!(healthy, "Connection check finished");
    Ok(if healthy { 0 } else { 1 })
}

/// Cancel `token` on Ctrl+C or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("Received Ctrl+C, cancelling run"),
        _ = terminate => warn!("Received terminate signal, cancelling run"),
    }
    token.cancel();
}
