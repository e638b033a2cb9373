// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use receiptgate_daemon::{AppState, build_app};
use receiptgate_store::Store;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "receiptgate-daemon", version, about = "ReceiptGate ledger daemon")]
struct Args {
    /// Bind address for the HTTP surface.
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP daemon (default if no subcommand is given).
    Serve,
    /// Apply pending schema migrations and exit.
    Migrate,
    /// Recompute the edge and embedding projections from the receipt table.
    RebuildProjections,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    match run().await {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            tracing::error!(error = %err, "receiptgate-daemon exited with an error");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<receiptgate_config::ConfigError>().is_some() {
        1
    } else if err.downcast_ref::<MigrationError>().is_some() {
        2
    } else {
        3
    }
}

#[derive(Debug, thiserror::Error)]
#[error("migration failed")]
struct MigrationError;

/// `true` if `err`'s root cause is a [`receiptgate_error::ReceiptGateError`]
/// tagged by `Store::connect` as having failed during its implicit
/// `auto_migrate_on_startup` step, as opposed to the connection itself.
fn is_migration_failure(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<receiptgate_error::ReceiptGateError>())
        .any(|e| e.context.get("stage").and_then(|v| v.as_str()) == Some("migrate"))
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let config = receiptgate_config::load_from_env()?;

    let store = match Store::connect(&config.database_url, config.auto_migrate_on_startup).await {
        Ok(store) => store,
        Err(err) => {
            let err = anyhow::Error::new(err).context("connect to database");
            if is_migration_failure(&err) {
                return Err(err).context(MigrationError);
            }
            return Err(err);
        }
    };

    match args.command.unwrap_or(Command::Serve) {
        Command::Migrate => {
            store.migrate().await.map_err(|_| MigrationError)?;
            info!("migrations applied");
            Ok(())
        }
        Command::RebuildProjections => {
            if config.enable_graph_layer {
                let edges = receiptgate_projection::rebuild_edges(&store).await?;
                info!(edges, "rebuilt receipt_edges projection");
            }
            if config.enable_semantic_layer {
                let embeddings = receiptgate_projection::rebuild_embeddings(&store).await?;
                info!(embeddings, "rebuilt receipt_embeddings projection");
            }
            Ok(())
        }
        Command::Serve => serve(args.bind, config, store).await,
    }
}

async fn serve(bind: String, config: receiptgate_config::ReceiptGateConfig, store: Store) -> Result<()> {
    let state = Arc::new(AppState { store: Arc::new(store), config, instance_id: Uuid::new_v4() });
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(bind = %bind, "receiptgate-daemon listening");

    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}
