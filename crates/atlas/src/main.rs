use anyhow::{bail, Context, Result};
use atlas_core::backup::BackupEngine;
use atlas_core::content_sync::ContentSynchronizer;
use atlas_core::promote::{FinalizePromoter, PromotionOutcome};
use atlas_core::restore::RestoreCoordinator;
use atlas_core::store::IndexStore;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod server;

use config::Config;
use server::{AppState, Server};

#[derive(Parser)]
#[command(name = "atlas", version, about = "Markdown wiki index with signed backups")]
struct Opts {
    /// Path to the TOML config file
    #[arg(long, short, env = "ATLAS_CONFIG", default_value = "atlas.toml")]
    config: PathBuf,

    #[command(subcommand)]
    subcmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sync the index and serve the HTTP API
    Serve {
        #[arg(long, env = "ATLAS_HOST")]
        host: Option<String>,

        #[arg(long, short, env = "ATLAS_PORT")]
        port: Option<u16>,
    },

    /// Run one full content synchronization
    Sync,

    /// Create, list or verify backups
    Backup {
        #[command(subcommand)]
        action: BackupCommand,
    },

    /// Restore a backup in place. The server must not be running.
    Restore {
        /// Archive name inside the backups directory
        file: String,
    },
}

#[derive(Subcommand)]
enum BackupCommand {
    Create,
    List,
    Verify { file: String },
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,atlas=debug,atlas_core=debug")),
        )
        .init();

    let opts = Opts::parse();
    let mut config = Config::load(&opts.config)?;

    match opts.subcmd {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            let addr = format!("{}:{}", config.server.host, config.server.port);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind {addr}"))?;
            let state = AppState::open(&config)?;
            Server::new(state, config.shutdown_grace())
                .serve(listener)
                .await?;
        }
        Command::Sync => {
            let state = AppState::open(&config)?;
            let report = state.synchronizer.sync_all()?;
            state.store.close()?;
            print_json(&report)?;
        }
        Command::Backup { action } => {
            let paths = config.paths();
            paths.ensure_dirs()?;
            let engine = BackupEngine::new(paths.clone());
            match action {
                BackupCommand::Create => {
                    if paths.database.is_file() {
                        let store = IndexStore::open(&paths.database, config.store_options())?;
                        store.checkpoint()?;
                        store.close()?;
                    }
                    print_json(&engine.create_backup()?)?;
                }
                BackupCommand::List => print_json(&engine.list_backups()?)?,
                BackupCommand::Verify { file } => {
                    let path = engine.resolve_backup_file(&file)?;
                    if !engine.verify_backup(&path)? {
                        bail!("Backup {} failed verification", file);
                    }
                    println!("{file}: OK");
                }
            }
        }
        Command::Restore { file } => {
            let paths = config.paths();
            paths.ensure_dirs()?;
            let engine = BackupEngine::new(paths.clone());
            let coordinator = RestoreCoordinator::new();
            coordinator.request_restore(&engine, &file)?;
            let Some(stage) = coordinator.begin_promotion() else {
                bail!("Restore of {} was not staged", file);
            };
            let outcome = FinalizePromoter::new(paths.clone()).promote(&stage);
            coordinator.finish();
            print_json(&outcome)?;
            if let PromotionOutcome::PartiallyPromoted { failures } = outcome {
                bail!("{} restore units failed", failures.len());
            }

            let store = Arc::new(IndexStore::open(&paths.database, config.store_options())?);
            let report = ContentSynchronizer::new(paths, store.clone()).sync_all()?;
            store.close()?;
            tracing::info!("Re-indexed {} documents after restore", report.scanned);
        }
    }

    Ok(())
}
