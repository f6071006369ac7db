//! The serving process and its shutdown-selection loop.

use anyhow::{Context, Result};
use atlas_core::backup::BackupEngine;
use atlas_core::content_sync::ContentSynchronizer;
use atlas_core::documents::DocumentService;
use atlas_core::error::StoreError;
use atlas_core::paths::ContentPaths;
use atlas_core::promote::{FinalizePromoter, PromotionOutcome};
use atlas_core::restore::RestoreCoordinator;
use atlas_core::store::IndexStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::api;
use crate::config::Config;

/// Shared state behind every HTTP handler.
pub struct AppState {
    pub paths: ContentPaths,
    pub store: Arc<IndexStore>,
    pub synchronizer: ContentSynchronizer,
    pub documents: DocumentService,
    pub engine: BackupEngine,
    pub coordinator: Arc<RestoreCoordinator>,
}

impl AppState {
    pub fn open(config: &Config) -> Result<Self> {
        let paths = config.paths();
        paths
            .ensure_dirs()
            .with_context(|| format!("Failed to create {}", paths.content_root.display()))?;
        let store = Arc::new(
            IndexStore::open(&paths.database, config.store_options())
                .with_context(|| format!("Failed to open {}", paths.database.display()))?,
        );
        Ok(Self {
            synchronizer: ContentSynchronizer::new(paths.clone(), store.clone()),
            documents: DocumentService::new(paths.clone(), store.clone()),
            engine: BackupEngine::new(paths.clone()),
            coordinator: Arc::new(RestoreCoordinator::new()),
            store,
            paths,
        })
    }
}

pub struct Server {
    state: Arc<AppState>,
    grace: Duration,
}

impl Server {
    pub fn new(state: AppState, grace: Duration) -> Self {
        Self {
            state: Arc::new(state),
            grace,
        }
    }

    /// Serve until a signal arrives or a restore is staged.
    ///
    /// On a staged restore the listener is drained, the index store closed,
    /// and the staged files promoted before returning.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let state = self.state.clone();
        let report = tokio::task::spawn_blocking(move || state.synchronizer.sync_all()).await??;
        info!(
            "Startup sync: {} scanned, {} upserted, {} removed",
            report.scanned, report.write.upserted, report.write.removed
        );

        info!("Listening on http://{}", listener.local_addr()?);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let app = api::router(self.state.clone());
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.await;
                })
                .await
        });

        let staged = tokio::select! {
            _ = shutdown_signal() => None,
            path = self.state.coordinator.wait_for_staged() => {
                info!("Restore staged at {}, shutting down", path.display());
                Some(path)
            }
            result = &mut server => {
                result??;
                warn!("HTTP server stopped on its own");
                None
            }
        };

        let _ = stop_tx.send(());
        if !server.is_finished() {
            match tokio::time::timeout(self.grace, &mut server).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("HTTP server exited with error: {}", e),
                Ok(Err(e)) => warn!("HTTP server task failed: {}", e),
                Err(_) => {
                    warn!("Requests still running after {:?}, aborting", self.grace);
                    server.abort();
                }
            }
        }

        let closed = self.state.store.close();
        if staged.is_some() {
            finish_restore(&self.state, closed).await?;
        } else {
            closed?;
        }
        info!("Shutdown complete");
        Ok(())
    }
}

/// Promote a staged restore once the store is closed. A store that failed
/// to close may still hold the database, so the stage is dropped instead.
async fn finish_restore(state: &Arc<AppState>, closed: Result<(), StoreError>) -> Result<()> {
    if let Err(e) = closed {
        error!("Failed to close the index store, abandoning staged restore: {}", e);
        state.coordinator.abandon();
        return Err(anyhow::Error::new(e).context("Restore was not promoted"));
    }
    promote_staged(state).await
}

async fn promote_staged(state: &Arc<AppState>) -> Result<()> {
    let Some(stage) = state.coordinator.begin_promotion() else {
        return Ok(());
    };
    let promoter = FinalizePromoter::new(state.paths.clone());
    let outcome = tokio::task::spawn_blocking(move || promoter.promote(&stage)).await?;
    state.coordinator.finish();
    match outcome {
        PromotionOutcome::Done => {
            info!("Restore promoted; restart to serve the restored content");
            Ok(())
        }
        PromotionOutcome::PartiallyPromoted { failures } => {
            for failure in &failures {
                error!("Restore unit {} failed: {}", failure.unit, failure.error);
            }
            anyhow::bail!("Restore only partially promoted ({} units failed)", failures.len())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tmp: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.content_dir = tmp.join("content");
        config.storage.data_dir = tmp.join("data");
        config.server.shutdown_grace_secs = 1;
        config
    }

    #[tokio::test]
    async fn staged_restore_stops_server_and_promotes() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let state = AppState::open(&config).unwrap();
        std::fs::write(state.paths.published_root.join("a.md"), "# A").unwrap();
        let backup = state.engine.create_backup().unwrap();
        std::fs::remove_file(state.paths.published_root.join("a.md")).unwrap();

        let engine = state.engine.clone();
        let coordinator = state.coordinator.clone();
        let store = state.store.clone();
        let paths = state.paths.clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = tokio::spawn(Server::new(state, config.shutdown_grace()).serve(listener));

        let name = backup.name.clone();
        tokio::task::spawn_blocking(move || coordinator.request_restore(&engine, &name))
            .await
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .expect("server should stop after a restore is staged")
            .unwrap()
            .unwrap();
        assert!(store.is_closed());
        assert!(paths.published_root.join("a.md").is_file());
    }

    #[tokio::test]
    async fn failed_store_close_abandons_the_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let state = Arc::new(AppState::open(&config(tmp.path())).unwrap());
        std::fs::write(state.paths.published_root.join("a.md"), "# A").unwrap();
        let backup = state.engine.create_backup().unwrap();
        std::fs::remove_file(state.paths.published_root.join("a.md")).unwrap();
        let staging = state
            .coordinator
            .request_restore(&state.engine, &backup.name)
            .unwrap();

        let result = finish_restore(&state, Err(StoreError::Busy)).await;
        assert!(result.is_err());
        assert!(state.coordinator.is_idle());
        assert!(!staging.exists());
        assert!(!state.paths.published_root.join("a.md").exists());

        // The slot is free again for a later attempt.
        state
            .coordinator
            .request_restore(&state.engine, &backup.name)
            .unwrap();
    }
}
