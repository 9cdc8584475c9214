use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::attack::{AttackConfig, Attacker};
use crate::cache::IndexCache;
use crate::config::Config;
use crate::definitions::Definitions;
use crate::scheduler::Scheduler;
use crate::server::{self, AppState};
use crate::store::{SqliteStorage, Storage, select_every};

/// Page size used to warm the cache at boot
const WARM_PAGE_SIZE: usize = 100;

/// Wires the store, cache, attacker, scheduler and API together and owns
/// their shutdown
pub struct App {
    config: Config,
    definitions: Definitions,
    attacker: Arc<Attacker>,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
}

impl App {
    /// Open the configured store and build every component
    ///
    /// Failing to open the store is fatal.
    pub fn bootstrap(config: Config) -> Result<Self> {
        let store: Arc<dyn Storage> = if config.database.is_memory() {
            Arc::new(SqliteStorage::open_in_memory().context("failed to open in-memory store")?)
        } else {
            Arc::new(
                SqliteStorage::open(&config.database.path)
                    .with_context(|| format!("failed to open store at {}", config.database.path))?,
            )
        };
        store.healthy().context("definition store is not healthy")?;

        Self::with_store(config, store)
    }

    /// Build the service around an already opened store
    pub fn with_store(config: Config, store: Arc<dyn Storage>) -> Result<Self> {
        let cache = IndexCache::new(config.cache.size, config.cache.ttl);
        let warmed = warm(store.as_ref(), &cache)?;
        info!(definitions = warmed, "Warmed index cache");

        let attacker = Arc::new(
            Attacker::new(AttackConfig::from(&config.attack)).context("failed to build HTTP client")?,
        );
        let shutdown = CancellationToken::new();
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            cache.clone(),
            attacker.clone(),
            config.timer.clone(),
            shutdown.child_token(),
        ));

        Ok(Self {
            config,
            definitions: Definitions::new(store, cache),
            attacker,
            scheduler,
            shutdown,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn definitions(&self) -> &Definitions {
        &self.definitions
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Token that stops the whole service when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured address and run until `signal` resolves
    pub async fn run<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let address = self.config.server.address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind {address}"))?;
        self.serve(listener, signal).await
    }

    /// Run the API on `listener` and the scheduler until `signal` resolves or
    /// the shutdown token is cancelled
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let local_addr: Option<SocketAddr> = listener.local_addr().ok();
        info!(addr = ?local_addr, "Starting arquebus");

        let scheduler = self.scheduler.clone();
        let mut scheduler_task = tokio::spawn(async move { scheduler.run().await });

        let state = AppState {
            definitions: self.definitions.clone(),
            attacker: self.attacker.clone(),
            shutdown: self.shutdown.child_token(),
        };
        let server_shutdown = self.shutdown.clone();
        let mut server_task = tokio::spawn(async move {
            let result = server::serve(listener, state, server_shutdown.child_token()).await;
            if let Err(e) = &result {
                error!("API server failed: {}", e);
            }
            // Losing the API takes the whole service down
            server_shutdown.cancel();
            result
        });

        tokio::select! {
            _ = signal => info!("Shutdown signal received"),
            _ = self.shutdown.cancelled() => {}
        }
        self.shutdown.cancel();

        // In-flight requests get their own grace before the run reports back
        let deadline = self.config.shutdown_grace + self.config.attack.cancel_grace;
        let drained = tokio::time::timeout(deadline, async {
            let (scheduler, server) = tokio::join!(&mut scheduler_task, &mut server_task);
            (scheduler, server)
        })
        .await;

        match drained {
            Ok((scheduler, server)) => {
                if let Err(e) = scheduler {
                    error!("Scheduler task failed: {}", e);
                }
                match server {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e).context("API server failed"),
                    Err(e) => error!("API server task failed: {}", e),
                }
                info!("Shutdown complete");
            }
            Err(_) => {
                warn!(grace = ?deadline, "Shutdown grace elapsed, aborting remaining tasks");
                scheduler_task.abort();
                server_task.abort();
            }
        }
        Ok(())
    }
}

fn warm(store: &dyn Storage, cache: &IndexCache) -> Result<usize> {
    let records = select_every(store, WARM_PAGE_SIZE).context("failed to list definitions")?;
    for record in &records {
        if let Err(e) = cache.put(record) {
            warn!(id = record.id, "Failed to index definition: {}", e);
        }
    }
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerState;
    use crate::store::MemoryStorage;
    use serde_json::json;
    use std::time::Duration;

    fn config() -> Config {
        let mut config = Config::default();
        config.database.path = ":memory:".to_string();
        config.server.bind = "127.0.0.1".to_string();
        config.server.port = 0;
        config.shutdown_grace = Duration::from_millis(500);
        config
    }

    #[test]
    fn bootstrap_fails_when_the_store_cannot_be_opened() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        // A directory is not a database file
        config.database.path = dir.path().to_string_lossy().into_owned();
        assert!(App::bootstrap(config).is_err());
    }

    #[tokio::test]
    async fn existing_definitions_are_warmed_into_the_cache() {
        let store = Arc::new(MemoryStorage::new());
        store
            .insert("smoke", &json!({"name": "smoke", "url": "http://x/", "rate": 1, "duration": "1s"}))
            .unwrap();

        let app = App::with_store(config(), store).unwrap();
        assert_eq!(app.definitions().cache().record("smoke").unwrap().id, 1);
    }

    #[tokio::test]
    async fn signal_stops_scheduler_and_server() {
        let app = App::bootstrap(config()).unwrap();
        let scheduler = app.scheduler().clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(app.serve(listener, async move {
            let _ = rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }
}
