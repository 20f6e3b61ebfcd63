//! Database discovery, schema deployment, and per-name store memoisation
//! (`spec.md` §4.8). Replaces the source's "lazy cache construction mixed
//! with background schema deployment under a lock and `_ = Task.Run(…)`"
//! (§9) with an observable completion signal and a double-checked
//! `OnceCell` barrier.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use msgcore_types::StoreError;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One database the discovery source knows about (`spec.md` §6 "Discovery
/// source: `discoverDatabases() -> list<{name, connection, schema}>`").
#[derive(Debug, Clone)]
pub struct DatabaseDescriptor {
    pub name: String,
    pub connection_string: String,
    pub schema: String,
}

#[async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn discover_databases(&self) -> Result<Vec<DatabaseDescriptor>, StoreError>;
}

/// Enumerates the required tables/indexes per enabled primitive and runs
/// idempotent migrations against one database (`spec.md` §4.8).
#[async_trait]
pub trait SchemaDeployer: Send + Sync {
    async fn deploy(&self, db: &DatabaseDescriptor, cancel: CancellationToken) -> Result<(), StoreError>;
}

/// Observable replacement for a fire-and-forget deployment task: workers
/// that must not start before migrations land call `wait_until_complete`.
#[derive(Clone)]
pub struct SchemaDeploymentSignal {
    tx: Arc<tokio::sync::watch::Sender<bool>>,
    rx: tokio::sync::watch::Receiver<bool>,
}

impl SchemaDeploymentSignal {
    pub fn new() -> Self {
        let (tx, rx) = tokio::sync::watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn is_complete(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait_until_complete(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    fn mark_complete(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for SchemaDeploymentSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Deploys schema to every discovered database, then to `control_plane` if
/// given, then marks `signal` complete. Intended to run as a background
/// `tokio::spawn` task started once at daemon startup (`spec.md` §4.8,
/// §9 redesign: an observable task, not `_ = Task.Run(...)`).
pub async fn deploy_schema(
    source: Arc<dyn DiscoverySource>,
    deployer: Arc<dyn SchemaDeployer>,
    control_plane: Option<DatabaseDescriptor>,
    signal: SchemaDeploymentSignal,
    cancel: CancellationToken,
) -> Result<(), StoreError> {
    let databases = source.discover_databases().await?;
    for db in &databases {
        if cancel.is_cancelled() {
            break;
        }
        info!(database = %db.name, "deploying schema");
        deployer.deploy(db, cancel.clone()).await.map_err(|err| {
            warn!(database = %db.name, error = %err, "schema deployment failed");
            err
        })?;
    }

    if let Some(control_plane) = &control_plane {
        info!(database = %control_plane.name, "deploying control-plane schema bundle");
        deployer.deploy(control_plane, cancel.clone()).await?;
    }

    signal.mark_complete();
    info!(count = databases.len(), "schema deployment completed");
    Ok(())
}

/// Per-name store/factory memoisation so that concurrent callers asking
/// for the same database's store see exactly one constructed instance
/// (`spec.md` §9 "hidden shared state in routers" redesign flag: the
/// router's contract is that lookups are linearisable per name).
pub struct DiscoveryRouter<T: Send + Sync + 'static> {
    source: Arc<dyn DiscoverySource>,
    factory: Arc<dyn Fn(&DatabaseDescriptor) -> Arc<T> + Send + Sync>,
    cells: Mutex<HashMap<String, Arc<OnceCell<Arc<T>>>>>,
    all_barrier: OnceCell<Vec<(String, Arc<T>)>>,
}

impl<T: Send + Sync + 'static> DiscoveryRouter<T> {
    pub fn new(
        source: Arc<dyn DiscoverySource>,
        factory: Arc<dyn Fn(&DatabaseDescriptor) -> Arc<T> + Send + Sync>,
    ) -> Self {
        Self {
            source,
            factory,
            cells: Mutex::new(HashMap::new()),
            all_barrier: OnceCell::new(),
        }
    }

    /// Returns the store for `name`, discovering and constructing it on
    /// first request. Double-checked: the per-name `OnceCell` is looked up
    /// under a short-held map lock, then initialised outside of it so a
    /// slow factory call for one database never blocks lookups of another.
    pub async fn get(&self, name: &str) -> Result<Arc<T>, StoreError> {
        let cell = {
            let mut cells = self.cells.lock().await;
            cells.entry(name.to_string()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        let factory = self.factory.clone();
        let source = self.source.clone();
        let name = name.to_string();
        let store = cell
            .get_or_try_init(|| async move {
                let databases = source.discover_databases().await?;
                let db = databases
                    .into_iter()
                    .find(|d| d.name == name)
                    .ok_or_else(|| StoreError::not_found(format!("database {name} not discovered")))?;
                Ok::<_, StoreError>(factory(&db))
            })
            .await?;
        Ok(store.clone())
    }

    /// Returns every discovered database's store, constructing any not yet
    /// memoised. Linearisable: concurrent callers share one discovery +
    /// construction pass via the `all_barrier` cell.
    pub async fn get_all(&self) -> Result<Vec<(String, Arc<T>)>, StoreError> {
        let factory = self.factory.clone();
        let source = self.source.clone();
        let all = self
            .all_barrier
            .get_or_try_init(|| async move {
                let databases = source.discover_databases().await?;
                let mut out = Vec::with_capacity(databases.len());
                for db in &databases {
                    out.push((db.name.clone(), factory(db)));
                }
                Ok::<_, StoreError>(out)
            })
            .await?;
        Ok(all.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSource {
        databases: Vec<DatabaseDescriptor>,
    }

    #[async_trait]
    impl DiscoverySource for FixedSource {
        async fn discover_databases(&self) -> Result<Vec<DatabaseDescriptor>, StoreError> {
            Ok(self.databases.clone())
        }
    }

    struct RecordingDeployer {
        deployed: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SchemaDeployer for RecordingDeployer {
        async fn deploy(&self, db: &DatabaseDescriptor, _cancel: CancellationToken) -> Result<(), StoreError> {
            self.deployed.lock().unwrap().push(db.name.clone());
            Ok(())
        }
    }

    fn source() -> Arc<FixedSource> {
        Arc::new(FixedSource {
            databases: vec![
                DatabaseDescriptor {
                    name: "tenant-a".to_string(),
                    connection_string: "postgres://a".to_string(),
                    schema: "infra".to_string(),
                },
                DatabaseDescriptor {
                    name: "tenant-b".to_string(),
                    connection_string: "postgres://b".to_string(),
                    schema: "infra".to_string(),
                },
            ],
        })
    }

    #[tokio::test]
    async fn deploy_schema_visits_every_database_then_completes_the_signal() {
        let deployer = Arc::new(RecordingDeployer { deployed: std::sync::Mutex::new(Vec::new()) });
        let signal = SchemaDeploymentSignal::new();

        assert!(!signal.is_complete());
        deploy_schema(source(), deployer.clone(), None, signal.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert!(signal.is_complete());
        assert_eq!(deployer.deployed.lock().unwrap().as_slice(), &["tenant-a", "tenant-b"]);
    }

    #[tokio::test]
    async fn discovery_router_memoises_construction_per_name() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let router = Arc::new(DiscoveryRouter::new(
            source(),
            Arc::new(move |db: &DatabaseDescriptor| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Arc::new(db.connection_string.clone())
            }),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let router = router.clone();
            handles.push(tokio::spawn(async move { router.get("tenant-a").await.unwrap() }));
        }
        for h in handles {
            let conn = h.await.unwrap();
            assert_eq!(*conn, "postgres://a");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "factory must run exactly once per name");
    }

    #[tokio::test]
    async fn discovery_router_get_all_returns_every_database() {
        let router = DiscoveryRouter::new(source(), Arc::new(|db: &DatabaseDescriptor| Arc::new(db.name.clone())));
        let all = router.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn get_unknown_database_name_is_not_found() {
        let router: DiscoveryRouter<String> =
            DiscoveryRouter::new(source(), Arc::new(|db: &DatabaseDescriptor| Arc::new(db.name.clone())));
        let err = router.get("does-not-exist").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
