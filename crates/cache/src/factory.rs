//! Cache factory: deduplicates informer construction per fingerprint and
//! owns informer lifecycle, including teardown on reset.

use crate::informer::{Informer, InformerConfig, Transform, WatchOptions};
use crate::store::IndexedStore;
use crate::CacheError;
use metrics::gauge;
use rustc_hash::FxHashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vantage_client::ResourceClient;
use vantage_core::fields::{field_path_label, parse_field_path, ExternalGvkUpdates};
use vantage_core::{Event, Gvk, ListOptions, ListResult, Partition};

/// Identity of one cached informer. Requests with equal fingerprints share
/// one live instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Fingerprint {
    gvk: Gvk,
    namespaced: bool,
    /// Sorted, deduplicated column labels.
    fields: Vec<String>,
    transform: Option<String>,
}

impl Fingerprint {
    fn new(gvk: &Gvk, namespaced: bool, fields: &[Vec<String>], transform: Option<&Transform>) -> Self {
        let mut labels: Vec<String> = fields.iter().map(|p| field_path_label(p)).collect();
        labels.sort();
        labels.dedup();
        Self {
            gvk: gvk.clone(),
            namespaced,
            fields: labels,
            transform: transform.map(|t| t.id.clone()),
        }
    }

    fn db_file(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.fields.hash(&mut hasher);
        let suffix = match &self.transform {
            Some(id) => format!("_{id}"),
            None => String::new(),
        };
        format!("{}{}_{:08x}.db", self.gvk.key(), suffix, hasher.finish() as u32)
    }
}

struct RunningInformer {
    informer: Arc<Informer>,
    handle: JoinHandle<()>,
}

/// Shared factory state. Informers hold a weak reference back for dependency
/// target lookups.
pub(crate) struct Registry {
    base_dir: PathBuf,
    slots: Mutex<FxHashMap<Fingerprint, Arc<OnceCell<Cache>>>>,
    running: Mutex<Vec<RunningInformer>>,
}

impl Registry {
    /// Store of any initialized cache for the kind, regardless of transform.
    pub(crate) fn store_for(&self, gvk: &Gvk) -> Option<Arc<IndexedStore>> {
        let slots = self.slots.lock().unwrap();
        for (fingerprint, cell) in slots.iter() {
            if fingerprint.gvk == *gvk {
                if let Some(cache) = cell.get() {
                    return Some(cache.informer().store());
                }
            }
        }
        None
    }
}

/// Handle to one shared informer.
#[derive(Clone)]
pub struct Cache {
    informer: Arc<Informer>,
}

impl Cache {
    pub fn informer(&self) -> &Arc<Informer> {
        &self.informer
    }

    pub fn latest_resource_version(&self) -> String {
        self.informer.latest_resource_version()
    }

    /// Structured query against the indexed table, scoped by namespace and
    /// partitions, stamped with the informer's current revision.
    pub fn list_by_options(
        &self,
        cancel: &CancellationToken,
        opts: &ListOptions,
        partitions: &[Partition],
        namespace: Option<&str>,
    ) -> Result<ListResult, CacheError> {
        let revision = self.informer.latest_resource_version();
        self.informer.store().list_by_options(cancel, opts, partitions, namespace, &revision)
    }

    pub async fn watch(
        &self,
        cancel: &CancellationToken,
        opts: &WatchOptions,
        out: mpsc::Sender<Event>,
    ) -> Result<(), CacheError> {
        self.informer.watch(cancel, opts, out).await
    }
}

fn default_base_dir() -> PathBuf {
    if let Ok(path) = std::env::var("VANTAGE_CACHE_PATH") {
        return PathBuf::from(path);
    }
    std::env::temp_dir().join(format!("vantage-cache-{}", std::process::id()))
}

/// Produces and owns per-resource caches. `reset` tears every informer down
/// and leaves the factory ready for fresh construction.
pub struct CacheFactory {
    registry: Arc<Registry>,
}

impl CacheFactory {
    pub fn new() -> Result<Self, CacheError> {
        Self::with_base_dir(default_base_dir())
    }

    pub fn with_base_dir(base_dir: PathBuf) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&base_dir)
            .map_err(|e| CacheError::Internal(format!("cache dir {}: {e}", base_dir.display())))?;
        Ok(Self {
            registry: Arc::new(Registry {
                base_dir,
                slots: Mutex::new(FxHashMap::default()),
                running: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Return the live cache for the fingerprint, constructing and hydrating
    /// one if needed. Concurrent callers with the same fingerprint share one
    /// construction; losers wait for the winner's hydration.
    #[allow(clippy::too_many_arguments)]
    pub async fn cache_for(
        &self,
        fields: &[Vec<String>],
        external_updates: Option<ExternalGvkUpdates>,
        self_updates: Option<ExternalGvkUpdates>,
        transform: Option<Transform>,
        client: Arc<dyn ResourceClient>,
        gvk: Gvk,
        namespaced: bool,
        watchable: bool,
    ) -> Result<Cache, CacheError> {
        // dependency source and target columns ride along implicitly
        let mut fields = fields.to_vec();
        if let Some(updates) = &self_updates {
            for dep in &updates.label_dependencies {
                fields.push(vec![
                    "metadata".to_string(),
                    "labels".to_string(),
                    dep.source_label.clone(),
                ]);
                fields.push(parse_field_path(&dep.target_final_field));
            }
        }
        let fingerprint = Fingerprint::new(&gvk, namespaced, &fields, transform.as_ref());

        let cell = {
            let mut slots = self.registry.slots.lock().unwrap();
            slots.entry(fingerprint.clone()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        let result = cell
            .get_or_try_init(|| {
                self.start_informer(
                    &fingerprint,
                    fields.clone(),
                    external_updates.clone(),
                    self_updates.clone(),
                    transform.clone(),
                    client.clone(),
                    gvk.clone(),
                    namespaced,
                    watchable,
                )
            })
            .await
            .cloned();

        if result.is_err() {
            // leave the fingerprint non-live so the next caller can retry
            let mut slots = self.registry.slots.lock().unwrap();
            if let Some(existing) = slots.get(&fingerprint) {
                if Arc::ptr_eq(existing, &cell) && existing.get().is_none() {
                    slots.remove(&fingerprint);
                }
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_informer(
        &self,
        fingerprint: &Fingerprint,
        fields: Vec<Vec<String>>,
        external_updates: Option<ExternalGvkUpdates>,
        self_updates: Option<ExternalGvkUpdates>,
        transform: Option<Transform>,
        client: Arc<dyn ResourceClient>,
        gvk: Gvk,
        namespaced: bool,
        watchable: bool,
    ) -> Result<Cache, CacheError> {
        debug!(gvk = %gvk, watchable, "constructing informer");
        let store = Arc::new(IndexedStore::new(
            &self.registry.base_dir.join(fingerprint.db_file()),
            &fields,
        )?);
        let informer = Informer::new(
            InformerConfig { gvk, namespaced, watchable, transform, external_updates, self_updates },
            store,
            client,
            Arc::downgrade(&self.registry),
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(informer.clone().run(ready_tx));
        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(CacheError::Construction("informer exited before hydration".to_string())),
        }

        let mut running = self.registry.running.lock().unwrap();
        running.push(RunningInformer { informer: informer.clone(), handle });
        gauge!("cache_informers", running.len() as f64);
        Ok(Cache { informer })
    }

    /// Number of live informers.
    pub fn len(&self) -> usize {
        self.registry.running.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tear down every informer: cancel, wait for the loops to exit, drop all
    /// registrations. Returns once new construction can proceed.
    pub async fn reset(&self) -> Result<(), CacheError> {
        let drained: Vec<RunningInformer> = {
            let mut running = self.registry.running.lock().unwrap();
            std::mem::take(&mut *running)
        };
        let tokens: Vec<CancellationToken> =
            drained.iter().map(|r| r.informer.cancel_token()).collect();
        for token in tokens {
            token.cancel();
        }
        for entry in drained {
            let _ = entry.handle.await;
        }
        self.registry.slots.lock().unwrap().clear();
        gauge!("cache_informers", 0.0);
        info!("cache factory reset");
        Ok(())
    }
}
