//! Vantage proxy store: list/watch traffic is served from on-disk informer
//! caches, everything else is forwarded to the upstream API. Watches fan out
//! across access-control partitions with propagated cancellation.

#![forbid(unsafe_code)]

use metrics::counter;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use vantage_cache::{Cache, CacheError, CacheFactory, Transform, WatchOptions};
use vantage_client::{ClientFactory, DeleteParams, GetParams, PatchBody, ResourceClient, WriteParams};
use vantage_core::fields::{indexed_fields_for, parse_field_path, EXTERNAL_GVK_DEPENDENCIES, SELF_GVK_DEPENDENCIES};
use vantage_core::{
    ApiError, ApiRequest, ApiSchema, ErrorStatus, Event, Filter, Gvk, ListResult, Op, OrFilter, Partition,
    Warning, WarningBuffer, WatchRequest,
};

pub mod listprocessor;
pub mod table;

pub use listprocessor::parse_query;
pub use table::{move_from_underscore, row_to_object, table_to_objects, TableClient};

const ERR_NAMESPACE_REQUIRED: &str = "metadata.namespace or apiOp.namespace are required";
const ERR_RESOURCE_VERSION_REQUIRED: &str = "metadata.resourceVersion is required for update";

/// Upper bound on a PATCH body.
const MAX_PATCH_BYTES: usize = 2 << 20;

/// Produces upstream clients for a request/schema pair. Implemented by the
/// client factory; fakes slot in for tests.
pub trait ClientGetter: Send + Sync {
    /// Client acting with the caller's identity.
    fn client(
        &self,
        req: &ApiRequest,
        schema: &ApiSchema,
        warnings: WarningBuffer,
    ) -> Result<Arc<dyn ResourceClient>, ApiError>;

    /// Client acting with the proxy's own (elevated) identity, for informer
    /// feeds and warm-up traffic.
    fn admin_client(&self, schema: &ApiSchema, warnings: WarningBuffer) -> Result<Arc<dyn ResourceClient>, ApiError>;
}

impl ClientGetter for ClientFactory {
    fn client(
        &self,
        _req: &ApiRequest,
        schema: &ApiSchema,
        warnings: WarningBuffer,
    ) -> Result<Arc<dyn ResourceClient>, ApiError> {
        let dynamic = self.dynamic_client(warnings).map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(TableClient::new(Arc::new(dynamic.resource(&schema.gvk, schema.namespaced))))
    }

    fn admin_client(&self, schema: &ApiSchema, warnings: WarningBuffer) -> Result<Arc<dyn ResourceClient>, ApiError> {
        // impersonation is handled a layer above; admin and caller clients
        // share the factory budget here
        let dynamic = self.dynamic_client(warnings).map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(TableClient::new(Arc::new(dynamic.resource(&schema.gvk, schema.namespaced))))
    }
}

/// Supplies the per-kind ingest transform, if any. The schema/column layer
/// owns the actual rules.
pub trait TransformProvider: Send + Sync {
    fn transform_for(&self, schema: &ApiSchema) -> Option<Transform>;
}

/// No-op provider for deployments without transform rules.
pub struct NoTransforms;

impl TransformProvider for NoTransforms {
    fn transform_for(&self, _schema: &ApiSchema) -> Option<Transform> {
        None
    }
}

struct Inner {
    cache_factory: Arc<CacheFactory>,
    namespace_cache: Option<Cache>,
}

/// Store facade over the upstream API and the informer caches.
pub struct ProxyStore {
    client_getter: Arc<dyn ClientGetter>,
    transforms: Arc<dyn TransformProvider>,
    inner: Mutex<Inner>,
}

fn base_namespace_schema() -> ApiSchema {
    ApiSchema::new("namespaces", Gvk::new("", "v1", "Namespace"), false)
}

/// Column field paths declared by the schema, `$.`-prefix stripped.
fn fields_from_schema(schema: &ApiSchema) -> Vec<Vec<String>> {
    schema
        .columns
        .iter()
        .map(|col| parse_field_path(col.field.trim_start_matches("$.")))
        .filter(|path| !path.is_empty())
        .collect()
}

fn map_cache_err(err: CacheError) -> ApiError {
    match err {
        CacheError::InvalidColumn(msg) => ApiError::InvalidBodyContent(msg),
        CacheError::InvalidContinueToken(msg) => ApiError::InvalidBodyContent(msg),
        CacheError::Cancelled => ApiError::Cancelled,
        other => ApiError::Internal(other.to_string()),
    }
}

fn map_client_err(err: vantage_client::ClientError) -> ApiError {
    match err {
        vantage_client::ClientError::Api { status, message } => ApiError::from_status(status, message),
        vantage_client::ClientError::Config(msg) => ApiError::InvalidBodyContent(msg),
        vantage_client::ClientError::Transport(msg) => ApiError::Internal(msg),
    }
}

fn get_params(req: &ApiRequest) -> GetParams {
    GetParams { resource_version: req.query_param("resourceVersion").map(|s| s.to_string()) }
}

fn write_params(req: &ApiRequest) -> WriteParams {
    WriteParams {
        dry_run: req.query_param("dryRun").is_some(),
        field_manager: req.query_param("fieldManager").map(|s| s.to_string()),
    }
}

fn delete_params(req: &ApiRequest) -> Result<DeleteParams, ApiError> {
    let grace_period_seconds = match req.query_param("gracePeriodSeconds") {
        Some(raw) => Some(
            raw.parse::<u32>()
                .map_err(|_| ApiError::InvalidBodyContent(format!("invalid gracePeriodSeconds {raw:?}")))?,
        ),
        None => None,
    };
    Ok(DeleteParams { dry_run: req.query_param("dryRun").is_some(), grace_period_seconds })
}

fn watch_options(req: &ApiRequest, wr: &WatchRequest) -> WatchOptions {
    let id = wr.id.clone().filter(|id| !id.is_empty());
    let id_namespace = id
        .as_deref()
        .and_then(|id| id.rsplit_once('/'))
        .map(|(ns, _)| ns.to_string());
    WatchOptions {
        resource_version: wr.revision.clone().filter(|rv| !rv.is_empty()),
        namespace: id_namespace.or_else(|| req.namespace.clone()),
        id,
        selector: wr.selector.clone().filter(|s| !s.is_empty()),
    }
}

impl ProxyStore {
    /// Build the store and warm the namespace cache. Warm-up failure is not
    /// fatal; the next namespace request retries.
    pub async fn new(
        client_getter: Arc<dyn ClientGetter>,
        transforms: Arc<dyn TransformProvider>,
        cache_factory: Option<Arc<CacheFactory>>,
    ) -> Result<Arc<Self>, ApiError> {
        let cache_factory = match cache_factory {
            Some(factory) => factory,
            None => Arc::new(CacheFactory::new().map_err(map_cache_err)?),
        };
        let store = Arc::new(Self {
            client_getter,
            transforms,
            inner: Mutex::new(Inner { cache_factory, namespace_cache: None }),
        });
        if let Err(err) = store.initialize_namespace_cache().await {
            info!(error = %err, "failed to warm up namespace informer, will try again on next request");
        }
        Ok(store)
    }

    /// Tear down every cache, then rewarm the namespace informer.
    pub async fn reset(&self) -> Result<(), ApiError> {
        let factory = {
            let mut inner = self.inner.lock().unwrap();
            inner.namespace_cache = None;
            inner.cache_factory.clone()
        };
        factory.reset().await.map_err(map_cache_err)?;
        self.initialize_namespace_cache().await?;
        Ok(())
    }

    /// The namespace cache feeds project/namespace-aware query handling and
    /// must be live before such queries arrive.
    async fn initialize_namespace_cache(&self) -> Result<(), ApiError> {
        let schema = base_namespace_schema();
        let cache = self.cache_for_schema(&schema).await?;
        self.inner.lock().unwrap().namespace_cache = Some(cache);
        Ok(())
    }

    pub fn namespace_cache(&self) -> Option<Cache> {
        self.inner.lock().unwrap().namespace_cache.clone()
    }

    async fn cache_for_schema(&self, schema: &ApiSchema) -> Result<Cache, ApiError> {
        // warnings from inside the informer are discarded
        let client = self.client_getter.admin_client(schema, WarningBuffer::new())?;
        let gvk = schema.gvk.clone();
        let mut fields = fields_from_schema(schema);
        fields.extend(indexed_fields_for(&gvk));
        let factory = self.inner.lock().unwrap().cache_factory.clone();
        factory
            .cache_for(
                &fields,
                EXTERNAL_GVK_DEPENDENCIES.get(&gvk.key()).cloned(),
                SELF_GVK_DEPENDENCIES.get(&gvk.key()).cloned(),
                self.transforms.transform_for(schema),
                client,
                gvk,
                schema.namespaced,
                schema.list_watchable,
            )
            .await
            .map_err(map_cache_err)
    }

    /// Look up a single object by id through the upstream API.
    pub async fn by_id(
        &self,
        req: &ApiRequest,
        schema: &ApiSchema,
        id: &str,
    ) -> Result<(Value, Vec<Warning>), ApiError> {
        counter!("proxy_store_gets_total", 1u64);
        let buffer = WarningBuffer::new();
        let client = self.client_getter.client(req, schema, buffer.clone())?;
        let obj = client
            .get(req.namespace.as_deref(), id, &get_params(req))
            .await
            .map_err(map_client_err)?;
        Ok((obj, buffer.drain()))
    }

    /// Create an object upstream. Objects without a name get a generated one
    /// derived from the schema id.
    pub async fn create(
        &self,
        req: &ApiRequest,
        schema: &ApiSchema,
        payload: Value,
    ) -> Result<(Value, Vec<Warning>), ApiError> {
        counter!("proxy_store_creates_total", 1u64);
        let mut input = if payload.is_object() { payload } else { json!({}) };

        let name = input.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or_default();
        let generate_name =
            input.pointer("/metadata/generateName").and_then(|v| v.as_str()).unwrap_or_default();
        if name.is_empty() && generate_name.is_empty() {
            set_nested(&mut input, &["metadata", "generateName"], json!(format!("{}-", &schema.id[0..1])));
        }

        let mut namespace =
            input.pointer("/metadata/namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
        if schema.namespaced && namespace.as_deref().unwrap_or_default().is_empty() {
            match req.namespace.as_deref().filter(|ns| !ns.is_empty()) {
                Some(ns) => {
                    set_nested(&mut input, &["metadata", "namespace"], json!(ns));
                    namespace = Some(ns.to_string());
                }
                None => return Err(ApiError::InvalidBodyContent(ERR_NAMESPACE_REQUIRED.to_string())),
            }
        }

        let (api_version, kind) = schema.gvk.to_api_version_and_kind();
        input["apiVersion"] = json!(api_version);
        input["kind"] = json!(kind);

        let buffer = WarningBuffer::new();
        let client = self.client_getter.client(req, schema, buffer.clone())?;
        let created = client
            .create(namespace.as_deref(), input, &write_params(req))
            .await
            .map_err(map_client_err)?;
        Ok((created, buffer.drain()))
    }

    /// Replace or patch an object upstream. PATCH picks strategic-merge or
    /// JSON-patch from the request content type; replace requires the caller
    /// to supply `metadata.resourceVersion`.
    pub async fn update(
        &self,
        req: &ApiRequest,
        schema: &ApiSchema,
        payload: Value,
        id: &str,
    ) -> Result<(Value, Vec<Warning>), ApiError> {
        counter!("proxy_store_updates_total", 1u64);
        let buffer = WarningBuffer::new();
        let client = self.client_getter.client(req, schema, buffer.clone())?;
        let namespace = payload
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| req.namespace.clone());

        if req.method == http::Method::PATCH {
            if req.body.len() > MAX_PATCH_BYTES {
                return Err(ApiError::InvalidBodyContent("patch body exceeds 2 MiB".to_string()));
            }
            let json_patch = req.content_type.as_deref() == Some("application/json-patch+json");
            let body = if json_patch {
                PatchBody::Json(
                    serde_json::from_slice(&req.body)
                        .map_err(|e| ApiError::InvalidBodyContent(e.to_string()))?,
                )
            } else {
                let mut data: Value = serde_json::from_slice(&req.body)
                    .map_err(|e| ApiError::InvalidBodyContent(e.to_string()))?;
                move_from_underscore(&mut data);
                PatchBody::Strategic(data)
            };
            let patched = client
                .patch(namespace.as_deref(), id, body, &write_params(req))
                .await
                .map_err(map_client_err)?;
            return Ok((patched, buffer.drain()));
        }

        let mut input = payload;
        let rv = input
            .pointer("/metadata/resourceVersion")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if rv.is_empty() {
            return Err(ApiError::InvalidBodyContent(ERR_RESOURCE_VERSION_REQUIRED.to_string()));
        }
        let (api_version, kind) = schema.gvk.to_api_version_and_kind();
        input["apiVersion"] = json!(api_version);
        input["kind"] = json!(kind);
        move_from_underscore(&mut input);

        let updated = client
            .update(namespace.as_deref(), input, &write_params(req))
            .await
            .map_err(map_client_err)?;
        Ok((updated, buffer.drain()))
    }

    /// Delete an object and return its pre-delete state. A post-delete lookup
    /// miss deliberately reports `NoContent` and swallows the lookup error so
    /// repeated deletes stay idempotent.
    pub async fn delete(
        &self,
        req: &ApiRequest,
        schema: &ApiSchema,
        id: &str,
    ) -> Result<(Value, Vec<Warning>), ApiError> {
        counter!("proxy_store_deletes_total", 1u64);
        let buffer = WarningBuffer::new();
        let client = self.client_getter.client(req, schema, buffer.clone())?;
        client
            .delete(req.namespace.as_deref(), id, &delete_params(req)?)
            .await
            .map_err(map_client_err)?;

        match self.by_id(req, schema, id).await {
            Ok((obj, _)) => Ok((obj, buffer.drain())),
            Err(err) => {
                debug!(id, error = %err, "post-delete lookup failed, reporting no content");
                Err(ApiError::NoContent)
            }
        }
    }

    /// Cached list restricted to the caller's partitions.
    pub async fn list_by_partitions(
        &self,
        req: &ApiRequest,
        schema: &ApiSchema,
        partitions: &[Partition],
    ) -> Result<(ListResult, Vec<Warning>), ApiError> {
        counter!("proxy_store_lists_total", 1u64);
        let cache = self.cache_for_schema(schema).await?;

        let mut opts = match parse_query(req) {
            Ok(opts) => opts,
            Err(ApiError::NoContent) => {
                // the query can never match; answer empty at the current revision
                let result = ListResult {
                    revision: cache.latest_resource_version(),
                    ..ListResult::default()
                };
                return Ok((result, Vec::new()));
            }
            Err(err) => return Err(err),
        };

        self.append_access_filter(req, schema, &mut opts.filters)?;

        let result = cache
            .list_by_options(&req.cancel, &opts, partitions, req.namespace.as_deref())
            .map_err(map_cache_err)?;
        Ok((result, Vec::new()))
    }

    /// The extension token kinds carry per-user rows; callers without a
    /// cluster-wide list grant only ever see their own. The filter is applied
    /// ahead of partition expansion so every partition inherits it.
    fn append_access_filter(
        &self,
        req: &ApiRequest,
        schema: &ApiSchema,
        filters: &mut Vec<OrFilter>,
    ) -> Result<(), ApiError> {
        let gvk = &schema.gvk;
        if gvk.group != "ext.cattle.io" || (gvk.kind != "Token" && gvk.kind != "Kubeconfig") {
            return Ok(());
        }
        if req.access.grants("list", "*") {
            return Ok(());
        }
        let user = req
            .user
            .as_ref()
            .ok_or_else(|| ApiError::MissingRequired("failed to get user info from the request".to_string()))?;
        filters.push(OrFilter {
            filters: vec![Filter {
                field: vec!["metadata".to_string(), "labels".to_string(), "cattle.io/user-id".to_string()],
                matches: vec![user.name.clone()],
                op: Op::Eq,
                partial: false,
            }],
        });
        Ok(())
    }

    /// Cache-backed watch stream. Errors surface as an ERROR event followed
    /// by stream close, never as a hanging channel.
    pub async fn watch(
        self: &Arc<Self>,
        req: &ApiRequest,
        schema: &ApiSchema,
        wr: &WatchRequest,
    ) -> Result<mpsc::Receiver<Event>, ApiError> {
        let (tx, rx) = mpsc::channel(128);
        self.clone().spawn_watch(req.clone(), schema.clone(), wr.clone(), tx, None);
        Ok(rx)
    }

    /// Watch restricted to an allowed name set. Callers granted access to a
    /// finite set of names cannot watch the whole collection upstream; the
    /// cache watch runs wide and the disallowed names are dropped here.
    pub async fn watch_names(
        self: &Arc<Self>,
        req: &ApiRequest,
        schema: &ApiSchema,
        wr: &WatchRequest,
        names: BTreeSet<String>,
    ) -> Result<mpsc::Receiver<Event>, ApiError> {
        let (tx, rx) = mpsc::channel(128);
        self.clone().spawn_watch(req.clone(), schema.clone(), wr.clone(), tx, Some(names));
        Ok(rx)
    }

    fn spawn_watch(
        self: Arc<Self>,
        req: ApiRequest,
        schema: ApiSchema,
        wr: WatchRequest,
        out: mpsc::Sender<Event>,
        names: Option<BTreeSet<String>>,
    ) {
        tokio::spawn(async move {
            if let Err(err) = self.watch_into(&req, &schema, &wr, out.clone(), names).await {
                let _ = out
                    .send(Event::Error(ErrorStatus { message: err.to_string(), code: Some(err.status_code()) }))
                    .await;
            }
            debug!(schema = %schema.id, "closing watcher");
        });
    }

    async fn watch_into(
        &self,
        req: &ApiRequest,
        schema: &ApiSchema,
        wr: &WatchRequest,
        out: mpsc::Sender<Event>,
        names: Option<BTreeSet<String>>,
    ) -> Result<(), ApiError> {
        let cache = self.cache_for_schema(schema).await?;
        let opts = watch_options(req, wr);
        match names {
            None => cache.watch(&req.cancel, &opts, out).await.map_err(map_cache_err),
            Some(names) => {
                let (tx, mut rx) = mpsc::channel(128);
                let forward = async {
                    while let Some(event) = rx.recv().await {
                        let allowed = match &event {
                            Event::Error(_) => true,
                            other => other.object_name().map(|n| names.contains(n)).unwrap_or(false),
                        };
                        if allowed && out.send(event).await.is_err() {
                            break;
                        }
                    }
                };
                let (watched, ()) = tokio::join!(cache.watch(&req.cancel, &opts, tx), forward);
                watched.map_err(map_cache_err)
            }
        }
    }

    /// Run one watch per partition and merge the events into a single
    /// channel. The first worker error cancels the peers; the channel closes
    /// exactly once, when every worker has exited or the caller cancels.
    pub async fn watch_by_partitions(
        self: &Arc<Self>,
        req: &ApiRequest,
        schema: &ApiSchema,
        wr: &WatchRequest,
        partitions: &[Partition],
    ) -> Result<mpsc::Receiver<Event>, ApiError> {
        counter!("proxy_store_watches_total", 1u64);
        let child = req.cancel.child_token();
        let (tx, rx) = mpsc::channel(128);

        let mut workers = JoinSet::new();
        for partition in partitions.to_vec() {
            let store = self.clone();
            let mut worker_req = req.clone();
            worker_req.cancel = child.clone();
            let schema = schema.clone();
            let wr = wr.clone();
            let out = tx.clone();
            workers.spawn(async move {
                let names = match &partition {
                    Partition::Passthrough | Partition::All { .. } => None,
                    Partition::Names { names, .. } => Some(names.clone()),
                };
                if !matches!(partition, Partition::Passthrough) {
                    worker_req.namespace = partition.namespace().map(|s| s.to_string());
                }
                store.watch_into(&worker_req, &schema, &wr, out, names).await
            });
        }
        let cancel = child.clone();
        tokio::spawn(async move {
            // tx is held here so the output closes exactly once, after every
            // worker has exited
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(error = %err, "partition watch failed, unwinding peers");
                        let _ = tx
                            .send(Event::Error(ErrorStatus {
                                message: err.to_string(),
                                code: Some(err.status_code()),
                            }))
                            .await;
                        cancel.cancel();
                    }
                    Err(join_err) => {
                        warn!(error = %join_err, "partition watch panicked");
                        cancel.cancel();
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Set a nested JSON value, creating intermediate objects as needed.
fn set_nested(obj: &mut Value, path: &[&str], value: Value) {
    let mut current = obj;
    for key in &path[..path.len() - 1] {
        if !current.get(*key).map(|v| v.is_object()).unwrap_or(false) {
            current[*key] = json!({});
        }
        current = current.get_mut(*key).unwrap();
    }
    current[path[path.len() - 1]] = value;
}
