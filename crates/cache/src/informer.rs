//! One live informer: hydrates an indexed store from upstream, keeps it
//! coherent through a single watch, and multiplexes filtered event streams
//! to any number of subscribers.

use crate::factory::Registry;
use crate::store::{object_id, IndexedStore};
use crate::{backoff_max_secs, page_limit, parse_rv, relist_secs, watch_buffer, watch_timeout_secs, CacheError};
use futures::StreamExt;
use kube::core::{Selector, SelectorExt};
use metrics::{counter, gauge, histogram};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vantage_client::{PageParams, ResourceClient, UpstreamEvent};
use vantage_core::fields::{extract_field, field_path_label, parse_field_path, ExternalGvkUpdates};
use vantage_core::{ErrorStatus, Event, Gvk};

/// Deterministic per-object rewrite applied on ingest. The id participates in
/// the cache fingerprint; equal ids must mean equal behavior.
#[derive(Clone)]
pub struct Transform {
    pub id: String,
    func: Arc<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync>,
}

impl Transform {
    pub fn new(id: &str, func: impl Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static) -> Self {
        Self { id: id.to_string(), func: Arc::new(func) }
    }

    pub fn apply(&self, obj: Value) -> anyhow::Result<Value> {
        (self.func)(obj)
    }
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transform").field("id", &self.id).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformerState {
    Created,
    Hydrating,
    LiveWatching,
    Resyncing,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// One committed change, as seen on the internal feed and replay ring.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub rv: u64,
    pub object: Arc<Value>,
}

impl ChangeEvent {
    fn to_event(&self) -> Event {
        let obj = (*self.object).clone();
        match self.kind {
            ChangeKind::Added => Event::Added(obj),
            ChangeKind::Modified => Event::Modified(obj),
            ChangeKind::Deleted => Event::Deleted(obj),
        }
    }
}

/// Filter parameters of one downstream watch.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Deliver events with a version strictly greater than this; empty or
    /// absent means "from now".
    pub resource_version: Option<String>,
    pub namespace: Option<String>,
    /// `name` or `namespace/name` of a single object.
    pub id: Option<String>,
    pub selector: Option<String>,
}

pub struct InformerConfig {
    pub gvk: Gvk,
    pub namespaced: bool,
    pub watchable: bool,
    pub transform: Option<Transform>,
    /// This kind is a dependency target: refresh the affected kind's derived
    /// columns on every event.
    pub external_updates: Option<ExternalGvkUpdates>,
    /// Derived columns on this kind's own rows, filled at ingest.
    pub self_updates: Option<ExternalGvkUpdates>,
}

enum WatchOutcome {
    Cancelled,
    Expired,
    Ended,
    Failed,
}

pub struct Informer {
    config: InformerConfig,
    store: Arc<IndexedStore>,
    client: Arc<dyn ResourceClient>,
    registry: Weak<Registry>,
    feed: broadcast::Sender<ChangeEvent>,
    replay: Mutex<VecDeque<ChangeEvent>>,
    replay_cap: usize,
    /// Highest rv evicted from the replay ring; start versions below this
    /// can no longer be replayed completely.
    evicted_rv: AtomicU64,
    latest_rv: Mutex<String>,
    latest_rv_num: AtomicU64,
    state_tx: watch::Sender<InformerState>,
    cancel: CancellationToken,
}

impl Informer {
    pub(crate) fn new(
        config: InformerConfig,
        store: Arc<IndexedStore>,
        client: Arc<dyn ResourceClient>,
        registry: Weak<Registry>,
    ) -> Arc<Self> {
        let cap = watch_buffer();
        let (feed, _) = broadcast::channel(cap.max(16));
        let (state_tx, _) = watch::channel(InformerState::Created);
        Arc::new(Self {
            config,
            store,
            client,
            registry,
            feed,
            replay: Mutex::new(VecDeque::with_capacity(cap.min(256))),
            replay_cap: cap,
            evicted_rv: AtomicU64::new(0),
            latest_rv: Mutex::new(String::new()),
            latest_rv_num: AtomicU64::new(0),
            state_tx,
            cancel: CancellationToken::new(),
        })
    }

    pub fn gvk(&self) -> &Gvk {
        &self.config.gvk
    }

    pub fn store(&self) -> Arc<IndexedStore> {
        self.store.clone()
    }

    pub fn state(&self) -> watch::Receiver<InformerState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn latest_resource_version(&self) -> String {
        self.latest_rv.lock().unwrap().clone()
    }

    fn set_state(&self, state: InformerState) {
        // send_replace: transitions must land even with no subscribers yet
        self.state_tx.send_replace(state);
    }

    fn update_latest(&self, rv: &str) {
        let parsed = parse_rv(rv);
        if parsed == 0 {
            return;
        }
        let current = self.latest_rv_num.load(Ordering::Acquire);
        if parsed >= current {
            self.latest_rv_num.store(parsed, Ordering::Release);
            *self.latest_rv.lock().unwrap() = rv.to_string();
        }
    }

    /// Hydration and replication loop. Runs until the owning factory cancels;
    /// the `ready` signal fires after the first hydration (or its failure).
    pub(crate) async fn run(self: Arc<Self>, ready: oneshot::Sender<Result<(), CacheError>>) {
        let mut ready = Some(ready);
        let mut backoff = 1u64;
        let backoff_max = backoff_max_secs();
        let gvk = self.config.gvk.to_string();

        'outer: loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(InformerState::Hydrating);
            match self.hydrate().await {
                Ok(()) => {
                    backoff = 1;
                    // construction finishes once the first watch is open; the
                    // non-watchable path is ready right after hydration
                    if !self.config.watchable {
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                }
                Err(err) => {
                    if let Some(tx) = ready.take() {
                        // initial hydration failure is a construction failure
                        let _ = tx.send(Err(err));
                        break;
                    }
                    warn!(gvk = %gvk, error = %err, "hydration failed; backing off");
                    counter!("cache_hydrate_errors_total", 1u64);
                    if !self.sleep_or_cancel(Duration::from_secs(backoff.min(backoff_max))).await {
                        break;
                    }
                    backoff = (backoff * 2).min(backoff_max).max(1);
                    continue;
                }
            }
            self.set_state(InformerState::LiveWatching);

            if !self.config.watchable {
                // no upstream watch support: serve the snapshot, relist on a
                // jittered interval
                if !self.sleep_or_cancel(Duration::from_secs(jittered(relist_secs()))).await {
                    break;
                }
                self.set_state(InformerState::Resyncing);
                counter!("cache_relist_total", 1u64);
                continue;
            }

            loop {
                let outcome = self.watch_upstream(&mut ready).await;
                if let Some(tx) = ready.take() {
                    // the cache serves its hydrated snapshot even when the
                    // first watch cannot be opened; the loop keeps retrying
                    let _ = tx.send(Ok(()));
                }
                match outcome {
                    WatchOutcome::Cancelled => break 'outer,
                    WatchOutcome::Expired => {
                        info!(gvk = %gvk, "watch expired upstream; resyncing");
                        counter!("cache_watch_expired_total", 1u64);
                        self.set_state(InformerState::Resyncing);
                        continue 'outer;
                    }
                    WatchOutcome::Ended => {
                        // connection hit its time bound; refresh from the
                        // latest observed version without dropping events
                        debug!(gvk = %gvk, "watch connection refreshed");
                        counter!("cache_watch_refresh_total", 1u64);
                        backoff = 1;
                    }
                    WatchOutcome::Failed => {
                        let dur = Duration::from_secs(backoff.min(backoff_max));
                        histogram!("cache_watch_backoff_ms", dur.as_secs_f64() * 1000.0);
                        if !self.sleep_or_cancel(dur).await {
                            break 'outer;
                        }
                        backoff = (backoff * 2).min(backoff_max).max(1);
                    }
                }
            }
        }
        self.set_state(InformerState::Terminated);
        info!(gvk = %gvk, "informer stopped");
    }

    async fn hydrate(&self) -> Result<(), CacheError> {
        let started = Instant::now();
        self.store.clear()?;
        let limit = page_limit();
        let mut token: Option<String> = None;
        loop {
            let params = PageParams {
                limit: (limit > 0).then_some(limit),
                continue_token: token.clone(),
            };
            let page = tokio::select! {
                _ = self.cancel.cancelled() => return Err(CacheError::Cancelled),
                page = self.client.list(None, &params) => page?,
            };
            counter!("cache_hydrate_pages_total", 1u64);
            for obj in page.items {
                self.ingest(ChangeKind::Added, obj, false)?;
            }
            self.update_latest(&page.resource_version);
            token = page.continue_token;
            if token.is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        histogram!("cache_hydrate_ms", started.elapsed().as_secs_f64() * 1000.0);
        gauge!("cache_rows", self.store.len()? as f64);
        Ok(())
    }

    async fn watch_upstream(
        &self,
        ready: &mut Option<oneshot::Sender<Result<(), CacheError>>>,
    ) -> WatchOutcome {
        let rv = self.latest_resource_version();
        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return WatchOutcome::Cancelled,
            stream = self.client.watch(None, &rv, Some(watch_timeout_secs())) => stream,
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(err) if err.is_gone() => return WatchOutcome::Expired,
            Err(err) => {
                warn!(gvk = %self.config.gvk, error = %err, "watch open failed");
                counter!("cache_watch_errors_total", 1u64);
                return WatchOutcome::Failed;
            }
        };
        if let Some(tx) = ready.take() {
            let _ = tx.send(Ok(()));
        }
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return WatchOutcome::Cancelled,
                item = stream.next() => match item {
                    None => return WatchOutcome::Ended,
                    Some(Ok(event)) => {
                        if let Err(err) = self.apply_upstream(event) {
                            warn!(gvk = %self.config.gvk, error = %err, "dropping unprocessable event");
                        }
                    }
                    Some(Err(err)) if err.is_gone() => return WatchOutcome::Expired,
                    Some(Err(err)) => {
                        warn!(gvk = %self.config.gvk, error = %err, "watch stream error");
                        counter!("cache_watch_errors_total", 1u64);
                        return WatchOutcome::Failed;
                    }
                },
            }
        }
    }

    fn apply_upstream(&self, event: UpstreamEvent) -> Result<(), CacheError> {
        match event {
            UpstreamEvent::Added(obj) => self.ingest(ChangeKind::Added, obj, true),
            UpstreamEvent::Modified(obj) => self.ingest(ChangeKind::Modified, obj, true),
            UpstreamEvent::Deleted(obj) => self.ingest(ChangeKind::Deleted, obj, true),
            UpstreamEvent::Bookmark { resource_version } => {
                self.update_latest(&resource_version);
                counter!("cache_watch_bookmarks_total", 1u64);
                Ok(())
            }
        }
    }

    /// Commit one change: transform, derived columns, row write, dependency
    /// dispatch, then (optionally) publication to subscribers, in that order
    /// so queries and watchers never observe a row ahead of its dependents.
    fn ingest(&self, kind: ChangeKind, obj: Value, publish: bool) -> Result<(), CacheError> {
        let obj = match (&self.config.transform, kind) {
            (Some(transform), ChangeKind::Added | ChangeKind::Modified) => transform
                .apply(obj)
                .map_err(|e| CacheError::Internal(format!("transform: {e}")))?,
            _ => obj,
        };
        let rv_str = obj
            .pointer("/metadata/resourceVersion")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        match kind {
            ChangeKind::Added | ChangeKind::Modified => {
                let derived = self.compute_derived(&obj);
                self.store.upsert(&obj, &derived)?;
            }
            ChangeKind::Deleted => {
                self.store.delete(&object_id(&obj))?;
            }
        }
        self.update_latest(&rv_str);
        self.dispatch_external(kind, &obj);

        if publish {
            let event = ChangeEvent { kind, rv: parse_rv(&rv_str), object: Arc::new(obj) };
            let mut replay = self.replay.lock().unwrap();
            replay.push_back(event.clone());
            while replay.len() > self.replay_cap {
                if let Some(evicted) = replay.pop_front() {
                    self.evicted_rv.store(evicted.rv, Ordering::Release);
                }
            }
            drop(replay);
            let _ = self.feed.send(event);
            counter!("cache_events_total", 1u64);
        }
        Ok(())
    }

    /// Derived column values for one of our own rows, looked up from the
    /// dependency target's store. Missing targets leave the column alone;
    /// a later target event refreshes it.
    fn compute_derived(&self, obj: &Value) -> Vec<(String, Option<String>)> {
        let Some(updates) = &self.config.self_updates else {
            return Vec::new();
        };
        let Some(registry) = self.registry.upgrade() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for dep in &updates.label_dependencies {
            let label_path =
                vec!["metadata".to_string(), "labels".to_string(), dep.source_label.clone()];
            let Some(label_value) = extract_field(obj, &label_path) else {
                continue;
            };
            let Some(target) = registry.store_for(&dep.target_gvk) else {
                continue;
            };
            let final_path = parse_field_path(&dep.target_final_field);
            let value = target
                .get_by_field(&dep.target_key_field, &label_value)
                .ok()
                .flatten()
                .and_then(|target_obj| extract_field(&target_obj, &final_path));
            if let Some(value) = value {
                out.push((field_path_label(&final_path), Some(value)));
            }
        }
        out
    }

    /// This kind changed and other kinds derive columns from it: push the new
    /// value into every affected row before the event becomes visible.
    fn dispatch_external(&self, kind: ChangeKind, obj: &Value) {
        let Some(updates) = &self.config.external_updates else {
            return;
        };
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let Some(affected) = registry.store_for(&updates.affected_gvk) else {
            return;
        };
        for dep in &updates.label_dependencies {
            let Some(key) = extract_field(obj, &parse_field_path(&dep.target_key_field)) else {
                continue;
            };
            let final_path = parse_field_path(&dep.target_final_field);
            let value = match kind {
                ChangeKind::Deleted => None,
                _ => extract_field(obj, &final_path),
            };
            let set_label = field_path_label(&final_path);
            let match_label = field_path_label(&[
                "metadata".to_string(),
                "labels".to_string(),
                dep.source_label.clone(),
            ]);
            if let Err(err) = affected.update_derived(&set_label, value.as_deref(), &match_label, &key) {
                warn!(gvk = %self.config.gvk, error = %err, "dependent column refresh failed");
            }
        }
    }

    /// Stream events matching `opts` into `out`: first the buffered events
    /// newer than the requested version, then the live feed, until the caller
    /// cancels or drops the receiver.
    pub async fn watch(
        &self,
        cancel: &CancellationToken,
        opts: &WatchOptions,
        out: mpsc::Sender<Event>,
    ) -> Result<(), CacheError> {
        let selector: Option<Selector> = match opts.selector.as_deref() {
            Some(expr) if !expr.is_empty() => Some(
                expr.parse()
                    .map_err(|e| CacheError::Internal(format!("invalid selector: {e}")))?,
            ),
            _ => None,
        };
        let start_rv = match opts.resource_version.as_deref() {
            Some(rv) if !rv.is_empty() => parse_rv(rv),
            _ => self.latest_rv_num.load(Ordering::Acquire),
        };

        // subscribe before reading the ring so nothing falls in the gap;
        // eviction happens under the same lock, so the high-water mark read
        // here is consistent with the snapshot
        let mut rx = self.feed.subscribe();
        let (replayed, evicted_rv) = {
            let replay = self.replay.lock().unwrap();
            let replayed: Vec<ChangeEvent> = replay.iter().filter(|e| e.rv > start_rv).cloned().collect();
            (replayed, self.evicted_rv.load(Ordering::Acquire))
        };
        if start_rv < evicted_rv {
            // events in (start_rv, evicted_rv] are gone; a partial replay
            // would silently break continuity, so report the version as
            // expired and let the caller re-list
            let _ = out
                .send(Event::Error(ErrorStatus {
                    message: format!("resource version {start_rv} is too old to watch from"),
                    code: Some(410),
                }))
                .await;
            return Ok(());
        }
        let mut last = start_rv;
        for event in replayed {
            last = last.max(event.rv);
            if event_matches(&event, opts, selector.as_ref()) && out.send(event.to_event()).await.is_err() {
                return Ok(());
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.cancel.cancelled() => return Ok(()),
                _ = out.closed() => return Ok(()),
                received = rx.recv() => match received {
                    Ok(event) => {
                        if event.rv <= last {
                            continue;
                        }
                        last = event.rv;
                        if event_matches(&event, opts, selector.as_ref())
                            && out.send(event.to_event()).await.is_err()
                        {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(gvk = %self.config.gvk, skipped, "watch subscriber lagged");
                        let _ = out
                            .send(Event::Error(ErrorStatus {
                                message: format!("watch lagged behind by {skipped} events"),
                                code: Some(410),
                            }))
                            .await;
                        return Ok(());
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    async fn sleep_or_cancel(&self, dur: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(dur) => true,
        }
    }
}

fn event_matches(event: &ChangeEvent, opts: &WatchOptions, selector: Option<&Selector>) -> bool {
    let obj = &*event.object;
    if let Some(ns) = opts.namespace.as_deref().filter(|ns| !ns.is_empty()) {
        if obj.pointer("/metadata/namespace").and_then(|v| v.as_str()) != Some(ns) {
            return false;
        }
    }
    if let Some(id) = opts.id.as_deref().filter(|id| !id.is_empty()) {
        let name = obj.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or_default();
        if object_id(obj) != id && name != id {
            return false;
        }
    }
    if let Some(selector) = selector {
        let labels: BTreeMap<String, String> = obj
            .pointer("/metadata/labels")
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        if !selector.matches(&labels) {
            return false;
        }
    }
    true
}

/// +-10% jitter from the clock, no randomness dependency needed.
fn jittered(secs: u64) -> u64 {
    let jitter = ((secs as f64) * 0.1) as i64;
    if jitter <= 0 {
        return secs.max(1);
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as i64;
    let sign = if (now & 1) == 0 { 1 } else { -1 };
    ((secs as i64) + (now % (jitter + 1)) * sign).max(1) as u64
}
