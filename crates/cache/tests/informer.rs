//! Informer lifecycle against a scripted upstream: hydration, watch
//! replication, replay continuity, dedup, dependency propagation and reset.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vantage_cache::{CacheFactory, InformerState, WatchOptions};
use vantage_client::{
    ClientError, DeleteParams, EventStream, GetParams, ObjectPage, PageParams, PatchBody, ResourceClient,
    UpstreamEvent, WriteParams,
};
use vantage_core::fields::{indexed_fields_for, EXTERNAL_GVK_DEPENDENCIES, SELF_GVK_DEPENDENCIES};
use vantage_core::{Event, Filter, Gvk, ListOptions, OrFilter, Partition};

type WatchSender = futures::channel::mpsc::UnboundedSender<Result<UpstreamEvent, ClientError>>;

/// Upstream double: list calls consume scripted pages (the last page is
/// sticky so re-hydrations keep working), watch calls hand back a channel the
/// test feeds.
struct FakeClient {
    pages: Mutex<VecDeque<ObjectPage>>,
    watchers: Mutex<Vec<WatchSender>>,
    list_calls: AtomicUsize,
    watch_calls: AtomicUsize,
}

impl FakeClient {
    fn new(pages: Vec<ObjectPage>) -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(pages.into()),
            watchers: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
            watch_calls: AtomicUsize::new(0),
        })
    }

    fn push_page(&self, page: ObjectPage) {
        self.pages.lock().unwrap().push_back(page);
    }

    fn emit(&self, event: UpstreamEvent) {
        let watchers = self.watchers.lock().unwrap();
        for tx in watchers.iter() {
            let _ = tx.unbounded_send(Ok(event.clone()));
        }
    }

    fn fail_watches(&self, status: u16) {
        let mut watchers = self.watchers.lock().unwrap();
        for tx in watchers.drain(..) {
            let _ = tx.unbounded_send(Err(ClientError::Api {
                status,
                message: "too old resource version".into(),
            }));
        }
    }
}

#[async_trait]
impl ResourceClient for FakeClient {
    async fn get(&self, _ns: Option<&str>, _name: &str, _params: &GetParams) -> Result<Value, ClientError> {
        Err(ClientError::Transport("get unsupported".into()))
    }

    async fn list(&self, _ns: Option<&str>, _params: &PageParams) -> Result<ObjectPage, ClientError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut pages = self.pages.lock().unwrap();
        match pages.len() {
            0 => Ok(ObjectPage::default()),
            1 => Ok(pages.front().unwrap().clone()),
            _ => Ok(pages.pop_front().unwrap()),
        }
    }

    async fn watch(
        &self,
        _ns: Option<&str>,
        _resource_version: &str,
        _timeout_secs: Option<u32>,
    ) -> Result<EventStream, ClientError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = futures::channel::mpsc::unbounded();
        self.watchers.lock().unwrap().push(tx);
        Ok(rx.boxed())
    }

    async fn create(&self, _ns: Option<&str>, obj: Value, _params: &WriteParams) -> Result<Value, ClientError> {
        Ok(obj)
    }

    async fn update(&self, _ns: Option<&str>, obj: Value, _params: &WriteParams) -> Result<Value, ClientError> {
        Ok(obj)
    }

    async fn patch(
        &self,
        _ns: Option<&str>,
        _name: &str,
        _body: PatchBody,
        _params: &WriteParams,
    ) -> Result<Value, ClientError> {
        Err(ClientError::Transport("patch unsupported".into()))
    }

    async fn delete(&self, _ns: Option<&str>, _name: &str, _params: &DeleteParams) -> Result<(), ClientError> {
        Ok(())
    }
}

fn pod(ns: &str, name: &str, node: &str, rv: u64) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": name, "namespace": ns, "resourceVersion": rv.to_string()},
        "spec": {"nodeName": node},
    })
}

fn page(items: Vec<Value>, rv: &str, continue_token: Option<&str>) -> ObjectPage {
    ObjectPage {
        items,
        resource_version: rv.to_string(),
        continue_token: continue_token.map(|s| s.to_string()),
    }
}

fn temp_factory() -> CacheFactory {
    let dir = std::env::temp_dir().join(format!(
        "vantage-informer-test-{}",
        std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
    ));
    CacheFactory::with_base_dir(dir).unwrap()
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn pod_gvk() -> Gvk {
    Gvk::new("", "v1", "Pod")
}

async fn pod_cache(factory: &CacheFactory, client: Arc<FakeClient>) -> vantage_cache::Cache {
    factory
        .cache_for(
            &indexed_fields_for(&pod_gvk()),
            None,
            None,
            None,
            client,
            pod_gvk(),
            true,
            true,
        )
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn hydration_walks_every_page() {
    let client = FakeClient::new(vec![
        page(vec![pod("ns1", "a", "n1", 1), pod("ns1", "b", "n1", 2)], "5", Some("next")),
        page(vec![pod("ns2", "c", "n2", 3)], "10", None),
    ]);
    let factory = temp_factory();
    let cache = pod_cache(&factory, client.clone()).await;

    let out = cache
        .list_by_options(&CancellationToken::new(), &ListOptions::default(), &[Partition::all()], None)
        .unwrap();
    assert_eq!(out.total, 3);
    assert_eq!(out.revision, "10");
    assert!(client.list_calls.load(Ordering::SeqCst) >= 2);
    factory.reset().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_events_update_rows_and_fan_out() {
    let client = FakeClient::new(vec![page(vec![pod("ns1", "a", "n1", 1)], "5", None)]);
    let factory = temp_factory();
    let cache = pod_cache(&factory, client.clone()).await;

    let store = cache.informer().store();
    client.emit(UpstreamEvent::Added(pod("ns1", "b", "n2", 6)));
    wait_until(|| store.len().unwrap() == 2).await;

    client.emit(UpstreamEvent::Modified(pod("ns1", "b", "n3", 7)));
    wait_until(|| {
        store
            .get_by_field("metadata.name", "b")
            .unwrap()
            .and_then(|o| o.pointer("/spec/nodeName").and_then(|v| v.as_str()).map(String::from))
            == Some("n3".to_string())
    })
    .await;

    client.emit(UpstreamEvent::Deleted(pod("ns1", "a", "n1", 8)));
    wait_until(|| store.len().unwrap() == 1).await;

    client.emit(UpstreamEvent::Bookmark { resource_version: "20".to_string() });
    wait_until(|| cache.latest_resource_version() == "20").await;
    factory.reset().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_replays_events_newer_than_the_requested_version() {
    let client = FakeClient::new(vec![page(vec![pod("ns1", "a", "n1", 1)], "5", None)]);
    let factory = temp_factory();
    let cache = pod_cache(&factory, client.clone()).await;
    let store = cache.informer().store();

    client.emit(UpstreamEvent::Added(pod("ns1", "b", "n1", 6)));
    client.emit(UpstreamEvent::Added(pod("ns1", "c", "n1", 7)));
    wait_until(|| store.len().unwrap() == 3).await;

    // a list observed revision 5; a watch from 5 must see both later events
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let watcher = {
        let cache = cache.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cache
                .watch(
                    &cancel,
                    &WatchOptions { resource_version: Some("5".to_string()), ..Default::default() },
                    tx,
                )
                .await
        })
    };

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.object_name(), Some("b"));
    assert_eq!(second.object_name(), Some("c"));

    // live events continue on the same stream, no duplicates of the replay
    client.emit(UpstreamEvent::Added(pod("ns1", "d", "n1", 8)));
    let third = rx.recv().await.unwrap();
    assert_eq!(third.object_name(), Some("d"));
    assert!(matches!(third, Event::Added(_)));

    cancel.cancel();
    watcher.await.unwrap().unwrap();
    factory.reset().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_from_a_version_older_than_the_replay_ring_errors_out() {
    let client = FakeClient::new(vec![page(vec![pod("ns1", "a", "n1", 1)], "5", None)]);
    let factory = temp_factory();
    let cache = pod_cache(&factory, client.clone()).await;

    // overflow the replay ring (default depth 1024) so the earliest events
    // after revision 5 are evicted
    let first_rv = 10u64;
    let last_rv = first_rv + 1100;
    for rv in first_rv..=last_rv {
        client.emit(UpstreamEvent::Modified(pod("ns1", "hot", "n1", rv)));
    }
    wait_until(|| cache.latest_resource_version() == last_rv.to_string()).await;

    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let stale = {
        let cache = cache.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cache
                .watch(
                    &cancel,
                    &WatchOptions { resource_version: Some("5".to_string()), ..Default::default() },
                    tx,
                )
                .await
        })
    };
    match rx.recv().await.unwrap() {
        Event::Error(status) => assert_eq!(status.code, Some(410)),
        other => panic!("expected an error event, got {other:?}"),
    }
    assert!(rx.recv().await.is_none(), "stream must close after the error");
    stale.await.unwrap().unwrap();

    // a start version still covered by the ring replays normally
    let (tx, mut rx) = mpsc::channel(16);
    let recent = {
        let cache = cache.clone();
        let cancel = cancel.clone();
        let from = (last_rv - 1).to_string();
        tokio::spawn(async move {
            cache
                .watch(
                    &cancel,
                    &WatchOptions { resource_version: Some(from), ..Default::default() },
                    tx,
                )
                .await
        })
    };
    let event = rx.recv().await.unwrap();
    assert_eq!(
        event.object().unwrap().pointer("/metadata/resourceVersion").unwrap(),
        &serde_json::Value::String(last_rv.to_string()),
    );
    cancel.cancel();
    recent.await.unwrap().unwrap();
    factory.reset().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_filters_by_namespace_id_and_selector() {
    let client = FakeClient::new(vec![page(vec![], "5", None)]);
    let factory = temp_factory();
    let cache = pod_cache(&factory, client.clone()).await;

    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let opts = WatchOptions {
        resource_version: Some("5".to_string()),
        namespace: Some("ns1".to_string()),
        selector: Some("tier=web".to_string()),
        ..Default::default()
    };
    let watcher = {
        let cache = cache.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { cache.watch(&cancel, &opts, tx).await })
    };

    let labelled = json!({
        "metadata": {
            "name": "web-1", "namespace": "ns1", "resourceVersion": "6",
            "labels": {"tier": "web"},
        }
    });
    let wrong_ns = json!({
        "metadata": {
            "name": "web-2", "namespace": "ns2", "resourceVersion": "7",
            "labels": {"tier": "web"},
        }
    });
    let wrong_label = json!({
        "metadata": {
            "name": "db-1", "namespace": "ns1", "resourceVersion": "8",
            "labels": {"tier": "db"},
        }
    });
    let labelled_again = json!({
        "metadata": {
            "name": "web-3", "namespace": "ns1", "resourceVersion": "9",
            "labels": {"tier": "web"},
        }
    });
    client.emit(UpstreamEvent::Added(labelled));
    client.emit(UpstreamEvent::Added(wrong_ns));
    client.emit(UpstreamEvent::Added(wrong_label));
    client.emit(UpstreamEvent::Added(labelled_again));

    assert_eq!(rx.recv().await.unwrap().object_name(), Some("web-1"));
    assert_eq!(rx.recv().await.unwrap().object_name(), Some("web-3"));

    cancel.cancel();
    watcher.await.unwrap().unwrap();
    factory.reset().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn identical_fingerprints_share_one_informer() {
    let client = FakeClient::new(vec![page(vec![pod("ns1", "a", "n1", 1)], "5", None)]);
    let factory = temp_factory();

    let (a, b) = tokio::join!(pod_cache(&factory, client.clone()), pod_cache(&factory, client.clone()));
    assert_eq!(factory.len(), 1);
    assert!(Arc::ptr_eq(a.informer(), b.informer()));

    // a different transform id is a different fingerprint
    let other = factory
        .cache_for(
            &indexed_fields_for(&pod_gvk()),
            None,
            None,
            Some(vantage_cache::Transform::new("strip", |obj| Ok(obj))),
            client.clone(),
            pod_gvk(),
            true,
            true,
        )
        .await
        .unwrap();
    assert_eq!(factory.len(), 2);
    assert!(!Arc::ptr_eq(a.informer(), other.informer()));
    factory.reset().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_watch_discards_and_rehydrates() {
    let client = FakeClient::new(vec![
        page(vec![pod("ns1", "a", "n1", 1)], "5", None),
        page(vec![pod("ns1", "replacement", "n9", 30)], "30", None),
    ]);
    let factory = temp_factory();
    let cache = pod_cache(&factory, client.clone()).await;
    let store = cache.informer().store();
    assert_eq!(store.len().unwrap(), 1);

    client.fail_watches(410);
    wait_until(|| {
        store
            .get_by_field("metadata.name", "replacement")
            .map(|o| o.is_some())
            .unwrap_or(false)
            && store.len().unwrap() == 1
    })
    .await;
    assert!(client.list_calls.load(Ordering::SeqCst) >= 2);
    assert!(client.watch_calls.load(Ordering::SeqCst) >= 2);
    factory.reset().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_terminates_every_informer() {
    let client = FakeClient::new(vec![page(vec![pod("ns1", "a", "n1", 1)], "5", None)]);
    let factory = temp_factory();
    let cache = pod_cache(&factory, client.clone()).await;
    assert_eq!(factory.len(), 1);

    let mut state = cache.informer().state();
    factory.reset().await.unwrap();
    assert_eq!(factory.len(), 0);
    assert_eq!(*state.borrow_and_update(), InformerState::Terminated);

    // the factory accepts fresh construction afterwards
    client.push_page(page(vec![pod("ns1", "a", "n1", 1)], "6", None));
    let _again = pod_cache(&factory, client.clone()).await;
    assert_eq!(factory.len(), 1);
    factory.reset().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn project_changes_refresh_namespace_derived_columns() {
    let ns_gvk = Gvk::new("", "v1", "Namespace");
    let project_gvk = Gvk::new("management.cattle.io", "v3", "Project");
    let factory = temp_factory();

    let ns_obj = json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": "team-a",
            "resourceVersion": "4",
            "labels": {"field.cattle.io/projectId": "p-abc"},
        },
    });
    let ns_client = FakeClient::new(vec![page(vec![ns_obj], "4", None)]);
    let ns_cache = factory
        .cache_for(
            &indexed_fields_for(&ns_gvk),
            None,
            SELF_GVK_DEPENDENCIES.get(&ns_gvk.key()).cloned(),
            None,
            ns_client.clone(),
            ns_gvk.clone(),
            false,
            true,
        )
        .await
        .unwrap();

    let project = |display: &str, rv: u64| {
        json!({
            "apiVersion": "management.cattle.io/v3",
            "kind": "Project",
            "metadata": {"name": "p-abc", "namespace": "local", "resourceVersion": rv.to_string()},
            "spec": {"clusterName": "local", "displayName": display},
        })
    };
    let project_client = FakeClient::new(vec![page(vec![project("Dev Team", 10)], "10", None)]);
    let _project_cache = factory
        .cache_for(
            &indexed_fields_for(&project_gvk),
            EXTERNAL_GVK_DEPENDENCIES.get(&project_gvk.key()).cloned(),
            None,
            None,
            project_client.clone(),
            project_gvk.clone(),
            true,
            true,
        )
        .await
        .unwrap();

    let display_filter = |value: &str| ListOptions {
        filters: vec![OrFilter { filters: vec![Filter::eq(&["spec", "displayName"], value)] }],
        ..ListOptions::default()
    };
    let count = |opts: &ListOptions| {
        ns_cache
            .list_by_options(&CancellationToken::new(), opts, &[Partition::all()], None)
            .unwrap()
            .total
    };

    // project hydration already flowed into the namespace rows
    wait_until(|| count(&display_filter("Dev Team")) == 1).await;

    project_client.emit(UpstreamEvent::Modified(project("Platform Team", 11)));
    wait_until(|| count(&display_filter("Platform Team")) == 1).await;
    assert_eq!(count(&display_filter("Dev Team")), 0);

    project_client.emit(UpstreamEvent::Deleted(project("Platform Team", 12)));
    wait_until(|| count(&display_filter("Platform Team")) == 0).await;
    factory.reset().await.unwrap();
}
