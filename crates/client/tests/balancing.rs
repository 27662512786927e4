//! Rate budget behavior of produced clients against a capped upstream:
//! per-client limiters overrun a shared server cap, a shared limiter under
//! the cap never trips it, and a shared limiter above the cap does.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use vantage_client::{
    ClientError, ClientFactoryConfig, DeleteParams, EventStream, GetParams, ObjectPage, PageParams, PatchBody,
    RateLimitPool, RateLimited, ResourceClient, WriteParams,
};

/// Fake upstream API capped at a fixed request rate; over-budget requests are
/// answered with 429 and counted.
struct CappedUpstream {
    limiter: vantage_client::DirectRateLimiter,
    rejected: AtomicU32,
}

impl CappedUpstream {
    fn new(cap_per_second: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(cap_per_second).unwrap())
            .allow_burst(NonZeroU32::new(1).unwrap());
        Self { limiter: RateLimiter::direct(quota), rejected: AtomicU32::new(0) }
    }

    fn admit(&self) -> Result<(), ClientError> {
        if self.limiter.check().is_err() {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(ClientError::Api { status: 429, message: "too many requests".into() });
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceClient for CappedUpstream {
    async fn get(&self, _namespace: Option<&str>, name: &str, _params: &GetParams) -> Result<Value, ClientError> {
        self.admit()?;
        Ok(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": name, "resourceVersion": "3319"},
            "status": {"phase": "Active"},
        }))
    }

    async fn list(&self, _namespace: Option<&str>, _params: &PageParams) -> Result<ObjectPage, ClientError> {
        self.admit()?;
        Ok(ObjectPage::default())
    }

    async fn watch(
        &self,
        _namespace: Option<&str>,
        _resource_version: &str,
        _timeout_secs: Option<u32>,
    ) -> Result<EventStream, ClientError> {
        Err(ClientError::Transport("watch unsupported".into()))
    }

    async fn create(&self, _namespace: Option<&str>, obj: Value, _params: &WriteParams) -> Result<Value, ClientError> {
        self.admit()?;
        Ok(obj)
    }

    async fn update(&self, _namespace: Option<&str>, obj: Value, _params: &WriteParams) -> Result<Value, ClientError> {
        self.admit()?;
        Ok(obj)
    }

    async fn patch(
        &self,
        _namespace: Option<&str>,
        _name: &str,
        _body: PatchBody,
        _params: &WriteParams,
    ) -> Result<Value, ClientError> {
        self.admit()?;
        Ok(Value::Null)
    }

    async fn delete(&self, _namespace: Option<&str>, _name: &str, _params: &DeleteParams) -> Result<(), ClientError> {
        self.admit()?;
        Ok(())
    }
}

const WORKERS: usize = 5;
const REQUESTS_PER_WORKER: usize = 20;

/// Run the worker fleet against a 10 req/s upstream and report how many
/// requests the upstream rejected.
async fn run_fleet(config: ClientFactoryConfig) -> u32 {
    let upstream = Arc::new(CappedUpstream::new(10));
    let pool = RateLimitPool::new(config).unwrap();

    let mut tasks = Vec::with_capacity(WORKERS);
    for _ in 0..WORKERS {
        let client = RateLimited::new(upstream.clone(), pool.limiter().unwrap());
        tasks.push(tokio::spawn(async move {
            for _ in 0..REQUESTS_PER_WORKER {
                let _ = client.get(None, "testing", &GetParams::default()).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    upstream.rejected.load(Ordering::SeqCst)
}

#[tokio::test(flavor = "multi_thread")]
async fn per_client_limiters_overrun_the_upstream_cap() {
    let rejected = run_fleet(ClientFactoryConfig::with_qps_and_burst(9.0, 1, false)).await;
    assert!(rejected > 0, "five 9 qps clients aggregate to ~45 req/s and must trip a 10 req/s cap");
}

#[tokio::test(flavor = "multi_thread")]
async fn shared_limiter_under_the_cap_stays_clean() {
    let rejected = run_fleet(ClientFactoryConfig::with_qps_and_burst(9.0, 1, true)).await;
    assert_eq!(rejected, 0, "one shared 9 qps budget stays under a 10 req/s cap");
}

#[tokio::test(flavor = "multi_thread")]
async fn shared_limiter_above_the_cap_trips_it() {
    let rejected = run_fleet(ClientFactoryConfig::with_qps_and_burst(11.0, 1, true)).await;
    assert!(rejected > 0, "a shared 11 qps budget must trip a 10 req/s cap");
}
