//! Vantage client factory: hands out upstream clients under a shared or
//! per-client request rate budget.
//!
//! Many request handlers each holding a limiter of `qps` aggregate to
//! `N * qps` against one upstream; shared mode keeps the whole fleet under a
//! single budget. Per-client mode is retained for isolation testing.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use metrics::{counter, histogram};
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use vantage_core::{Gvk, WarningBuffer};

pub mod kube_client;
pub mod upstream;

pub use upstream::{
    ClientError, DeleteParams, EventStream, GetParams, ObjectPage, PageParams, PatchBody, ResourceClient,
    UpstreamEvent, WriteParams,
};

pub type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const DEFAULT_QPS: f32 = 10_000.0;
const DEFAULT_BURST: u32 = 100;

/// Rate budget configuration for produced clients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientFactoryConfig {
    /// Sustained requests per second.
    pub qps: f32,
    /// Token bucket depth.
    pub burst: u32,
    /// One limiter across every produced client instead of one each.
    pub shared_qps: bool,
}

impl Default for ClientFactoryConfig {
    fn default() -> Self {
        Self { qps: DEFAULT_QPS, burst: DEFAULT_BURST, shared_qps: false }
    }
}

impl ClientFactoryConfig {
    pub fn with_qps_and_burst(qps: f32, burst: u32, shared: bool) -> Self {
        Self { qps, burst, shared_qps: shared }
    }
}

fn build_limiter(qps: f32, burst: u32) -> Result<DirectRateLimiter, ClientError> {
    if !(qps > 0.0) {
        return Err(ClientError::Config(format!("qps must be positive, got {qps}")));
    }
    let burst = NonZeroU32::new(burst).ok_or_else(|| ClientError::Config("burst must be positive".to_string()))?;
    let period = Duration::from_secs_f64(1.0 / f64::from(qps));
    let quota = Quota::with_period(period)
        .ok_or_else(|| ClientError::Config(format!("qps {qps} yields an empty refill period")))?
        .allow_burst(burst);
    Ok(RateLimiter::direct(quota))
}

/// Provider of rate limiters under one configuration: either the single
/// shared instance, or a fresh one per caller.
pub struct RateLimitPool {
    config: ClientFactoryConfig,
    shared: Arc<DirectRateLimiter>,
}

impl RateLimitPool {
    pub fn new(config: ClientFactoryConfig) -> Result<Self, ClientError> {
        let shared = Arc::new(build_limiter(config.qps, config.burst)?);
        Ok(Self { config, shared })
    }

    pub fn limiter(&self) -> Result<Arc<DirectRateLimiter>, ClientError> {
        if self.config.shared_qps {
            Ok(self.shared.clone())
        } else {
            Ok(Arc::new(build_limiter(self.config.qps, self.config.burst)?))
        }
    }
}

/// Decorates any [`ResourceClient`] with token-bucket admission: every call
/// suspends until the limiter releases a token.
pub struct RateLimited<C> {
    inner: C,
    limiter: Arc<DirectRateLimiter>,
}

impl<C> RateLimited<C> {
    pub fn new(inner: C, limiter: Arc<DirectRateLimiter>) -> Self {
        Self { inner, limiter }
    }

    async fn admit(&self) {
        let started = Instant::now();
        self.limiter.until_ready().await;
        histogram!("client_ratelimit_wait_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("client_requests_total", 1u64);
    }
}

#[async_trait]
impl<C: ResourceClient> ResourceClient for RateLimited<C> {
    async fn get(&self, namespace: Option<&str>, name: &str, params: &GetParams) -> Result<Value, ClientError> {
        self.admit().await;
        self.inner.get(namespace, name, params).await
    }

    async fn list(&self, namespace: Option<&str>, params: &PageParams) -> Result<ObjectPage, ClientError> {
        self.admit().await;
        self.inner.list(namespace, params).await
    }

    async fn watch(
        &self,
        namespace: Option<&str>,
        resource_version: &str,
        timeout_secs: Option<u32>,
    ) -> Result<EventStream, ClientError> {
        self.admit().await;
        self.inner.watch(namespace, resource_version, timeout_secs).await
    }

    async fn create(&self, namespace: Option<&str>, obj: Value, params: &WriteParams) -> Result<Value, ClientError> {
        self.admit().await;
        self.inner.create(namespace, obj, params).await
    }

    async fn update(&self, namespace: Option<&str>, obj: Value, params: &WriteParams) -> Result<Value, ClientError> {
        self.admit().await;
        self.inner.update(namespace, obj, params).await
    }

    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        body: PatchBody,
        params: &WriteParams,
    ) -> Result<Value, ClientError> {
        self.admit().await;
        self.inner.patch(namespace, name, body, params).await
    }

    async fn delete(&self, namespace: Option<&str>, name: &str, params: &DeleteParams) -> Result<(), ClientError> {
        self.admit().await;
        self.inner.delete(namespace, name, params).await
    }
}

/// Produces upstream clients honoring the configured rate budget.
pub struct ClientFactory {
    client: kube::Client,
    pool: RateLimitPool,
}

impl ClientFactory {
    pub fn new(client: kube::Client, config: ClientFactoryConfig) -> Result<Self, ClientError> {
        debug!(qps = config.qps, burst = config.burst, shared = config.shared_qps, "client factory ready");
        Ok(Self { client, pool: RateLimitPool::new(config)? })
    }

    /// A dynamic client handle. With `shared_qps` every handle rides the same
    /// limiter; otherwise the handle gets its own bucket.
    pub fn dynamic_client(&self, warnings: WarningBuffer) -> Result<DynamicClient, ClientError> {
        Ok(DynamicClient {
            client: self.client.clone(),
            limiter: self.pool.limiter()?,
            warnings,
        })
    }
}

/// Per-request handle producing rate-limited resource clients. The warning
/// buffer travels with the handle so upstream advisories land in the
/// originating request.
pub struct DynamicClient {
    client: kube::Client,
    limiter: Arc<DirectRateLimiter>,
    warnings: WarningBuffer,
}

impl DynamicClient {
    pub fn resource(&self, gvk: &Gvk, namespaced: bool) -> RateLimited<kube_client::KubeResourceClient> {
        RateLimited::new(
            kube_client::KubeResourceClient::new(self.client.clone(), gvk, namespaced),
            self.limiter.clone(),
        )
    }

    pub fn warnings(&self) -> &WarningBuffer {
        &self.warnings
    }
}
