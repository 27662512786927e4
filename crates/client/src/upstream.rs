//! The upstream resource seam: everything the cache and proxy layers need
//! from a Kubernetes-style API, expressed over plain JSON values so fakes
//! slot in behind the same trait.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("upstream returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("configuration: {0}")]
    Config(String),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// HTTP 410: the requested resource version has expired upstream.
    pub fn is_gone(&self) -> bool {
        self.status() == Some(410)
    }

    pub fn is_too_many_requests(&self) -> bool {
        self.status() == Some(429)
    }
}

impl From<kube::Error> for ClientError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => ClientError::Api { status: resp.code, message: resp.message },
            other => ClientError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetParams {
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PageParams {
    pub limit: Option<u32>,
    pub continue_token: Option<String>,
}

/// One page of an upstream list.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub items: Vec<Value>,
    pub resource_version: String,
    pub continue_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteParams {
    pub dry_run: bool,
    pub field_manager: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteParams {
    pub dry_run: bool,
    pub grace_period_seconds: Option<u32>,
}

/// Patch payload, discriminated the way the upstream API expects it.
#[derive(Debug, Clone)]
pub enum PatchBody {
    Strategic(Value),
    Merge(Value),
    Json(Value),
}

/// Raw upstream watch event, before any cache-side translation.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    Bookmark { resource_version: String },
}

pub type EventStream = BoxStream<'static, Result<UpstreamEvent, ClientError>>;

/// Operations on one resource kind of one upstream cluster.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, namespace: Option<&str>, name: &str, params: &GetParams) -> Result<Value, ClientError>;

    async fn list(&self, namespace: Option<&str>, params: &PageParams) -> Result<ObjectPage, ClientError>;

    /// Open a watch starting after `resource_version`. `timeout_secs` bounds
    /// the connection; the server closes the stream when it elapses.
    async fn watch(
        &self,
        namespace: Option<&str>,
        resource_version: &str,
        timeout_secs: Option<u32>,
    ) -> Result<EventStream, ClientError>;

    async fn create(&self, namespace: Option<&str>, obj: Value, params: &WriteParams) -> Result<Value, ClientError>;

    async fn update(&self, namespace: Option<&str>, obj: Value, params: &WriteParams) -> Result<Value, ClientError>;

    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        body: PatchBody,
        params: &WriteParams,
    ) -> Result<Value, ClientError>;

    async fn delete(&self, namespace: Option<&str>, name: &str, params: &DeleteParams) -> Result<(), ClientError>;
}

#[async_trait]
impl<C: ResourceClient + ?Sized> ResourceClient for Arc<C> {
    async fn get(&self, namespace: Option<&str>, name: &str, params: &GetParams) -> Result<Value, ClientError> {
        (**self).get(namespace, name, params).await
    }

    async fn list(&self, namespace: Option<&str>, params: &PageParams) -> Result<ObjectPage, ClientError> {
        (**self).list(namespace, params).await
    }

    async fn watch(
        &self,
        namespace: Option<&str>,
        resource_version: &str,
        timeout_secs: Option<u32>,
    ) -> Result<EventStream, ClientError> {
        (**self).watch(namespace, resource_version, timeout_secs).await
    }

    async fn create(&self, namespace: Option<&str>, obj: Value, params: &WriteParams) -> Result<Value, ClientError> {
        (**self).create(namespace, obj, params).await
    }

    async fn update(&self, namespace: Option<&str>, obj: Value, params: &WriteParams) -> Result<Value, ClientError> {
        (**self).update(namespace, obj, params).await
    }

    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        body: PatchBody,
        params: &WriteParams,
    ) -> Result<Value, ClientError> {
        (**self).patch(namespace, name, body, params).await
    }

    async fn delete(&self, namespace: Option<&str>, name: &str, params: &DeleteParams) -> Result<(), ClientError> {
        (**self).delete(namespace, name, params).await
    }
}
