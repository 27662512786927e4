//! kube-backed implementation of the upstream resource seam.

use crate::upstream::{
    ClientError, DeleteParams, EventStream, GetParams, ObjectPage, PageParams, PatchBody, ResourceClient,
    UpstreamEvent, WriteParams,
};
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, DynamicObject, Patch, PatchParams, PostParams, WatchEvent, WatchParams};
use kube::core::{ApiResource, GroupVersionKind};
use serde_json::Value;
use vantage_core::Gvk;

/// One resource kind bound to a kube client. The `Api` handle is rebuilt per
/// call because the namespace is a per-call argument on this seam.
pub struct KubeResourceClient {
    client: kube::Client,
    resource: ApiResource,
    namespaced: bool,
}

impl KubeResourceClient {
    pub fn new(client: kube::Client, gvk: &Gvk, namespaced: bool) -> Self {
        let gvk = GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        Self { client, resource: ApiResource::from_gvk(&gvk), namespaced }
    }

    pub fn with_resource(client: kube::Client, resource: ApiResource, namespaced: bool) -> Self {
        Self { client, resource, namespaced }
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        if self.namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
                None => Api::all_with(self.client.clone(), &self.resource),
            }
        } else {
            Api::all_with(self.client.clone(), &self.resource)
        }
    }
}

fn to_value(obj: DynamicObject) -> Result<Value, ClientError> {
    serde_json::to_value(obj).map_err(|e| ClientError::Transport(e.to_string()))
}

fn to_dynamic(obj: Value) -> Result<DynamicObject, ClientError> {
    serde_json::from_value(obj).map_err(|e| ClientError::Transport(e.to_string()))
}

fn object_name(obj: &Value) -> Result<String, ClientError> {
    obj.pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ClientError::Config("object has no metadata.name".to_string()))
}

fn post_params(params: &WriteParams) -> PostParams {
    PostParams {
        dry_run: params.dry_run,
        field_manager: params.field_manager.clone(),
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(&self, namespace: Option<&str>, name: &str, params: &GetParams) -> Result<Value, ClientError> {
        let gp = kube::api::GetParams {
            resource_version: params.resource_version.clone(),
        };
        let obj = self.api(namespace).get_with(name, &gp).await?;
        to_value(obj)
    }

    async fn list(&self, namespace: Option<&str>, params: &PageParams) -> Result<ObjectPage, ClientError> {
        let mut lp = kube::api::ListParams::default();
        if let Some(limit) = params.limit {
            lp = lp.limit(limit);
        }
        if let Some(token) = &params.continue_token {
            lp = lp.continue_token(token);
        }
        let list = self.api(namespace).list(&lp).await?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let continue_token = list.metadata.continue_.clone().filter(|t| !t.is_empty());
        let items = list.items.into_iter().map(to_value).collect::<Result<Vec<_>, _>>()?;
        Ok(ObjectPage { items, resource_version, continue_token })
    }

    async fn watch(
        &self,
        namespace: Option<&str>,
        resource_version: &str,
        timeout_secs: Option<u32>,
    ) -> Result<EventStream, ClientError> {
        let mut wp = WatchParams::default();
        if let Some(timeout) = timeout_secs {
            wp = wp.timeout(timeout);
        }
        let stream = self.api(namespace).watch(&wp, resource_version).await?;
        let mapped = stream.map(|item| match item {
            Ok(WatchEvent::Added(o)) => to_value(o).map(UpstreamEvent::Added),
            Ok(WatchEvent::Modified(o)) => to_value(o).map(UpstreamEvent::Modified),
            Ok(WatchEvent::Deleted(o)) => to_value(o).map(UpstreamEvent::Deleted),
            Ok(WatchEvent::Bookmark(b)) => Ok(UpstreamEvent::Bookmark {
                resource_version: b.metadata.resource_version,
            }),
            Ok(WatchEvent::Error(status)) => Err(ClientError::Api {
                status: status.code,
                message: status.message,
            }),
            Err(err) => Err(err.into()),
        });
        Ok(mapped.boxed())
    }

    async fn create(&self, namespace: Option<&str>, obj: Value, params: &WriteParams) -> Result<Value, ClientError> {
        let created = self.api(namespace).create(&post_params(params), &to_dynamic(obj)?).await?;
        to_value(created)
    }

    async fn update(&self, namespace: Option<&str>, obj: Value, params: &WriteParams) -> Result<Value, ClientError> {
        let name = object_name(&obj)?;
        let updated = self.api(namespace).replace(&name, &post_params(params), &to_dynamic(obj)?).await?;
        to_value(updated)
    }

    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        body: PatchBody,
        params: &WriteParams,
    ) -> Result<Value, ClientError> {
        let pp = PatchParams {
            dry_run: params.dry_run,
            field_manager: params.field_manager.clone(),
            ..PatchParams::default()
        };
        let api = self.api(namespace);
        let patched = match body {
            PatchBody::Strategic(v) => api.patch(name, &pp, &Patch::Strategic(v)).await?,
            PatchBody::Merge(v) => api.patch(name, &pp, &Patch::Merge(v)).await?,
            PatchBody::Json(v) => {
                let patch: json_patch::Patch =
                    serde_json::from_value(v).map_err(|e| ClientError::Config(format!("invalid JSON patch: {e}")))?;
                api.patch(name, &pp, &Patch::<Value>::Json(patch)).await?
            }
        };
        to_value(patched)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str, params: &DeleteParams) -> Result<(), ClientError> {
        let dp = kube::api::DeleteParams {
            dry_run: params.dry_run,
            grace_period_seconds: params.grace_period_seconds,
            ..kube::api::DeleteParams::default()
        };
        self.api(namespace).delete(name, &dp).await?;
        Ok(())
    }
}
