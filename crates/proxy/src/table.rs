//! Table response normalization and reserved-field aliasing.
//!
//! Upstream may answer with a `Table` (`kind=Table`, apiVersion
//! `meta.k8s.io/v1[beta1]`) whose rows carry the real object plus display
//! cells. The store promotes rows back to objects, attaching the cells under
//! `metadata.fields`.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use vantage_client::{
    ClientError, DeleteParams, EventStream, GetParams, ObjectPage, PageParams, PatchBody, ResourceClient,
    UpstreamEvent, WriteParams,
};
use vantage_core::RESERVED_FIELDS;

fn is_table(obj: &Value) -> bool {
    obj.get("kind").and_then(|v| v.as_str()) == Some("Table")
        && matches!(
            obj.get("apiVersion").and_then(|v| v.as_str()),
            Some("meta.k8s.io/v1") | Some("meta.k8s.io/v1beta1")
        )
}

/// Expand a table into its row objects, each with the row's cells attached
/// under `metadata.fields`.
pub fn table_to_objects(table: &Value) -> Vec<Value> {
    let mut result = Vec::new();
    let Some(rows) = table.get("rows").and_then(|v| v.as_array()) else {
        return result;
    };
    for row in rows {
        let Some(object) = row.get("object").filter(|o| o.is_object()) else {
            continue;
        };
        let mut object = object.clone();
        if let Some(cells) = row.get("cells") {
            if let Some(meta) = object.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.insert("fields".to_string(), cells.clone());
            } else if let Some(map) = object.as_object_mut() {
                map.insert("metadata".to_string(), serde_json::json!({ "fields": cells }));
            }
        }
        result.push(object);
    }
    result
}

/// Promote a single-row table response to its underlying object, in place.
/// Anything that is not a single-row table passes through untouched.
pub fn row_to_object(obj: &mut Value) {
    if !is_table(obj) {
        return;
    }
    let mut items = table_to_objects(obj);
    if items.len() == 1 {
        *obj = items.remove(0);
    }
}

/// Collapse underscore-prefixed aliases of reserved fields back to their
/// canonical names. The alias wins when both are present.
pub fn move_from_underscore(obj: &mut Value) {
    let Some(map) = obj.as_object_mut() else {
        return;
    };
    for key in RESERVED_FIELDS {
        if let Some(value) = map.remove(&format!("_{key}")) {
            map.insert(key.to_string(), value);
        }
    }
}

/// Client decorator normalizing table responses on every read path.
pub struct TableClient {
    inner: Arc<dyn ResourceClient>,
}

impl TableClient {
    pub fn new(inner: Arc<dyn ResourceClient>) -> Arc<Self> {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl ResourceClient for TableClient {
    async fn get(&self, namespace: Option<&str>, name: &str, params: &GetParams) -> Result<Value, ClientError> {
        let mut obj = self.inner.get(namespace, name, params).await?;
        row_to_object(&mut obj);
        Ok(obj)
    }

    async fn list(&self, namespace: Option<&str>, params: &PageParams) -> Result<ObjectPage, ClientError> {
        let mut page = self.inner.list(namespace, params).await?;
        if page.items.len() == 1 && is_table(&page.items[0]) {
            page.items = table_to_objects(&page.items[0]);
        } else {
            for item in &mut page.items {
                row_to_object(item);
            }
        }
        Ok(page)
    }

    async fn watch(
        &self,
        namespace: Option<&str>,
        resource_version: &str,
        timeout_secs: Option<u32>,
    ) -> Result<EventStream, ClientError> {
        let stream = self.inner.watch(namespace, resource_version, timeout_secs).await?;
        let mapped = stream.map(|item| {
            item.map(|event| match event {
                UpstreamEvent::Added(mut o) => {
                    row_to_object(&mut o);
                    UpstreamEvent::Added(o)
                }
                UpstreamEvent::Modified(mut o) => {
                    row_to_object(&mut o);
                    UpstreamEvent::Modified(o)
                }
                UpstreamEvent::Deleted(mut o) => {
                    row_to_object(&mut o);
                    UpstreamEvent::Deleted(o)
                }
                bookmark @ UpstreamEvent::Bookmark { .. } => bookmark,
            })
        });
        Ok(mapped.boxed())
    }

    async fn create(&self, namespace: Option<&str>, obj: Value, params: &WriteParams) -> Result<Value, ClientError> {
        let mut created = self.inner.create(namespace, obj, params).await?;
        row_to_object(&mut created);
        Ok(created)
    }

    async fn update(&self, namespace: Option<&str>, obj: Value, params: &WriteParams) -> Result<Value, ClientError> {
        let mut updated = self.inner.update(namespace, obj, params).await?;
        row_to_object(&mut updated);
        Ok(updated)
    }

    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        body: PatchBody,
        params: &WriteParams,
    ) -> Result<Value, ClientError> {
        self.inner.patch(namespace, name, body, params).await
    }

    async fn delete(&self, namespace: Option<&str>, name: &str, params: &DeleteParams) -> Result<(), ClientError> {
        self.inner.delete(namespace, name, params).await
    }
}
