//! Per-kind indexed field registry and cross-kind dependency tables.
//!
//! The registry is data, not code: operators extend coverage by adding
//! entries, never by touching query logic.

use crate::Gvk;
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Fields indexed for every kind.
pub static COMMON_INDEX_FIELDS: Lazy<Vec<Vec<String>>> = Lazy::new(|| {
    vec![path(&["id"]), path(&["metadata", "state", "name"])]
});

fn path(segments: &[&str]) -> Vec<String> {
    segments.iter().map(|s| s.to_string()).collect()
}

/// Extra indexed paths per kind, keyed by `Gvk::key()`. Kept in alphabetical
/// order on a field-by-field basis.
static TYPE_SPECIFIC_INDEXED_FIELDS: Lazy<HashMap<String, Vec<Vec<String>>>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(
        Gvk::new("", "v1", "Event").key(),
        vec![
            path(&["_type"]),
            path(&["involvedObject", "kind"]),
            path(&["involvedObject", "uid"]),
            path(&["message"]),
            path(&["reason"]),
        ],
    );
    m.insert(Gvk::new("", "v1", "Namespace").key(), vec![path(&["spec", "displayName"])]);
    m.insert(
        Gvk::new("", "v1", "Node").key(),
        vec![
            path(&["status", "nodeInfo", "kubeletVersion"]),
            path(&["status", "nodeInfo", "operatingSystem"]),
        ],
    );
    m.insert(
        Gvk::new("", "v1", "PersistentVolume").key(),
        vec![
            path(&["status", "reason"]),
            path(&["spec", "persistentVolumeReclaimPolicy"]),
        ],
    );
    m.insert(
        Gvk::new("", "v1", "PersistentVolumeClaim").key(),
        vec![path(&["spec", "volumeName"])],
    );
    m.insert(
        Gvk::new("", "v1", "Pod").key(),
        vec![path(&["spec", "containers", "image"]), path(&["spec", "nodeName"])],
    );
    m.insert(
        Gvk::new("", "v1", "ReplicationController").key(),
        vec![path(&["spec", "template", "spec", "containers", "image"])],
    );
    m.insert(
        Gvk::new("", "v1", "Secret").key(),
        vec![path(&["metadata", "annotations", "management.cattle.io/project-scoped-secret-copy"])],
    );
    m.insert(
        Gvk::new("", "v1", "Service").key(),
        vec![path(&["spec", "clusterIP"]), path(&["spec", "type"])],
    );
    for kind in ["DaemonSet", "Deployment", "StatefulSet"] {
        m.insert(
            Gvk::new("apps", "v1", kind).key(),
            vec![
                path(&["metadata", "annotations", "field.cattle.io/publicEndpoints"]),
                path(&["spec", "template", "spec", "containers", "image"]),
            ],
        );
    }
    m.insert(
        Gvk::new("apps", "v1", "ReplicaSet").key(),
        vec![path(&["spec", "template", "spec", "containers", "image"])],
    );
    m.insert(
        Gvk::new("autoscaling", "v2", "HorizontalPodAutoscaler").key(),
        vec![
            path(&["spec", "scaleTargetRef", "name"]),
            path(&["spec", "minReplicas"]),
            path(&["spec", "maxReplicas"]),
            path(&["status", "currentReplicas"]),
        ],
    );
    m.insert(
        Gvk::new("batch", "v1", "CronJob").key(),
        vec![
            path(&["metadata", "annotations", "field.cattle.io/publicEndpoints"]),
            path(&["spec", "jobTemplate", "spec", "template", "spec", "containers", "image"]),
        ],
    );
    m.insert(
        Gvk::new("batch", "v1", "Job").key(),
        vec![
            path(&["metadata", "annotations", "field.cattle.io/publicEndpoints"]),
            path(&["spec", "template", "spec", "containers", "image"]),
        ],
    );
    m.insert(
        Gvk::new("management.cattle.io", "v3", "Project").key(),
        vec![path(&["spec", "clusterName"]), path(&["spec", "displayName"])],
    );
    m.insert(
        Gvk::new("networking.k8s.io", "v1", "Ingress").key(),
        vec![path(&["spec", "rules", "host"]), path(&["spec", "ingressClassName"])],
    );
    m.insert(
        Gvk::new("storage.k8s.io", "v1", "StorageClass").key(),
        vec![
            path(&["provisioner"]),
            path(&["metadata", "annotations", "storageclass.kubernetes.io/is-default-class"]),
        ],
    );
    m
});

/// Common fields plus any kind-specific extras for the given kind.
pub fn indexed_fields_for(gvk: &Gvk) -> Vec<Vec<String>> {
    let mut fields = COMMON_INDEX_FIELDS.clone();
    if let Some(extra) = TYPE_SPECIFIC_INDEXED_FIELDS.get(&gvk.key()) {
        fields.extend(extra.iter().cloned());
    }
    fields
}

/// A label on objects of `source_gvk` whose value names an object of
/// `target_gvk`; rows of the source kind carry a derived column filled from
/// `target_final_field` of the matching target object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalLabelDependency {
    pub source_gvk: Gvk,
    pub source_label: String,
    pub target_gvk: Gvk,
    pub target_key_field: String,
    pub target_final_field: String,
}

/// Recompute instructions for one affected kind when a dependency target
/// mutates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalGvkUpdates {
    pub affected_gvk: Gvk,
    pub label_dependencies: Vec<ExternalLabelDependency>,
}

fn namespace_project_dependency() -> ExternalLabelDependency {
    ExternalLabelDependency {
        source_gvk: Gvk::new("", "v1", "Namespace"),
        source_label: "field.cattle.io/projectId".to_string(),
        target_gvk: Gvk::new("management.cattle.io", "v3", "Project"),
        target_key_field: "metadata.name".to_string(),
        target_final_field: "spec.displayName".to_string(),
    }
}

fn namespace_updates() -> ExternalGvkUpdates {
    ExternalGvkUpdates {
        affected_gvk: Gvk::new("", "v1", "Namespace"),
        label_dependencies: vec![namespace_project_dependency()],
    }
}

/// Target kind -> rows of another kind to refresh when the target mutates.
pub static EXTERNAL_GVK_DEPENDENCIES: Lazy<HashMap<String, ExternalGvkUpdates>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(Gvk::new("management.cattle.io", "v3", "Project").key(), namespace_updates());
    m
});

/// Kind -> derived columns on its own rows to fill at ingest.
pub static SELF_GVK_DEPENDENCIES: Lazy<HashMap<String, ExternalGvkUpdates>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(Gvk::new("", "v1", "Namespace").key(), namespace_updates());
    m
});

/// Split a dotted field path into segments, honoring a single bracketed label
/// segment: `metadata.labels[field.cattle.io/projectId]` keeps the bracket
/// content intact.
pub fn parse_field_path(field: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut rest = field;
    while let Some(open) = rest.find('[') {
        let (head, tail) = rest.split_at(open);
        for seg in head.split('.').filter(|s| !s.is_empty()) {
            segments.push(seg.to_string());
        }
        match tail[1..].find(']') {
            Some(close) => {
                segments.push(tail[1..close + 1].to_string());
                rest = &tail[close + 2..];
            }
            None => {
                segments.push(tail[1..].to_string());
                rest = "";
            }
        }
    }
    for seg in rest.split('.').filter(|s| !s.is_empty()) {
        segments.push(seg.to_string());
    }
    segments
}

/// Inverse of [`parse_field_path`]: the canonical column label of a path.
/// Segments containing dots or slashes are bracketed.
pub fn field_path_label(path: &[String]) -> String {
    let mut out = String::new();
    for seg in path {
        if seg.contains('.') || seg.contains('/') {
            out.push('[');
            out.push_str(seg);
            out.push(']');
        } else {
            if !out.is_empty() {
                out.push('.');
            }
            out.push_str(seg);
        }
    }
    out
}

/// Extract the value at `path` from an object. Arrays along the way fan out;
/// multiple hits are joined with `|`, the separator queries use for
/// multi-valued indexed fields. Returns None when the path is absent.
pub fn extract_field(obj: &serde_json::Value, path: &[String]) -> Option<String> {
    fn walk<'a>(value: &'a serde_json::Value, path: &[String], hits: &mut Vec<&'a serde_json::Value>) {
        if path.is_empty() {
            hits.push(value);
            return;
        }
        match value {
            serde_json::Value::Object(map) => {
                if let Some(next) = map.get(&path[0]) {
                    walk(next, &path[1..], hits);
                }
            }
            serde_json::Value::Array(items) => {
                for item in items {
                    walk(item, path, hits);
                }
            }
            _ => {}
        }
    }

    let mut hits = Vec::new();
    walk(obj, path, &mut hits);
    let rendered: Vec<String> = hits
        .iter()
        .filter_map(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
        .collect();
    if rendered.is_empty() {
        None
    } else {
        Some(rendered.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registry_includes_common_fields() {
        let fields = indexed_fields_for(&Gvk::new("", "v1", "Pod"));
        assert!(fields.contains(&vec!["id".to_string()]));
        assert!(fields.contains(&vec!["spec".to_string(), "nodeName".to_string()]));
        // unknown kinds still get the common set
        let fields = indexed_fields_for(&Gvk::new("example.io", "v1", "Widget"));
        assert_eq!(fields.len(), COMMON_INDEX_FIELDS.len());
    }

    #[test]
    fn field_path_round_trip() {
        let parsed = parse_field_path("metadata.labels[field.cattle.io/projectId]");
        assert_eq!(parsed, vec!["metadata", "labels", "field.cattle.io/projectId"]);
        assert_eq!(field_path_label(&parsed), "metadata.labels[field.cattle.io/projectId]");

        let plain = parse_field_path("spec.nodeName");
        assert_eq!(plain, vec!["spec", "nodeName"]);
        assert_eq!(field_path_label(&plain), "spec.nodeName");
    }

    #[test]
    fn extract_scalar_and_array_fields() {
        let pod = json!({
            "spec": {
                "nodeName": "node-1",
                "containers": [
                    {"image": "nginx:1.25"},
                    {"image": "busybox:1.36"},
                ],
            }
        });
        let node = extract_field(&pod, &[s("spec"), s("nodeName")]);
        assert_eq!(node.as_deref(), Some("node-1"));
        let images = extract_field(&pod, &[s("spec"), s("containers"), s("image")]);
        assert_eq!(images.as_deref(), Some("nginx:1.25|busybox:1.36"));
        assert_eq!(extract_field(&pod, &[s("spec"), s("missing")]), None);
    }

    fn s(v: &str) -> String {
        v.to_string()
    }

    #[test]
    fn dependency_tables_are_symmetric() {
        let project = Gvk::new("management.cattle.io", "v3", "Project");
        let ns = Gvk::new("", "v1", "Namespace");
        let ext = EXTERNAL_GVK_DEPENDENCIES.get(&project.key()).unwrap();
        assert_eq!(ext.affected_gvk, ns);
        let own = SELF_GVK_DEPENDENCIES.get(&ns.key()).unwrap();
        assert_eq!(own.label_dependencies[0].source_label, "field.cattle.io/projectId");
    }
}
