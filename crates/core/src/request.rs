//! The request envelope handed to the proxy store, plus the schema shape the
//! store needs from the (external) schema layer.

use crate::Gvk;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

/// Authenticated caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub groups: Vec<String>,
}

/// Flattened view of the caller's granted verbs, as resolved by the access
/// control layer. `*` wildcards on either position are honored.
#[derive(Debug, Clone, Default)]
pub struct AccessSet {
    grants: HashSet<(String, String)>,
}

impl AccessSet {
    pub fn grant(&mut self, verb: &str, resource: &str) {
        self.grants.insert((verb.to_string(), resource.to_string()));
    }

    pub fn grants(&self, verb: &str, resource: &str) -> bool {
        self.grants.contains(&(verb.to_string(), resource.to_string()))
            || self.grants.contains(&(verb.to_string(), "*".to_string()))
            || self.grants.contains(&("*".to_string(), resource.to_string()))
            || self.grants.contains(&("*".to_string(), "*".to_string()))
    }
}

/// One display column declared by the schema layer. `field` uses the
/// abbreviated JSONPath form (`$.spec.nodeName`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub field: String,
}

/// The slice of an API schema the proxy store consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSchema {
    /// Schema ID, e.g. `pods` or `apps.deployments`.
    pub id: String,
    pub gvk: Gvk,
    pub namespaced: bool,
    /// Whether upstream supports list+watch for this kind.
    pub list_watchable: bool,
    pub crd: bool,
    pub columns: Vec<ColumnDefinition>,
}

impl ApiSchema {
    pub fn new(id: &str, gvk: Gvk, namespaced: bool) -> Self {
        Self { id: id.to_string(), gvk, namespaced, list_watchable: true, crd: false, columns: Vec::new() }
    }
}

/// Everything the store needs to know about one inbound API call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: http::Method,
    pub namespace: Option<String>,
    pub name: Option<String>,
    /// Decoded URL query parameters, in arrival order.
    pub query: Vec<(String, String)>,
    pub content_type: Option<String>,
    /// Raw request body; only consulted on PATCH.
    pub body: Vec<u8>,
    pub user: Option<UserInfo>,
    pub access: AccessSet,
    /// Caller cancellation; dropped or cancelled when the caller goes away.
    pub cancel: CancellationToken,
}

impl Default for ApiRequest {
    fn default() -> Self {
        Self {
            method: http::Method::GET,
            namespace: None,
            name: None,
            query: Vec::new(),
            content_type: None,
            body: Vec::new(),
            user: None,
            access: AccessSet::default(),
            cancel: CancellationToken::new(),
        }
    }
}

impl ApiRequest {
    /// First value for a query parameter, if present.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// All values for a repeatable query parameter.
    pub fn query_params(&self, key: &str) -> Vec<&str> {
        self.query.iter().filter(|(k, _)| k == key).map(|(_, v)| v.as_str()).collect()
    }
}

/// Parameters of one watch request as decoded by the API layer.
#[derive(Debug, Clone, Default)]
pub struct WatchRequest {
    /// Resource version to start from; empty means "from now".
    pub revision: Option<String>,
    /// Restrict to a single object, `name` or `namespace/name`.
    pub id: Option<String>,
    /// Label selector expression.
    pub selector: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_set_wildcards() {
        let mut set = AccessSet::default();
        set.grant("list", "*");
        assert!(set.grants("list", "pods"));
        assert!(set.grants("list", "*"));
        assert!(!set.grants("watch", "pods"));
    }

    #[test]
    fn query_param_lookup() {
        let req = ApiRequest {
            query: vec![
                ("filter".into(), "metadata.name=a".into()),
                ("filter".into(), "spec.nodeName=n1".into()),
                ("limit".into(), "10".into()),
            ],
            ..Default::default()
        };
        assert_eq!(req.query_param("limit"), Some("10"));
        assert_eq!(req.query_params("filter").len(), 2);
        assert_eq!(req.query_param("continue"), None);
    }
}
