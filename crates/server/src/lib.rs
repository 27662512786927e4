//! HTTP dispatch for the proxy: one mux routing the API root, resource
//! paths, the extension server and the raw upstream proxy, with a fallback
//! for everything else.

#![forbid(unsafe_code)]

use axum::routing::MethodRouter;
use axum::Router;

/// Where a request path lands. [`resolve`] is the single source of truth for
/// the table-driven dispatch tests; [`routes`] wires the same table into an
/// axum router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    ApiRoot,
    K8sResource {
        resource_type: String,
        name_or_ns: Option<String>,
        namespace: Option<String>,
        name: Option<String>,
        link: Option<String>,
    },
    /// Extension server target, prefix already stripped.
    Extension { rest: String },
    K8sProxy,
    Next,
}

pub fn resolve(path: &str) -> Route {
    if path == "/" || path == "/v1" {
        return Route::ApiRoot;
    }
    if path == "/ext" {
        return Route::Extension { rest: "/".to_string() };
    }
    if let Some(rest) = path.strip_prefix("/ext/") {
        return Route::Extension { rest: format!("/{rest}") };
    }
    if path == "/api"
        || path.starts_with("/api/")
        || path.starts_with("/apis/")
        || path.starts_with("/openapi/")
        || path == "/version"
        || path.starts_with("/version/")
    {
        return Route::K8sProxy;
    }
    if let Some(rest) = path.strip_prefix("/v1/") {
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        return match segments.as_slice() {
            [resource_type] => Route::K8sResource {
                resource_type: resource_type.to_string(),
                name_or_ns: None,
                namespace: None,
                name: None,
                link: None,
            },
            [resource_type, name_or_ns] => Route::K8sResource {
                resource_type: resource_type.to_string(),
                name_or_ns: Some(name_or_ns.to_string()),
                namespace: None,
                name: None,
                link: None,
            },
            [resource_type, namespace, name] => Route::K8sResource {
                resource_type: resource_type.to_string(),
                name_or_ns: None,
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                link: None,
            },
            [resource_type, namespace, name, link] => Route::K8sResource {
                resource_type: resource_type.to_string(),
                name_or_ns: None,
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                link: Some(link.to_string()),
            },
            _ => Route::Next,
        };
    }
    Route::Next
}

/// Request coordinates for the k8s-resource handler after path-parameter
/// mapping. The two-segment form binds to the namespace for namespaced
/// schemas and to the name otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceParams {
    pub resource_type: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub link: Option<String>,
}

pub fn resource_params(route: &Route, schema_namespaced: impl Fn(&str) -> Option<bool>) -> Option<ResourceParams> {
    let Route::K8sResource { resource_type, name_or_ns, namespace, name, link } = route else {
        return None;
    };
    let mut params = ResourceParams {
        resource_type: resource_type.clone(),
        namespace: None,
        name: name.clone(),
        link: link.clone(),
    };
    if let Some(name_or_ns) = name_or_ns {
        if schema_namespaced(resource_type).unwrap_or(false) {
            params.namespace = Some(name_or_ns.clone());
        } else {
            params.name = Some(name_or_ns.clone());
        }
    }
    if let Some(namespace) = namespace {
        params.namespace = Some(namespace.clone());
    }
    Some(params)
}

/// Leaf handlers the mux dispatches to. The extension server, when present,
/// is served under `/ext` with the prefix stripped.
pub struct Handlers {
    pub api_root: MethodRouter,
    pub k8s_resource: MethodRouter,
    pub k8s_proxy: MethodRouter,
    pub extension_api_server: Option<Router>,
    pub next: Option<MethodRouter>,
}

pub fn routes(handlers: Handlers) -> Router {
    let mut mux = Router::new()
        .route("/", handlers.api_root.clone())
        .route("/v1", handlers.api_root)
        .route("/v1/{type}", handlers.k8s_resource.clone())
        .route("/v1/{type}/{nameorns}", handlers.k8s_resource.clone())
        .route("/v1/{type}/{namespace}/{name}", handlers.k8s_resource.clone())
        .route("/v1/{type}/{namespace}/{name}/{link}", handlers.k8s_resource)
        .route("/api", handlers.k8s_proxy.clone())
        .route("/api/{*rest}", handlers.k8s_proxy.clone())
        .route("/apis/{*rest}", handlers.k8s_proxy.clone())
        .route("/openapi/{*rest}", handlers.k8s_proxy.clone())
        .route("/version", handlers.k8s_proxy.clone())
        .route("/version/{*rest}", handlers.k8s_proxy);
    if let Some(extension) = handlers.extension_api_server {
        mux = mux.nest("/ext", extension);
    }
    if let Some(next) = handlers.next {
        mux = mux.fallback_service(next);
    }
    mux
}
