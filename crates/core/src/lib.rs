//! Vantage core types: requests, schemas, query options, events and the
//! indexed-field registry shared by the client, cache and proxy crates.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

pub mod error;
pub mod fields;
pub mod query;
pub mod request;

pub use error::ApiError;
pub use query::{Filter, ListOptions, ListResult, Op, OrFilter, Pagination, Partition, Sort, SortOrder};
pub use request::{AccessSet, ApiRequest, ApiSchema, ColumnDefinition, UserInfo, WatchRequest};

/// Group/Version/Kind identity of a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Registry key, e.g. `apps_v1_Deployment` or `_v1_Pod` for the core group.
    pub fn key(&self) -> String {
        format!("{}_{}_{}", self.group, self.version, self.kind)
    }

    /// `apiVersion` / `kind` pair as they appear on wire objects.
    pub fn to_api_version_and_kind(&self) -> (String, String) {
        let api_version = if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        };
        (api_version, self.kind.clone())
    }
}

impl std::fmt::Display for Gvk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Terminal payload of a watch error event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStatus {
    pub message: String,
    pub code: Option<u16>,
}

/// A single event on a watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Added(serde_json::Value),
    Modified(serde_json::Value),
    Deleted(serde_json::Value),
    Error(ErrorStatus),
}

impl Event {
    pub fn object(&self) -> Option<&serde_json::Value> {
        match self {
            Event::Added(o) | Event::Modified(o) | Event::Deleted(o) => Some(o),
            Event::Error(_) => None,
        }
    }

    /// `metadata.name` of the carried object, if any.
    pub fn object_name(&self) -> Option<&str> {
        self.object().and_then(|o| o.pointer("/metadata/name")).and_then(|v| v.as_str())
    }
}

/// Top-level object keys a client may also provide under an underscore alias.
pub const RESERVED_FIELDS: [&str; 4] = ["id", "type", "links", "actions"];

/// A non-fatal advisory captured from an upstream response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub code: u16,
    pub agent: String,
    pub text: String,
}

/// Per-request accumulator for upstream warning headers. Cheap to clone and
/// share with the client handle issuing the requests.
#[derive(Debug, Default, Clone)]
pub struct WarningBuffer {
    inner: Arc<Mutex<Vec<Warning>>>,
}

impl WarningBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, code: u16, agent: &str, text: &str) {
        self.inner.lock().unwrap().push(Warning {
            code,
            agent: agent.to_string(),
            text: text.to_string(),
        });
    }

    /// Take the warnings accrued so far, leaving the buffer empty.
    pub fn drain(&self) -> Vec<Warning> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
