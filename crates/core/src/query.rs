//! Structured list queries and access-control partitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Comparison applied by a single filter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Eq,
    NotEq,
    Lt,
    Gt,
    Exists,
    NotExists,
    In,
    NotIn,
}

/// One filter leaf targeting a single indexed field path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Field path split into segments, e.g. `["spec", "nodeName"]`.
    pub field: Vec<String>,
    /// Values matched against; more than one behaves like a set op.
    pub matches: Vec<String>,
    pub op: Op,
    /// Substring match instead of exact equality (only for Eq/NotEq).
    pub partial: bool,
}

impl Filter {
    pub fn eq(field: &[&str], value: &str) -> Self {
        Self {
            field: field.iter().map(|s| s.to_string()).collect(),
            matches: vec![value.to_string()],
            op: Op::Eq,
            partial: false,
        }
    }
}

/// A disjunction of filter leaves. The full filter set is a conjunction of
/// these groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrFilter {
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// One sort key with direction. Multi-key sorts are stable with an implicit
/// trailing `id` ascending tiebreaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: Vec<String>,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: usize,
    pub limit: Option<usize>,
    /// Opaque token produced by a previous page; encodes the next offset and
    /// the snapshot revision.
    pub continue_token: Option<String>,
}

/// Parsed query options for a cached list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    pub filters: Vec<OrFilter>,
    pub sort: Vec<Sort>,
    pub pagination: Pagination,
}

/// Result envelope for a cached list: items, pre-pagination match count, the
/// revision the query observed and the token for the next page.
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub items: Vec<serde_json::Value>,
    pub total: usize,
    pub revision: String,
    pub continue_token: Option<String>,
}

/// A slice of the cluster a caller is authorized to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partition {
    /// No cache involvement; delegate to upstream as-is.
    Passthrough,
    /// Everything, optionally scoped to one namespace.
    All { namespace: Option<String> },
    /// A finite set of allowed names within an optional namespace.
    Names { namespace: Option<String>, names: BTreeSet<String> },
}

impl Partition {
    pub fn all() -> Self {
        Partition::All { namespace: None }
    }

    pub fn all_in(namespace: &str) -> Self {
        Partition::All { namespace: Some(namespace.to_string()) }
    }

    pub fn names(namespace: Option<&str>, names: &[&str]) -> Self {
        Partition::Names {
            namespace: namespace.map(|s| s.to_string()),
            names: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Namespace this partition restricts a watch to, if any.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Partition::Passthrough => None,
            Partition::All { namespace } | Partition::Names { namespace, .. } => namespace.as_deref(),
        }
    }
}
