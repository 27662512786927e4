//! SQLite-backed indexed table holding the mirrored rows of one resource
//! kind. One file per informer; recreated on open, dropped on reset.

use crate::{parse_rv, CacheError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use metrics::{counter, histogram};
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use vantage_core::fields::{extract_field, field_path_label};
use vantage_core::{ListOptions, ListResult, Op, Partition, SortOrder};

/// Offset plus snapshot revision, serialized into the opaque continue token.
#[derive(Debug, Serialize, Deserialize)]
struct ContinueToken {
    offset: usize,
    revision: String,
}

pub(crate) fn encode_continue(offset: usize, revision: &str) -> String {
    let token = ContinueToken { offset, revision: revision.to_string() };
    BASE64.encode(serde_json::to_vec(&token).expect("token serializes"))
}

fn decode_continue(token: &str) -> Result<(usize, String), CacheError> {
    let bytes = BASE64
        .decode(token)
        .map_err(|e| CacheError::InvalidContinueToken(e.to_string()))?;
    let token: ContinueToken =
        serde_json::from_slice(&bytes).map_err(|e| CacheError::InvalidContinueToken(e.to_string()))?;
    Ok((token.offset, token.revision))
}

struct IndexedColumn {
    label: String,
    path: Vec<String>,
}

/// Durable row store with one nullable column per indexed field path.
pub struct IndexedStore {
    db: Mutex<Connection>,
    path: PathBuf,
    columns: Vec<IndexedColumn>,
    labels: HashSet<String>,
}

/// Map field labels that every row carries natively onto their fixed columns.
fn builtin_column(label: &str) -> Option<&'static str> {
    match label {
        "id" => Some("id"),
        "metadata.name" => Some("name"),
        "metadata.namespace" => Some("namespace"),
        _ => None,
    }
}

fn quote(label: &str) -> String {
    format!("\"{}\"", label.replace('"', ""))
}

pub(crate) fn object_id(obj: &Value) -> String {
    let name = obj.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or_default();
    match obj.pointer("/metadata/namespace").and_then(|v| v.as_str()) {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}

impl IndexedStore {
    /// Open a fresh store at `path`, indexing the given field paths. Any
    /// existing file is discarded; no durability across restarts is promised.
    pub fn new(path: &Path, field_paths: &[Vec<String>]) -> Result<Self, CacheError> {
        let started = Instant::now();
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let db = Connection::open(path)?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();

        let mut columns = Vec::new();
        let mut labels = HashSet::new();
        let mut ddl = String::from(
            "CREATE TABLE IF NOT EXISTS objects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                namespace TEXT,
                rv INTEGER NOT NULL,
                data TEXT NOT NULL",
        );
        for path in field_paths {
            let label = field_path_label(path);
            if builtin_column(&label).is_some() || !labels.insert(label.clone()) {
                continue;
            }
            ddl.push_str(&format!(",\n                {} TEXT", quote(&label)));
            columns.push(IndexedColumn { label, path: path.clone() });
        }
        ddl.push_str("\n            )");
        db.execute(&ddl, [])?;
        for (i, col) in columns.iter().enumerate() {
            db.execute(
                &format!("CREATE INDEX IF NOT EXISTS idx_objects_{} ON objects({})", i, quote(&col.label)),
                [],
            )
            .ok();
        }
        db.execute("CREATE INDEX IF NOT EXISTS idx_objects_ns_name ON objects(namespace, name)", []).ok();

        histogram!("cache_store_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db), path: path.to_path_buf(), columns, labels })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace one row. `derived` carries column overrides computed
    /// from dependency targets; the whole row lands in a single statement so
    /// readers never observe torn state.
    pub fn upsert(&self, obj: &Value, derived: &[(String, Option<String>)]) -> Result<(), CacheError> {
        let id = object_id(obj);
        let name = obj.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let namespace = obj.pointer("/metadata/namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
        let rv = parse_rv(obj.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()).unwrap_or_default());

        let mut cols = vec!["id".to_string(), "name".to_string(), "namespace".to_string(), "rv".to_string(), "data".to_string()];
        let mut vals: Vec<SqlValue> = vec![
            SqlValue::Text(id.clone()),
            SqlValue::Text(name),
            namespace.map(SqlValue::Text).unwrap_or(SqlValue::Null),
            SqlValue::Integer(rv as i64),
            SqlValue::Text(serde_json::to_string(obj)?),
        ];
        for col in &self.columns {
            let value = if col.label == "id" {
                Some(id.clone())
            } else {
                extract_field(obj, &col.path)
            };
            let value = derived
                .iter()
                .find(|(label, _)| *label == col.label)
                .map(|(_, v)| v.clone())
                .unwrap_or(value);
            cols.push(quote(&col.label));
            vals.push(value.map(SqlValue::Text).unwrap_or(SqlValue::Null));
        }

        let placeholders: Vec<String> = (1..=vals.len()).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = cols.iter().skip(1).map(|c| format!("{c} = excluded.{c}")).collect();
        let sql = format!(
            "INSERT INTO objects ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
            cols.join(", "),
            placeholders.join(", "),
            updates.join(", "),
        );
        let db = self.db.lock().unwrap();
        db.execute(&sql, rusqlite::params_from_iter(vals))?;
        counter!("cache_store_upserts_total", 1u64);
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<(), CacheError> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM objects WHERE id = ?1", [id])?;
        counter!("cache_store_deletes_total", 1u64);
        Ok(())
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM objects", [])?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize, CacheError> {
        let db = self.db.lock().unwrap();
        let n: i64 = db.query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// Fetch one object by an indexed (or built-in) field value.
    pub fn get_by_field(&self, field_label: &str, key: &str) -> Result<Option<Value>, CacheError> {
        let column = self.resolve_column(field_label)?;
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!("SELECT data FROM objects WHERE {column} = ?1 LIMIT 1"))?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => {
                let data: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    /// Refresh a derived column on every row whose `match_label` column holds
    /// `key`. One UPDATE, atomic per row.
    pub fn update_derived(
        &self,
        set_label: &str,
        value: Option<&str>,
        match_label: &str,
        key: &str,
    ) -> Result<usize, CacheError> {
        let set_column = self.resolve_column(set_label)?;
        let match_column = self.resolve_column(match_label)?;
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            &format!("UPDATE objects SET {set_column} = ?1 WHERE {match_column} = ?2"),
            rusqlite::params![value, key],
        )?;
        counter!("cache_derived_updates_total", changed as u64);
        Ok(changed)
    }

    fn resolve_column(&self, label: &str) -> Result<String, CacheError> {
        if let Some(builtin) = builtin_column(label) {
            return Ok(builtin.to_string());
        }
        if self.labels.contains(label) {
            return Ok(quote(label));
        }
        Err(CacheError::InvalidColumn(label.to_string()))
    }

    /// Run a structured query. `revision` is the informer's current resource
    /// version and stamps the result and any continue token.
    pub fn list_by_options(
        &self,
        cancel: &CancellationToken,
        opts: &ListOptions,
        partitions: &[Partition],
        namespace: Option<&str>,
        revision: &str,
    ) -> Result<ListResult, CacheError> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let started = Instant::now();

        let (offset, revision) = match &opts.pagination.continue_token {
            Some(token) => decode_continue(token)?,
            None => (opts.pagination.offset, revision.to_string()),
        };

        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();

        if let Some(ns) = namespace.filter(|ns| !ns.is_empty()) {
            clauses.push(format!("namespace = ?{}", push(&mut params, ns.to_string())));
        }
        if let Some(clause) = self.partition_clause(partitions, &mut params) {
            clauses.push(clause);
        }
        for group in &opts.filters {
            let mut legs = Vec::with_capacity(group.filters.len());
            for filter in &group.filters {
                legs.push(self.filter_clause(filter, &mut params)?);
            }
            if !legs.is_empty() {
                clauses.push(format!("({})", legs.join(" OR ")));
            }
        }
        let where_sql = if clauses.is_empty() { String::new() } else { format!(" WHERE {}", clauses.join(" AND ")) };

        let mut order = Vec::with_capacity(opts.sort.len() + 1);
        for sort in &opts.sort {
            let column = self.resolve_column(&field_path_label(&sort.field))?;
            let dir = match sort.order {
                SortOrder::Asc => "ASC",
                SortOrder::Desc => "DESC",
            };
            order.push(format!("{column} {dir}"));
        }
        order.push("id ASC".to_string());
        let order_sql = format!(" ORDER BY {}", order.join(", "));

        let db = self.db.lock().unwrap();
        let total: i64 = db.query_row(
            &format!("SELECT COUNT(*) FROM objects{where_sql}"),
            rusqlite::params_from_iter(params.iter()),
            |row| row.get(0),
        )?;
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let limit = opts.pagination.limit.map(|l| l as i64).unwrap_or(-1);
        let mut page_params = params.clone();
        let limit_idx = push(&mut page_params, limit);
        let offset_idx = push(&mut page_params, offset as i64);
        let sql = format!("SELECT data FROM objects{where_sql}{order_sql} LIMIT ?{limit_idx} OFFSET ?{offset_idx}");
        let mut stmt = db.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(page_params.iter()))?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            let data: String = row.get(0)?;
            items.push(serde_json::from_str(&data)?);
        }

        let total = total as usize;
        let continue_token = match opts.pagination.limit {
            Some(limit) if offset + items.len() < total && limit > 0 => {
                Some(encode_continue(offset + limit, &revision))
            }
            _ => None,
        };

        histogram!("cache_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("cache_list_queries_total", 1u64);
        Ok(ListResult { items, total, revision, continue_token })
    }

    fn partition_clause(&self, partitions: &[Partition], params: &mut Vec<SqlValue>) -> Option<String> {
        // Any unrestricted partition makes the union unrestricted.
        if partitions.is_empty()
            || partitions
                .iter()
                .any(|p| matches!(p, Partition::Passthrough | Partition::All { namespace: None }))
        {
            return None;
        }
        let mut legs = Vec::with_capacity(partitions.len());
        for partition in partitions {
            match partition {
                Partition::Passthrough | Partition::All { namespace: None } => unreachable!(),
                Partition::All { namespace: Some(ns) } => {
                    legs.push(format!("namespace = ?{}", push(params, ns.clone())));
                }
                Partition::Names { namespace, names } => {
                    let marks: Vec<String> =
                        names.iter().map(|n| format!("?{}", push(params, n.clone()))).collect();
                    let names_sql = format!("name IN ({})", marks.join(", "));
                    match namespace {
                        Some(ns) if !ns.is_empty() => {
                            let ns_idx = push(params, ns.clone());
                            legs.push(format!("(namespace = ?{ns_idx} AND {names_sql})"));
                        }
                        _ => legs.push(format!("({names_sql})")),
                    }
                }
            }
        }
        Some(format!("({})", legs.join(" OR ")))
    }

    fn filter_clause(&self, filter: &vantage_core::Filter, params: &mut Vec<SqlValue>) -> Result<String, CacheError> {
        let column = self.resolve_column(&field_path_label(&filter.field))?;
        let clause = match filter.op {
            Op::Exists => format!("{column} IS NOT NULL"),
            Op::NotExists => format!("{column} IS NULL"),
            // order comparisons are numeric; TEXT columns would compare
            // byte-wise and rank "10" below "3"
            Op::Lt => format!(
                "CAST({column} AS REAL) < CAST(?{} AS REAL)",
                push(params, filter.matches.first().cloned().unwrap_or_default())
            ),
            Op::Gt => format!(
                "CAST({column} AS REAL) > CAST(?{} AS REAL)",
                push(params, filter.matches.first().cloned().unwrap_or_default())
            ),
            Op::Eq | Op::In => {
                if filter.partial {
                    let legs: Vec<String> = filter
                        .matches
                        .iter()
                        .map(|m| format!("{column} LIKE ?{}", push(params, format!("%{m}%"))))
                        .collect();
                    format!("({})", legs.join(" OR "))
                } else if filter.matches.len() == 1 {
                    format!("{column} = ?{}", push(params, filter.matches[0].clone()))
                } else {
                    let marks: Vec<String> =
                        filter.matches.iter().map(|m| format!("?{}", push(params, m.clone()))).collect();
                    format!("{column} IN ({})", marks.join(", "))
                }
            }
            Op::NotEq | Op::NotIn => {
                if filter.partial {
                    let legs: Vec<String> = filter
                        .matches
                        .iter()
                        .map(|m| format!("{column} NOT LIKE ?{}", push(params, format!("%{m}%"))))
                        .collect();
                    format!("({})", legs.join(" AND "))
                } else if filter.matches.len() == 1 {
                    format!("{column} != ?{}", push(params, filter.matches[0].clone()))
                } else {
                    let marks: Vec<String> =
                        filter.matches.iter().map(|m| format!("?{}", push(params, m.clone()))).collect();
                    format!("{column} NOT IN ({})", marks.join(", "))
                }
            }
        };
        Ok(clause)
    }
}

impl Drop for IndexedStore {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Append a parameter and return its 1-based placeholder index.
fn push(params: &mut Vec<SqlValue>, value: impl Into<SqlValue>) -> usize {
    params.push(value.into());
    params.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vantage_core::{Filter, ListOptions, OrFilter, Pagination, Sort};

    fn temp_store(fields: &[Vec<String>]) -> IndexedStore {
        let dir = std::env::temp_dir();
        let file = format!(
            "vantage-store-test-{}.db",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        );
        IndexedStore::new(&dir.join(file), fields).unwrap()
    }

    fn paths(specs: &[&[&str]]) -> Vec<Vec<String>> {
        specs.iter().map(|p| p.iter().map(|s| s.to_string()).collect()).collect()
    }

    fn pod(ns: &str, name: &str, node: &str, rv: u64) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": name, "namespace": ns, "resourceVersion": rv.to_string()},
            "spec": {"nodeName": node},
        })
    }

    fn options() -> ListOptions {
        ListOptions::default()
    }

    fn list(store: &IndexedStore, opts: &ListOptions) -> ListResult {
        store
            .list_by_options(&CancellationToken::new(), opts, &[Partition::all()], None, "100")
            .unwrap()
    }

    #[test]
    fn upsert_list_and_delete() {
        let store = temp_store(&paths(&[&["id"], &["spec", "nodeName"]]));
        store.upsert(&pod("ns1", "a", "node-1", 1), &[]).unwrap();
        store.upsert(&pod("ns1", "b", "node-2", 2), &[]).unwrap();
        store.upsert(&pod("ns2", "c", "node-1", 3), &[]).unwrap();
        // replace, not duplicate
        store.upsert(&pod("ns1", "a", "node-9", 4), &[]).unwrap();
        assert_eq!(store.len().unwrap(), 3);

        let out = list(&store, &options());
        assert_eq!(out.total, 3);
        assert_eq!(out.revision, "100");

        store.delete("ns1/a").unwrap();
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn filters_compose_as_and_of_or() {
        let store = temp_store(&paths(&[&["spec", "nodeName"]]));
        store.upsert(&pod("ns1", "a", "node-1", 1), &[]).unwrap();
        store.upsert(&pod("ns1", "b", "node-2", 2), &[]).unwrap();
        store.upsert(&pod("ns2", "c", "node-2", 3), &[]).unwrap();

        let mut opts = options();
        opts.filters = vec![
            OrFilter {
                filters: vec![
                    Filter::eq(&["spec", "nodeName"], "node-1"),
                    Filter::eq(&["spec", "nodeName"], "node-2"),
                ],
            },
            OrFilter { filters: vec![Filter::eq(&["metadata", "namespace"], "ns1")] },
        ];
        let out = list(&store, &opts);
        assert_eq!(out.total, 2);

        // missing field value: NULL op literal is false
        let empty = temp_store(&paths(&[&["spec", "nodeName"]]));
        empty
            .upsert(&json!({"metadata": {"name": "x", "resourceVersion": "1"}}), &[])
            .unwrap();
        let mut opts = options();
        opts.filters = vec![OrFilter {
            filters: vec![Filter {
                field: vec!["spec".into(), "nodeName".into()],
                matches: vec!["node-1".into()],
                op: Op::NotEq,
                partial: false,
            }],
        }];
        assert_eq!(list(&empty, &opts).total, 0);
    }

    #[test]
    fn order_comparisons_are_numeric_not_lexicographic() {
        let store = temp_store(&paths(&[&["spec", "minReplicas"]]));
        let hpa = |name: &str, replicas: u64, rv: u64| {
            json!({
                "metadata": {"name": name, "namespace": "ns1", "resourceVersion": rv.to_string()},
                "spec": {"minReplicas": replicas},
            })
        };
        store.upsert(&hpa("small", 3, 1), &[]).unwrap();
        store.upsert(&hpa("large", 10, 2), &[]).unwrap();

        let compare = |op: Op, value: &str| {
            let mut opts = options();
            opts.filters = vec![OrFilter {
                filters: vec![Filter {
                    field: vec!["spec".into(), "minReplicas".into()],
                    matches: vec![value.to_string()],
                    op,
                    partial: false,
                }],
            }];
            list(&store, &opts)
        };

        // "10" < "5" holds byte-wise; numerically it must not
        let below = compare(Op::Lt, "5");
        assert_eq!(below.total, 1);
        assert_eq!(below.items[0].pointer("/metadata/name").unwrap(), "small");

        let above = compare(Op::Gt, "5");
        assert_eq!(above.total, 1);
        assert_eq!(above.items[0].pointer("/metadata/name").unwrap(), "large");

        // rows without the field stay out of either side
        store.upsert(&json!({"metadata": {"name": "bare", "resourceVersion": "3"}}), &[]).unwrap();
        assert_eq!(compare(Op::Lt, "100").total, 2);
    }

    #[test]
    fn unindexed_filter_field_is_rejected() {
        let store = temp_store(&paths(&[&["spec", "nodeName"]]));
        let mut opts = options();
        opts.filters = vec![OrFilter { filters: vec![Filter::eq(&["spec", "madeUp"], "x")] }];
        let err = store
            .list_by_options(&CancellationToken::new(), &opts, &[Partition::all()], None, "1")
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidColumn(_)));
    }

    #[test]
    fn sorts_are_stable_with_id_tiebreak() {
        let store = temp_store(&paths(&[&["spec", "nodeName"]]));
        store.upsert(&pod("ns1", "b", "node-2", 1), &[]).unwrap();
        store.upsert(&pod("ns1", "a", "node-2", 2), &[]).unwrap();
        store.upsert(&pod("ns1", "c", "node-1", 3), &[]).unwrap();

        let mut opts = options();
        opts.sort = vec![Sort { field: vec!["spec".into(), "nodeName".into()], order: SortOrder::Desc }];
        let out = list(&store, &opts);
        let names: Vec<&str> = out.items.iter().map(|o| o.pointer("/metadata/name").unwrap().as_str().unwrap()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn pagination_round_trips_through_the_continue_token() {
        let store = temp_store(&paths(&[&["spec", "nodeName"]]));
        for i in 0..5 {
            store.upsert(&pod("ns1", &format!("p{i}"), "node-1", i + 1), &[]).unwrap();
        }
        let mut opts = options();
        opts.pagination = Pagination { offset: 0, limit: Some(2), continue_token: None };
        let first = list(&store, &opts);
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.total, 5);
        let token = first.continue_token.expect("more pages");

        opts.pagination = Pagination { offset: 0, limit: Some(2), continue_token: Some(token) };
        let second = list(&store, &opts);
        assert_eq!(second.items.len(), 2);
        assert_eq!(second.revision, "100");
        let names: Vec<&str> =
            second.items.iter().map(|o| o.pointer("/metadata/name").unwrap().as_str().unwrap()).collect();
        assert_eq!(names, vec!["p2", "p3"]);

        opts.pagination = Pagination {
            offset: 0,
            limit: Some(2),
            continue_token: second.continue_token.clone(),
        };
        let last = list(&store, &opts);
        assert_eq!(last.items.len(), 1);
        assert!(last.continue_token.is_none());

        let err = store
            .list_by_options(
                &CancellationToken::new(),
                &ListOptions {
                    pagination: Pagination { offset: 0, limit: Some(2), continue_token: Some("!!".into()) },
                    ..ListOptions::default()
                },
                &[Partition::all()],
                None,
                "1",
            )
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidContinueToken(_)));
    }

    #[test]
    fn partitions_restrict_rows() {
        let store = temp_store(&paths(&[&["spec", "nodeName"]]));
        store.upsert(&pod("ns1", "a", "n", 1), &[]).unwrap();
        store.upsert(&pod("ns1", "b", "n", 2), &[]).unwrap();
        store.upsert(&pod("ns2", "c", "n", 3), &[]).unwrap();

        let parts = vec![Partition::names(Some("ns1"), &["a"])];
        let out = store
            .list_by_options(&CancellationToken::new(), &options(), &parts, None, "1")
            .unwrap();
        assert_eq!(out.total, 1);
        assert_eq!(object_id(&out.items[0]), "ns1/a");

        let parts = vec![Partition::names(Some("ns1"), &["a"]), Partition::all_in("ns2")];
        let out = store
            .list_by_options(&CancellationToken::new(), &options(), &parts, None, "1")
            .unwrap();
        assert_eq!(out.total, 2);

        // a namespace argument scopes before partitions
        let out = store
            .list_by_options(&CancellationToken::new(), &options(), &[Partition::all()], Some("ns2"), "1")
            .unwrap();
        assert_eq!(out.total, 1);
    }

    #[test]
    fn derived_columns_update_in_place() {
        let store = temp_store(&paths(&[
            &["metadata", "labels", "field.cattle.io/projectId"],
            &["spec", "displayName"],
        ]));
        let ns = json!({
            "metadata": {
                "name": "team-a",
                "resourceVersion": "5",
                "labels": {"field.cattle.io/projectId": "p-abc123"},
            }
        });
        store.upsert(&ns, &[("spec.displayName".to_string(), None)]).unwrap();

        let changed = store
            .update_derived(
                "spec.displayName",
                Some("Team A"),
                "metadata.labels[field.cattle.io/projectId]",
                "p-abc123",
            )
            .unwrap();
        assert_eq!(changed, 1);

        let mut opts = options();
        opts.filters = vec![OrFilter { filters: vec![Filter::eq(&["spec", "displayName"], "Team A")] }];
        assert_eq!(list(&store, &opts).total, 1);

        let got = store.get_by_field("metadata.name", "team-a").unwrap().unwrap();
        assert_eq!(got.pointer("/metadata/name").unwrap(), "team-a");
    }

    #[test]
    fn cancelled_queries_bail() {
        let store = temp_store(&paths(&[&["spec", "nodeName"]]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = store
            .list_by_options(&cancel, &options(), &[Partition::all()], None, "1")
            .unwrap_err();
        assert!(matches!(err, CacheError::Cancelled));
    }
}
