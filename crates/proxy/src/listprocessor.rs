//! URL query parameter parsing into structured list options.
//!
//! Grammar: `filter=<field><op><value>` where op is one of `=`, `!=`, `<`,
//! `>`, `~` (substring); commas inside one parameter are OR legs, repeated
//! parameters AND together. A bare field tests existence, `!field` absence.
//! `sort=[-]field[,...]`, `limit=<n>`, `continue=<token>` and `labelSelector`
//! round out the surface.

use vantage_core::fields::parse_field_path;
use vantage_core::{ApiError, ApiRequest, Filter, ListOptions, Op, OrFilter, Pagination, Sort, SortOrder};

pub fn parse_query(req: &ApiRequest) -> Result<ListOptions, ApiError> {
    let mut opts = ListOptions::default();

    for raw in req.query_params("filter") {
        let mut filters = Vec::new();
        for clause in raw.split(',').filter(|c| !c.is_empty()) {
            filters.push(parse_filter_clause(clause)?);
        }
        if !filters.is_empty() {
            opts.filters.push(OrFilter { filters });
        }
    }

    if let Some(selector) = req.query_param("labelSelector").filter(|s| !s.is_empty()) {
        for group in parse_label_selector(selector)? {
            opts.filters.push(group);
        }
    }

    if let Some(raw) = req.query_param("sort").filter(|s| !s.is_empty()) {
        for key in raw.split(',').filter(|k| !k.is_empty()) {
            let (field, order) = match key.strip_prefix('-') {
                Some(rest) => (rest, SortOrder::Desc),
                None => (key, SortOrder::Asc),
            };
            if field.is_empty() {
                return Err(ApiError::InvalidBodyContent("sort key is empty".to_string()));
            }
            opts.sort.push(Sort { field: parse_field_path(field), order });
        }
    }

    if let Some(raw) = req.query_param("limit") {
        let limit = raw
            .parse::<usize>()
            .map_err(|_| ApiError::InvalidBodyContent(format!("invalid limit {raw:?}")))?;
        if limit > 0 {
            opts.pagination.limit = Some(limit);
        }
    }
    opts.pagination = Pagination {
        continue_token: req.query_param("continue").map(|s| s.to_string()).filter(|s| !s.is_empty()),
        ..opts.pagination
    };

    Ok(opts)
}

fn parse_filter_clause(clause: &str) -> Result<Filter, ApiError> {
    for (token, op, partial) in [
        ("!=", Op::NotEq, false),
        ("~", Op::Eq, true),
        ("=", Op::Eq, false),
        ("<", Op::Lt, false),
        (">", Op::Gt, false),
    ] {
        if let Some(pos) = clause.find(token) {
            let field = &clause[..pos];
            let value = &clause[pos + token.len()..];
            if field.is_empty() {
                return Err(ApiError::InvalidBodyContent(format!("invalid filter {clause:?}")));
            }
            return Ok(Filter {
                field: parse_field_path(field),
                matches: vec![value.to_string()],
                op,
                partial,
            });
        }
    }
    // bare field: existence test, negated with a leading '!'
    let (field, op) = match clause.strip_prefix('!') {
        Some(rest) => (rest, Op::NotExists),
        None => (clause, Op::Exists),
    };
    if field.is_empty() {
        return Err(ApiError::InvalidBodyContent(format!("invalid filter {clause:?}")));
    }
    Ok(Filter { field: parse_field_path(field), matches: Vec::new(), op, partial: false })
}

/// Translate a label selector into filter groups over `metadata.labels`.
/// Each comma-separated requirement becomes one AND leg.
fn parse_label_selector(selector: &str) -> Result<Vec<OrFilter>, ApiError> {
    let mut groups = Vec::new();
    for requirement in split_requirements(selector) {
        let requirement = requirement.trim();
        if requirement.is_empty() {
            continue;
        }
        groups.push(OrFilter { filters: vec![parse_requirement(requirement)?] });
    }
    Ok(groups)
}

/// Split on commas that are not inside an `in (...)` value set.
fn split_requirements(selector: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in selector.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => {
                out.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn label_field(key: &str) -> Vec<String> {
    vec!["metadata".to_string(), "labels".to_string(), key.to_string()]
}

fn parse_requirement(req: &str) -> Result<Filter, ApiError> {
    for (token, op) in [(" notin ", Op::NotIn), (" in ", Op::In)] {
        if let Some(pos) = req.find(token) {
            let key = req[..pos].trim();
            let values = req[pos + token.len()..].trim();
            let values = values
                .strip_prefix('(')
                .and_then(|v| v.strip_suffix(')'))
                .ok_or_else(|| ApiError::InvalidBodyContent(format!("invalid selector {req:?}")))?;
            let matches: Vec<String> = values
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            if key.is_empty() {
                return Err(ApiError::InvalidBodyContent(format!("invalid selector {req:?}")));
            }
            if matches.is_empty() && op == Op::In {
                // a requirement that can never match short-circuits the query
                return Err(ApiError::NoContent);
            }
            return Ok(Filter { field: label_field(key), matches, op, partial: false });
        }
    }
    for (token, op) in [("!=", Op::NotEq), ("==", Op::Eq), ("=", Op::Eq)] {
        if let Some(pos) = req.find(token) {
            let key = req[..pos].trim();
            let value = req[pos + token.len()..].trim();
            if key.is_empty() {
                return Err(ApiError::InvalidBodyContent(format!("invalid selector {req:?}")));
            }
            return Ok(Filter {
                field: label_field(key),
                matches: vec![value.to_string()],
                op,
                partial: false,
            });
        }
    }
    let (key, op) = match req.strip_prefix('!') {
        Some(rest) => (rest.trim(), Op::NotExists),
        None => (req, Op::Exists),
    };
    if key.is_empty() {
        return Err(ApiError::InvalidBodyContent(format!("invalid selector {req:?}")));
    }
    Ok(Filter { field: label_field(key), matches: Vec::new(), op, partial: false })
}
