//! Query model shared by the cache, the batcher and the backing store.
//!
//! A query is described by its resource, selector, filters, ordering and
//! pagination window. [`QueryShape::cache_key`] turns that description into
//! a stable string so two logically identical queries always share a cache
//! entry.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A single row returned by the backing store.
pub type Row = serde_json::Map<String, Value>;

/// Filters keyed by column. `BTreeMap` keeps column order stable.
pub type Filters = BTreeMap<String, FilterValue>;

/// Filter applied to one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterValue {
    /// Column equals the value
    Eq(Value),
    /// Column is one of the values
    In(Vec<Value>),
    /// Column is null
    IsNull,
    /// Case-insensitive pattern match, `%` matches any run and `_` one character
    Like(String),
}

impl FilterValue {
    pub fn eq(value: impl Into<Value>) -> Self {
        Self::Eq(value.into())
    }

    pub fn any_of<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Self::In(values.into_iter().map(Into::into).collect())
    }

    pub fn like(pattern: impl Into<String>) -> Self {
        Self::Like(pattern.into())
    }

    /// Whether several requests using this filter may be merged into one
    /// set-membership query.
    pub fn is_combinable(&self) -> bool {
        matches!(self, Self::Eq(_) | Self::In(_))
    }

    /// Values a combinable filter admits. Empty for null tests and patterns.
    pub fn values(&self) -> &[Value] {
        match self {
            Self::Eq(v) => std::slice::from_ref(v),
            Self::In(vs) => vs,
            Self::IsNull | Self::Like(_) => &[],
        }
    }

    /// Test a row field against this filter. A missing field counts as null.
    pub fn matches(&self, field: Option<&Value>) -> bool {
        let field = field.unwrap_or(&Value::Null);
        match self {
            Self::Eq(v) => field == v,
            Self::In(vs) => vs.iter().any(|v| v == field),
            Self::IsNull => field.is_null(),
            Self::Like(pattern) => match field {
                Value::String(s) => like_match(pattern, s),
                Value::Null => false,
                other => like_match(pattern, &other.to_string()),
            },
        }
    }

    fn canonical(&self) -> String {
        match self {
            Self::Eq(v) => format!("eq.{}", v),
            Self::In(vs) => {
                let mut rendered: Vec<String> = vs.iter().map(Value::to_string).collect();
                rendered.sort();
                rendered.dedup();
                format!("in.({})", rendered.join(","))
            }
            Self::IsNull => "is.null".to_owned(),
            Self::Like(p) => format!("ilike.{}", p),
        }
    }
}

/// Build a filter map from `(column, filter)` pairs.
pub fn filters<I, K>(pairs: I) -> Filters
where
    I: IntoIterator<Item = (K, FilterValue)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Case-insensitive SQL-style pattern match.
fn like_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();

    // matched[j]: pattern[..i] matches text[..j]
    let mut matched = vec![false; text.len() + 1];
    matched[0] = true;
    for &p in &pattern {
        let mut next = vec![false; text.len() + 1];
        match p {
            '%' => {
                let mut seen = false;
                for j in 0..=text.len() {
                    seen |= matched[j];
                    next[j] = seen;
                }
            }
            '_' => {
                for j in 1..=text.len() {
                    next[j] = matched[j - 1];
                }
            }
            c => {
                for j in 1..=text.len() {
                    next[j] = matched[j - 1] && text[j - 1] == c;
                }
            }
        }
        matched = next;
    }
    matched[text.len()]
}

/// Columns to select.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Selector {
    #[default]
    All,
    Columns(Vec<String>),
}

impl Selector {
    /// Parse a comma-separated column list; `*` or an empty string select all.
    pub fn parse(select: &str) -> Self {
        let columns: Vec<String> = select
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_owned)
            .collect();
        if columns.is_empty() || columns.iter().any(|c| c == "*") {
            Self::All
        } else {
            Self::Columns(columns)
        }
    }

    pub fn columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Columns(columns.into_iter().map(Into::into).collect())
    }

    /// Number of named columns, `None` for all fields.
    pub fn field_count(&self) -> Option<usize> {
        match self {
            Self::All => None,
            Self::Columns(cols) => Some(cols.len()),
        }
    }

    pub fn includes(&self, column: &str) -> bool {
        match self {
            Self::All => true,
            Self::Columns(cols) => cols.iter().any(|c| c == column),
        }
    }

    /// Selector extended with any of `extra` it does not already include.
    pub fn with_columns<'a>(&self, extra: impl IntoIterator<Item = &'a String>) -> Self {
        match self {
            Self::All => Self::All,
            Self::Columns(cols) => {
                let mut cols = cols.clone();
                for column in extra {
                    if !cols.contains(column) {
                        cols.push(column.clone());
                    }
                }
                Self::Columns(cols)
            }
        }
    }

    /// Keep only the selected columns of a row.
    pub fn project(&self, row: Row) -> Row {
        match self {
            Self::All => row,
            Self::Columns(_) => row.into_iter().filter(|(k, _)| self.includes(k)).collect(),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Columns(cols) => f.write_str(&cols.join(",")),
        }
    }
}

/// One ordering clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }
}

/// Total order over JSON values used for client-side sorting.
/// Nulls sort first, then booleans, numbers, strings, arrays, objects.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ if rank(a) == rank(b) => a.to_string().cmp(&b.to_string()),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Sort rows in place by the ordering clauses, first clause most significant.
pub fn sort_rows(rows: &mut [Row], order: &[OrderBy]) {
    if order.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for clause in order {
            let left = a.get(&clause.column).unwrap_or(&Value::Null);
            let right = b.get(&clause.column).unwrap_or(&Value::Null);
            let ord = compare_values(left, right);
            let ord = if clause.ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// Offset/limit range over a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub offset: usize,
    pub limit: usize,
}

impl Window {
    /// Slice an unpaginated result set down to this window.
    pub fn apply(&self, rows: Vec<Row>) -> Vec<Row> {
        rows.into_iter().skip(self.offset).take(self.limit).collect()
    }
}

/// Pagination requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    /// 1-based page number and page size
    Page { page: usize, page_size: usize },
    /// Explicit offset and limit
    Range { offset: usize, limit: usize },
}

impl Pagination {
    pub fn page(page: usize, page_size: usize) -> Self {
        Self::Page { page, page_size }
    }

    pub fn range(offset: usize, limit: usize) -> Self {
        Self::Range { offset, limit }
    }

    pub fn window(&self) -> Window {
        match *self {
            Self::Page { page, page_size } => {
                let page_size = page_size.max(1);
                Window {
                    offset: (page.max(1) - 1).saturating_mul(page_size),
                    limit: page_size,
                }
            }
            Self::Range { offset, limit } => Window {
                offset,
                limit: limit.max(1),
            },
        }
    }

    /// 1-based page the window starts on.
    pub fn page_number(&self) -> usize {
        let window = self.window();
        (window.offset / window.limit).saturating_add(1)
    }

    pub fn page_size(&self) -> usize {
        self.window().limit
    }
}

/// Everything that determines a query's result.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryShape {
    pub resource: String,
    pub select: Selector,
    pub filters: Filters,
    pub order: Vec<OrderBy>,
    pub window: Window,
}

impl QueryShape {
    /// Deterministic cache key for this shape.
    ///
    /// Filter columns come out sorted, `In` lists are sorted and deduplicated,
    /// and nested objects render with sorted keys.
    pub fn cache_key(&self) -> String {
        let filters: Vec<String> = self
            .filters
            .iter()
            .map(|(column, filter)| format!("{}={}", column, filter.canonical()))
            .collect();
        let order: Vec<String> = self
            .order
            .iter()
            .map(|o| format!("{}.{}", o.column, if o.ascending { "asc" } else { "desc" }))
            .collect();
        format!(
            "{}|{}|{}|{}|{}+{}",
            self.resource,
            self.select,
            filters.join("&"),
            order.join(","),
            self.window.offset,
            self.window.limit
        )
    }

    /// Query fetching the shape's page directly from the backing store.
    pub fn to_select_query(&self) -> SelectQuery {
        SelectQuery::new(&self.resource)
            .select(self.select.clone())
            .filters(self.filters.clone())
            .order(self.order.clone())
            .range(self.window)
            .with_count()
    }
}

/// A read against the backing store.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub resource: String,
    pub select: Selector,
    pub filters: Filters,
    pub order: Vec<OrderBy>,
    pub range: Option<Window>,
    /// Ask the store for the exact number of matching rows
    pub count: bool,
}

impl SelectQuery {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            select: Selector::All,
            filters: Filters::new(),
            order: Vec::new(),
            range: None,
            count: false,
        }
    }

    pub fn select(mut self, select: Selector) -> Self {
        self.select = select;
        self
    }

    pub fn filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    pub fn filter(mut self, column: impl Into<String>, filter: FilterValue) -> Self {
        self.filters.insert(column.into(), filter);
        self
    }

    pub fn order(mut self, order: Vec<OrderBy>) -> Self {
        self.order = order;
        self
    }

    pub fn range(mut self, window: Window) -> Self {
        self.range = Some(window);
        self
    }

    pub fn with_count(mut self) -> Self {
        self.count = true;
        self
    }

    /// Whether a row satisfies every filter of this query.
    pub fn matches(&self, row: &Row) -> bool {
        self.filters
            .iter()
            .all(|(column, filter)| filter.matches(row.get(column)))
    }
}

/// Rows returned by a select, with the exact match count when requested.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    pub rows: Vec<Row>,
    pub count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn shape(filters: Filters) -> QueryShape {
        QueryShape {
            resource: "students".to_owned(),
            select: Selector::All,
            filters,
            order: vec![OrderBy::asc("name")],
            window: Pagination::page(1, 50).window(),
        }
    }

    #[test]
    fn test_cache_key_is_independent_of_insertion_order() {
        let mut a = Filters::new();
        a.insert("class_id".to_owned(), FilterValue::eq("A"));
        a.insert("active".to_owned(), FilterValue::eq(true));

        let mut b = Filters::new();
        b.insert("active".to_owned(), FilterValue::eq(true));
        b.insert("class_id".to_owned(), FilterValue::eq("A"));

        assert_eq!(shape(a).cache_key(), shape(b).cache_key());
    }

    #[test]
    fn test_cache_key_canonicalizes_in_lists() {
        let a = filters([("class_id", FilterValue::any_of(["B", "A", "B"]))]);
        let b = filters([("class_id", FilterValue::any_of(["A", "B"]))]);
        assert_eq!(shape(a).cache_key(), shape(b).cache_key());
    }

    #[test]
    fn test_cache_key_sorts_nested_objects() {
        let a = filters([("meta", FilterValue::eq(json!({"b": 1, "a": 2})))]);
        let b = filters([("meta", FilterValue::eq(json!({"a": 2, "b": 1})))]);
        assert_eq!(shape(a).cache_key(), shape(b).cache_key());
    }

    #[test]
    fn test_cache_key_distinguishes_values_and_windows() {
        let a = shape(filters([("class_id", FilterValue::eq("A"))]));
        let b = shape(filters([("class_id", FilterValue::eq("B"))]));
        assert_ne!(a.cache_key(), b.cache_key());

        let mut c = a.clone();
        c.window = Pagination::page(2, 50).window();
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn test_pagination_window() {
        assert_eq!(
            Pagination::page(3, 20).window(),
            Window {
                offset: 40,
                limit: 20
            }
        );
        assert_eq!(Pagination::page(0, 20).window().offset, 0);
        assert_eq!(Pagination::range(45, 15).page_number(), 4);
        assert_eq!(Pagination::range(0, 0).page_size(), 1);
    }

    #[test]
    fn test_pagination_window_saturates() {
        assert_eq!(Pagination::page(usize::MAX / 2, 4).window().offset, usize::MAX);
        assert_eq!(Pagination::page(usize::MAX, usize::MAX).window().offset, usize::MAX);
        assert_eq!(Pagination::range(usize::MAX, 1).page_number(), usize::MAX);
        assert!(
            Pagination::page(usize::MAX / 2, 4)
                .window()
                .apply(vec![Row::new()])
                .is_empty()
        );
    }

    #[test]
    fn test_selector_parse() {
        assert_eq!(Selector::parse("*"), Selector::All);
        assert_eq!(Selector::parse(""), Selector::All);
        assert_eq!(
            Selector::parse("id, name ,class_id"),
            Selector::columns(["id", "name", "class_id"])
        );
        assert_eq!(Selector::parse("id,name").to_string(), "id,name");
    }

    #[test]
    fn test_selector_project_and_extend() {
        let select = Selector::columns(["id"]);
        let extended = select.with_columns(&["class_id".to_owned(), "id".to_owned()]);
        assert_eq!(extended, Selector::columns(["id", "class_id"]));

        let projected = select.project(row(json!({"id": 1, "class_id": "A"})));
        assert_eq!(Value::Object(projected), json!({"id": 1}));
    }

    #[test]
    fn test_filter_matching() {
        assert!(FilterValue::eq("A").matches(Some(&json!("A"))));
        assert!(!FilterValue::eq("A").matches(Some(&json!("B"))));
        assert!(FilterValue::any_of([1, 2]).matches(Some(&json!(2))));
        assert!(FilterValue::IsNull.matches(None));
        assert!(FilterValue::IsNull.matches(Some(&Value::Null)));
        assert!(FilterValue::like("%ali%").matches(Some(&json!("Natalie"))));
        assert!(FilterValue::like("b_b").matches(Some(&json!("BOB"))));
        assert!(!FilterValue::like("b_b").matches(Some(&json!("bobby"))));
        assert!(!FilterValue::like("%x%").matches(None));
    }

    #[test]
    fn test_sort_rows_multiple_clauses() {
        let mut rows = vec![
            row(json!({"grade": 2, "name": "b"})),
            row(json!({"grade": 1, "name": "z"})),
            row(json!({"grade": 2, "name": "a"})),
            row(json!({"name": "n"})),
        ];
        sort_rows(&mut rows, &[OrderBy::desc("grade"), OrderBy::asc("name")]);
        let names: Vec<&str> = rows.iter().map(|r| r["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["a", "b", "z", "n"]);
    }
}
