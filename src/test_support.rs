//! In-process backing store used by the unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::Instant;

use crate::backend::BackingStore;
use crate::error::StoreError;
use crate::query::{QueryRows, Row, SelectQuery, sort_rows};

pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Table-backed store that records every select it serves.
#[derive(Default)]
pub struct MockStore {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    selects: Mutex<Vec<(Instant, SelectQuery)>>,
    inserts: AtomicUsize,
    fail_selects: Mutex<Option<String>>,
    fail_insert_after: Mutex<Option<usize>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, resource: &str, rows: Vec<Value>) -> Self {
        self.tables
            .lock()
            .unwrap()
            .insert(resource.to_owned(), rows.into_iter().map(row).collect());
        self
    }

    /// Fail every select with this message.
    pub fn fail_selects(&self, message: &str) {
        *self.fail_selects.lock().unwrap() = Some(message.to_owned());
    }

    /// Let `n` insert calls succeed and fail the rest.
    pub fn fail_inserts_after(&self, n: usize) {
        *self.fail_insert_after.lock().unwrap() = Some(n);
    }

    pub fn selects(&self) -> Vec<SelectQuery> {
        self.selects
            .lock()
            .unwrap()
            .iter()
            .map(|(_, q)| q.clone())
            .collect()
    }

    pub fn select_times(&self) -> Vec<Instant> {
        self.selects.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn select_count(&self) -> usize {
        self.selects.lock().unwrap().len()
    }

    pub fn insert_calls(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn table(&self, resource: &str) -> Vec<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BackingStore for MockStore {
    async fn select(&self, query: &SelectQuery) -> Result<QueryRows, StoreError> {
        self.selects
            .lock()
            .unwrap()
            .push((Instant::now(), query.clone()));
        if let Some(message) = self.fail_selects.lock().unwrap().clone() {
            return Err(StoreError::query(&query.resource, message));
        }

        let mut rows: Vec<Row> = self
            .table(&query.resource)
            .into_iter()
            .filter(|r| query.matches(r))
            .collect();
        sort_rows(&mut rows, &query.order);
        let count = query.count.then_some(rows.len() as u64);
        if let Some(window) = query.range {
            rows = window.apply(rows);
        }
        let rows = rows.into_iter().map(|r| query.select.project(r)).collect();
        Ok(QueryRows { rows, count })
    }

    async fn insert(&self, resource: &str, records: &[Row]) -> Result<Vec<Row>, StoreError> {
        let call = self.inserts.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = *self.fail_insert_after.lock().unwrap()
            && call >= limit
        {
            return Err(StoreError::mutation(resource, "insert rejected"));
        }
        self.tables
            .lock()
            .unwrap()
            .entry(resource.to_owned())
            .or_default()
            .extend(records.iter().cloned());
        Ok(records.to_vec())
    }

    async fn update(
        &self,
        resource: &str,
        id: &Value,
        changes: &Row,
    ) -> Result<Vec<Row>, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let mut updated = Vec::new();
        for r in tables.entry(resource.to_owned()).or_default().iter_mut() {
            if r.get("id") == Some(id) {
                for (k, v) in changes {
                    r.insert(k.clone(), v.clone());
                }
                updated.push(r.clone());
            }
        }
        if updated.is_empty() {
            return Err(StoreError::mutation(resource, "no such row"));
        }
        Ok(updated)
    }

    async fn delete(&self, resource: &str, id: &Value) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(rows) = tables.get_mut(resource) {
            rows.retain(|r| r.get("id") != Some(id));
        }
        Ok(())
    }
}
