//! Tenant-pinned view over the data-access service
//!
//! Every read through a [`TenantScope`] is filtered to one tenant, every
//! inserted record is stamped with it, and every cache entry it creates
//! carries the tenant tag so the tenant's cached data can be dropped at once.

use serde_json::Value;

use crate::api_service::{
    BulkInsertOptions, MutationResponse, OptimizedApiService, QueryOptions, QueryResponse, id_tag,
};
use crate::cache_manager::Invalidation;
use crate::query::{FilterValue, Row};

/// Service handle bound to one tenant.
#[derive(Clone)]
pub struct TenantScope {
    service: OptimizedApiService,
    column: String,
    tenant_id: Value,
    tag: String,
}

impl TenantScope {
    pub fn new(
        service: OptimizedApiService,
        tenant_column: impl Into<String>,
        tenant_id: impl Into<Value>,
    ) -> Self {
        let tenant_id = tenant_id.into();
        let tag = id_tag("tenant", &tenant_id);
        Self {
            service,
            column: tenant_column.into(),
            tenant_id,
            tag,
        }
    }

    pub fn tenant_id(&self) -> &Value {
        &self.tenant_id
    }

    /// Cache tag carried by this tenant's entries
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn service(&self) -> &OptimizedApiService {
        &self.service
    }

    pub async fn query(&self, resource: &str, options: QueryOptions) -> QueryResponse {
        self.service.query(resource, self.pin(options)).await
    }

    pub async fn search(
        &self,
        resource: &str,
        column: &str,
        term: &str,
        options: QueryOptions,
    ) -> QueryResponse {
        self.service
            .search(resource, column, term, self.pin(options))
            .await
    }

    /// Insert records owned by this tenant. A tenant value already present on
    /// a record is overwritten.
    pub async fn bulk_insert(
        &self,
        resource: &str,
        mut records: Vec<Row>,
        options: BulkInsertOptions,
    ) -> MutationResponse {
        for record in &mut records {
            record.insert(self.column.clone(), self.tenant_id.clone());
        }
        self.service.bulk_insert(resource, records, options).await
    }

    /// Drop every cache entry created through this tenant.
    pub async fn invalidate_tenant(&self) -> usize {
        self.service
            .invalidate_cache(Invalidation::tags([self.tag.as_str()]))
            .await
    }

    fn pin(&self, options: QueryOptions) -> QueryOptions {
        options
            .filter(&self.column, FilterValue::Eq(self.tenant_id.clone()))
            .tag(&self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackingStore;
    use crate::test_support::{MockStore, row};
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> Arc<MockStore> {
        Arc::new(MockStore::new().with_rows(
            "classes",
            vec![
                json!({"id": 1, "name": "Algebra", "school_id": "north"}),
                json!({"id": 2, "name": "Biology", "school_id": "south"}),
                json!({"id": 3, "name": "Analysis", "school_id": "north"}),
            ],
        ))
    }

    fn scope(store: &Arc<MockStore>, tenant: &str) -> TenantScope {
        let backing: Arc<dyn BackingStore> = store.clone();
        TenantScope::new(OptimizedApiService::new(backing), "school_id", tenant)
    }

    fn ids(response: &QueryResponse) -> Vec<i64> {
        response
            .data
            .iter()
            .filter_map(|r| r["id"].as_i64())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_are_pinned_to_tenant() {
        let store = store();
        let north = scope(&store, "north");

        let all = north.query("classes", QueryOptions::default()).await;
        assert_eq!(ids(&all), vec![1, 3]);

        // A caller-supplied tenant filter cannot escape the scope
        let escaped = north
            .query(
                "classes",
                QueryOptions::default().filter("school_id", FilterValue::eq("south")),
            )
            .await;
        assert_eq!(ids(&escaped), vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_is_pinned_to_tenant() {
        let store = store();
        let south = scope(&store, "south");

        let found = south
            .search("classes", "name", "a", QueryOptions::default())
            .await;
        assert!(found.data.is_empty());

        let found = south
            .search("classes", "name", "bio", QueryOptions::default())
            .await;
        assert_eq!(ids(&found), vec![2]);
        assert_eq!(
            store.selects()[0].filters["school_id"],
            FilterValue::eq("south")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_insert_stamps_tenant() {
        let store = store();
        let north = scope(&store, "north");

        let response = north
            .bulk_insert(
                "classes",
                vec![
                    row(json!({"id": 4, "name": "Chemistry"})),
                    row(json!({"id": 5, "name": "Drama", "school_id": "south"})),
                ],
                BulkInsertOptions::default(),
            )
            .await;

        assert!(response.success);
        let table = store.table("classes");
        assert!(
            table[3..]
                .iter()
                .all(|r| r["school_id"] == json!("north"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_tenant_leaves_other_tenants() {
        let store = store();
        let backing: Arc<dyn BackingStore> = store.clone();
        let service = OptimizedApiService::new(backing);
        let north = TenantScope::new(service.clone(), "school_id", "north");
        let south = TenantScope::new(service.clone(), "school_id", "south");

        north.query("classes", QueryOptions::default()).await;
        south.query("classes", QueryOptions::default()).await;
        assert_eq!(north.tag(), "tenant:north");

        assert_eq!(north.invalidate_tenant().await, 1);
        assert_eq!(service.stats().await.size, 1);
    }
}
