//! Decides which query shapes go through the request batcher.

use crate::query::{FilterValue, QueryShape};

/// Strategy deciding whether a query is worth batching.
pub trait BatchPolicy: Send + Sync + 'static {
    fn should_batch(&self, shape: &QueryShape) -> bool;
}

/// Batch small point-queries: few selected fields, few filters, at most one
/// ordering clause, and no pattern filters.
#[derive(Debug, Clone)]
pub struct HeuristicBatchPolicy {
    pub max_fields: usize,
    pub max_filters: usize,
    pub max_order_clauses: usize,
}

impl Default for HeuristicBatchPolicy {
    fn default() -> Self {
        Self {
            max_fields: 5,
            max_filters: 2,
            max_order_clauses: 1,
        }
    }
}

impl BatchPolicy for HeuristicBatchPolicy {
    fn should_batch(&self, shape: &QueryShape) -> bool {
        let fields_ok = shape
            .select
            .field_count()
            .is_none_or(|count| count <= self.max_fields);
        let filters_ok = shape.filters.len() <= self.max_filters
            && !shape
                .filters
                .values()
                .any(|f| matches!(f, FilterValue::Like(_)));
        fields_ok && filters_ok && shape.order.len() <= self.max_order_clauses
    }
}

/// Never batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverBatch;

impl BatchPolicy for NeverBatch {
    fn should_batch(&self, _shape: &QueryShape) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Filters, OrderBy, Pagination, Selector, filters};

    fn shape(select: Selector, filters: Filters, order: Vec<OrderBy>) -> QueryShape {
        QueryShape {
            resource: "attendance".to_owned(),
            select,
            filters,
            order,
            window: Pagination::page(1, 50).window(),
        }
    }

    #[test]
    fn test_small_point_query_is_batched() {
        let policy = HeuristicBatchPolicy::default();
        let s = shape(
            Selector::All,
            filters([("class_id", FilterValue::eq("A"))]),
            vec![OrderBy::asc("date")],
        );
        assert!(policy.should_batch(&s));

        let s = shape(
            Selector::columns(["id", "a", "b", "c", "d"]),
            Filters::new(),
            vec![],
        );
        assert!(policy.should_batch(&s));
    }

    #[test]
    fn test_thresholds_reject_wide_queries() {
        let policy = HeuristicBatchPolicy::default();

        let too_many_fields = shape(
            Selector::columns(["id", "a", "b", "c", "d", "e"]),
            Filters::new(),
            vec![],
        );
        assert!(!policy.should_batch(&too_many_fields));

        let too_many_filters = shape(
            Selector::All,
            filters([
                ("a", FilterValue::eq(1)),
                ("b", FilterValue::eq(2)),
                ("c", FilterValue::eq(3)),
            ]),
            vec![],
        );
        assert!(!policy.should_batch(&too_many_filters));

        let too_many_orders = shape(
            Selector::All,
            Filters::new(),
            vec![OrderBy::asc("a"), OrderBy::desc("b")],
        );
        assert!(!policy.should_batch(&too_many_orders));
    }

    #[test]
    fn test_pattern_filters_are_not_batched() {
        let policy = HeuristicBatchPolicy::default();
        let s = shape(
            Selector::All,
            filters([("name", FilterValue::like("%ann%"))]),
            vec![],
        );
        assert!(!policy.should_batch(&s));
    }

    #[test]
    fn test_tuned_policy() {
        let policy = HeuristicBatchPolicy {
            max_fields: 1,
            max_filters: 0,
            max_order_clauses: 0,
        };
        assert!(policy.should_batch(&shape(Selector::columns(["id"]), Filters::new(), vec![])));
        assert!(!policy.should_batch(&shape(
            Selector::All,
            filters([("a", FilterValue::eq(1))]),
            vec![]
        )));
        assert!(!NeverBatch.should_batch(&shape(Selector::All, Filters::new(), vec![])));
    }
}
