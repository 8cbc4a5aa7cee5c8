//! In-process evaluation of a `QueryInfo`

use serde_json::Value;

use crate::errors::RepoResult;
use crate::expression::values::values_equal;
use crate::expression::{
    compile, compile_comparator, compile_predicate, CompiledComparator, CompiledExpression,
    CompiledPredicate,
};

use super::info::QueryInfo;

/// Predicate, order, paging, projection and distinct of one query, compiled once
#[derive(Clone, Debug)]
pub struct CompiledQuery {
    predicate: Option<CompiledPredicate>,
    comparator: CompiledComparator,
    projection: Option<CompiledExpression>,
    skip: usize,
    limit: Option<usize>,
    distinct: bool,
}

impl CompiledQuery {
    pub fn new(info: &QueryInfo) -> RepoResult<Self> {
        Ok(Self {
            predicate: info.predicate.as_ref().map(compile_predicate).transpose()?,
            comparator: compile_comparator(info.sorting.iter().map(|s| (&s.expression, s.ascending)))?,
            projection: info.projection.as_ref().map(compile).transpose()?,
            skip: info.skip.unwrap_or(0) as usize,
            limit: info.limit.map(|l| l as usize),
            distinct: info.distinct,
        })
    }

    /// True if the entity passes the predicate
    pub fn matches(&self, entity: &Value) -> RepoResult<bool> {
        match &self.predicate {
            Some(predicate) => Ok(predicate.test(entity)?),
            None => Ok(true),
        }
    }

    /// Filter, sort, page, project and deduplicate
    pub fn run<'a>(&self, entities: impl IntoIterator<Item = &'a Value>) -> RepoResult<Vec<Value>> {
        let mut rows = Vec::new();
        for entity in entities {
            if self.matches(entity)? {
                rows.push(entity.clone());
            }
        }
        self.comparator.sort(&mut rows)?;

        let mut out: Vec<Value> = Vec::new();
        for row in rows.into_iter().skip(self.skip) {
            if self.limit.is_some_and(|limit| out.len() >= limit) {
                break;
            }
            let value = match &self.projection {
                Some(projection) => projection.evaluate(&row)?,
                None => row,
            };
            if self.distinct && out.iter().any(|seen| values_equal(seen, &value)) {
                continue;
            }
            out.push(value);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{Expression, ValueType};
    use crate::query::SortingInfo;
    use serde_json::json;

    fn text() -> Expression {
        Expression::entity("Product").property("text", ValueType::String)
    }

    #[test]
    fn test_sort_by_text_ignores_other_fields() {
        let info = QueryInfo::new("Product", ValueType::String)
            .with_sorting(vec![SortingInfo::new(text(), true)]);
        let entities = vec![json!({"text": "b", "number": 1}), json!({"text": "a", "number": 2})];

        let rows = CompiledQuery::new(&info).unwrap().run(&entities).unwrap();
        assert_eq!(rows[0]["text"], "a");
        assert_eq!(rows[1]["text"], "b");
    }

    #[test]
    fn test_distinct_projection() {
        let info = QueryInfo::new("Product", ValueType::String)
            .with_projection(Some(text()))
            .with_distinct(true);
        let entities = vec![json!({"text": "a"}), json!({"text": "a"}), json!({"text": "b"})];

        let rows = CompiledQuery::new(&info).unwrap().run(&entities).unwrap();
        assert_eq!(rows, vec![json!("a"), json!("b")]);
    }
}
