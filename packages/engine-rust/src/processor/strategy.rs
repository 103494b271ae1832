//! Aggregation strategies used by split, multicast, recipient lists,
//! enrich, and the aggregator.

use std::sync::Arc;

use switchyard_core::{Exchange, Value};

/// Folds exchanges into one.
///
/// `previous` is `None` for the first exchange of a fold. The returned
/// exchange becomes `previous` for the next call.
pub trait AggregationStrategy: Send + Sync {
    fn aggregate(&self, previous: Option<Exchange>, current: Exchange) -> Exchange;
}

impl<F> AggregationStrategy for F
where
    F: Fn(Option<Exchange>, Exchange) -> Exchange + Send + Sync,
{
    fn aggregate(&self, previous: Option<Exchange>, current: Exchange) -> Exchange {
        self(previous, current)
    }
}

/// A strategy that can be bound in the [`Registry`](crate::registry::Registry)
/// and referenced by name from a route.
#[derive(Clone)]
pub struct SharedStrategy(pub Arc<dyn AggregationStrategy>);

impl SharedStrategy {
    pub fn new(strategy: impl AggregationStrategy + 'static) -> Self {
        Self(Arc::new(strategy))
    }
}

impl AggregationStrategy for SharedStrategy {
    fn aggregate(&self, previous: Option<Exchange>, current: Exchange) -> Exchange {
        self.0.aggregate(previous, current)
    }
}

/// Keeps the most recent exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseLatest;

impl AggregationStrategy for UseLatest {
    fn aggregate(&self, _previous: Option<Exchange>, current: Exchange) -> Exchange {
        current
    }
}

/// Collects bodies into a list body.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupedBodies;

impl AggregationStrategy for GroupedBodies {
    fn aggregate(&self, previous: Option<Exchange>, mut current: Exchange) -> Exchange {
        let body = current.message_mut().take_body();
        match previous {
            None => {
                current.set_body(Value::List(vec![body]));
                current
            }
            Some(mut previous) => {
                match previous.message_mut().take_body() {
                    Value::List(mut items) => {
                        items.push(body);
                        previous.set_body(Value::List(items));
                    }
                    other => previous.set_body(Value::List(vec![other, body])),
                }
                previous
            }
        }
    }
}

/// Concatenates text bodies with a separator.
#[derive(Debug, Clone, Default)]
pub struct StringConcat {
    separator: String,
}

impl StringConcat {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }
}

fn body_text(exchange: &Exchange) -> String {
    exchange
        .body_as::<String>()
        .ok()
        .flatten()
        .unwrap_or_else(|| exchange.body().to_string())
}

impl AggregationStrategy for StringConcat {
    fn aggregate(&self, previous: Option<Exchange>, current: Exchange) -> Exchange {
        let Some(mut previous) = previous else {
            let text = body_text(&current);
            let mut current = current;
            current.set_body(text);
            return current;
        };
        let mut text = body_text(&previous);
        text.push_str(&self.separator);
        text.push_str(&body_text(&current));
        previous.set_body(text);
        previous
    }
}

/// Copies the result of a fold onto the exchange that continues routing,
/// keeping the target's id and pattern.
pub(crate) fn apply_result(target: &mut Exchange, result: Exchange) {
    for (key, value) in result.properties() {
        target.set_property(key.clone(), value.clone());
    }
    if let Some(failure) = result.failure() {
        target.set_failure(failure.clone());
    }
    target.set_message(result.into_message());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testing::exchange;

    fn fold(strategy: &dyn AggregationStrategy, bodies: &[&str]) -> Option<Exchange> {
        bodies.iter().fold(None, |acc, body| {
            Some(strategy.aggregate(acc, exchange(*body)))
        })
    }

    #[test]
    fn string_concat_joins_in_order() {
        let result = fold(&StringConcat::new("@"), &["a", "b", "c"]).unwrap();
        assert_eq!(result.body(), &Value::from("a@b@c"));
    }

    #[test]
    fn grouped_bodies_collects_a_list() {
        let result = fold(&GroupedBodies, &["x", "y"]).unwrap();
        assert_eq!(
            result.body(),
            &Value::List(vec![Value::from("x"), Value::from("y")])
        );
    }

    #[test]
    fn closures_are_strategies() {
        let count = |prev: Option<Exchange>, mut cur: Exchange| {
            let n = prev.and_then(|p| p.body().as_i64()).unwrap_or(0);
            cur.set_body(n + 1);
            cur
        };
        let result = fold(&count, &["a", "b", "c", "d"]).unwrap();
        assert_eq!(result.body(), &Value::Int(4));
    }

    #[test]
    fn apply_result_keeps_target_identity() {
        let mut target = exchange("original");
        let id = target.id().to_string();
        let mut result = exchange("combined");
        result.set_property("merged", true);
        apply_result(&mut target, result);
        assert_eq!(target.id(), id);
        assert_eq!(target.body(), &Value::from("combined"));
        assert_eq!(target.property("merged"), Some(&Value::Bool(true)));
    }
}
