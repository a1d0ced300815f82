//! Functions shipped with the `tvfpool` binary.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{Evaluation, FunctionError, FunctionRegistry, Step};

pub fn builtin_registry() -> FunctionRegistry {
    FunctionRegistry::new()
        .with("echo", || Box::new(Echo) as Box<dyn Evaluation>)
        .with("range", || Box::new(Range::default()) as Box<dyn Evaluation>)
        .with("accumulate", || {
            Box::new(Accumulate::default()) as Box<dyn Evaluation>
        })
        .with("sleep", || Box::new(Sleep) as Box<dyn Evaluation>)
        .with("fail", || Box::new(Fail) as Box<dyn Evaluation>)
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: serde_json::Value) -> Result<T, FunctionError> {
    // Absent params behave like an empty object so every field can default.
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| FunctionError::invalid_params(e.to_string()))
}

/// Finishes immediately with its params.
struct Echo;

#[async_trait]
impl Evaluation for Echo {
    async fn step(
        &mut self,
        _method: &str,
        params: serde_json::Value,
    ) -> Result<Step, FunctionError> {
        Ok(Step::Finish(params))
    }
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    #[serde(default)]
    start: i64,
    stop: i64,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
}

fn default_batch_size() -> usize {
    100
}

/// Emits `start..stop` as rows, `batch_size` rows per step.
#[derive(Default)]
struct Range {
    cursor: Option<(i64, i64, usize)>,
}

#[async_trait]
impl Evaluation for Range {
    async fn step(&mut self, method: &str, params: serde_json::Value) -> Result<Step, FunctionError> {
        let (next, stop, batch_size) = match (self.cursor, method) {
            (None, "open" | "next") => {
                let p: RangeParams = parse_params(params)?;
                if p.batch_size == 0 {
                    return Err(FunctionError::invalid_params("batch_size must be positive"));
                }
                (p.start, p.stop, p.batch_size)
            }
            (Some(cursor), "next") => cursor,
            _ => return Err(FunctionError::unknown_method("range", method)),
        };

        let end = next.saturating_add(batch_size as i64).min(stop).max(next);
        let rows: Vec<serde_json::Value> = (next..end).map(|v| json!({ "value": v })).collect();
        let payload = json!({ "rows": rows });

        if end >= stop {
            self.cursor = Some((stop, stop, batch_size));
            Ok(Step::Finish(payload))
        } else {
            self.cursor = Some((end, stop, batch_size));
            Ok(Step::Partial(payload))
        }
    }
}

#[derive(Debug, Deserialize)]
struct AddParams {
    value: f64,
}

/// Running sum: `add` steps return the running total, `total` finishes.
#[derive(Default)]
struct Accumulate {
    total: f64,
    count: u64,
}

#[async_trait]
impl Evaluation for Accumulate {
    async fn step(&mut self, method: &str, params: serde_json::Value) -> Result<Step, FunctionError> {
        match method {
            "add" => {
                let p: AddParams = parse_params(params)?;
                self.total += p.value;
                self.count += 1;
                Ok(Step::Partial(json!({ "total": self.total })))
            }
            "total" => Ok(Step::Finish(json!({
                "total": self.total,
                "count": self.count,
            }))),
            other => Err(FunctionError::unknown_method("accumulate", other)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SleepParams {
    #[serde(default)]
    millis: u64,
}

/// Waits, then finishes with the waited time.
struct Sleep;

#[async_trait]
impl Evaluation for Sleep {
    async fn step(
        &mut self,
        _method: &str,
        params: serde_json::Value,
    ) -> Result<Step, FunctionError> {
        let p: SleepParams = parse_params(params)?;
        tokio::time::sleep(Duration::from_millis(p.millis)).await;
        Ok(Step::Finish(json!({ "slept_ms": p.millis })))
    }
}

#[derive(Debug, Deserialize)]
struct FailParams {
    #[serde(default = "default_failure")]
    message: String,
}

fn default_failure() -> String {
    "requested failure".to_string()
}

struct Fail;

#[async_trait]
impl Evaluation for Fail {
    async fn step(
        &mut self,
        _method: &str,
        params: serde_json::Value,
    ) -> Result<Step, FunctionError> {
        let p: FailParams = parse_params(params)?;
        Err(FunctionError::Failed(p.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn range_batches_until_exhausted() {
        let mut range = builtin_registry().resolve("range").unwrap();

        let first = range
            .step("open", json!({"start": 0, "stop": 5, "batch_size": 2}))
            .await
            .unwrap();
        assert_eq!(
            first,
            Step::Partial(json!({"rows": [{"value": 0}, {"value": 1}]}))
        );

        let second = range.step("next", json!(null)).await.unwrap();
        assert!(matches!(second, Step::Partial(_)));

        let last = range.step("next", json!(null)).await.unwrap();
        assert_eq!(last, Step::Finish(json!({"rows": [{"value": 4}]})));
    }

    #[tokio::test]
    async fn empty_range_finishes_at_once() {
        let mut range = builtin_registry().resolve("range").unwrap();
        let step = range.step("open", json!({"start": 3, "stop": 3})).await.unwrap();
        assert_eq!(step, Step::Finish(json!({"rows": []})));
    }

    #[tokio::test]
    async fn range_rejects_unknown_method_and_bad_params() {
        let mut range = builtin_registry().resolve("range").unwrap();
        assert_eq!(
            range.step("rewind", json!({"stop": 1})).await,
            Err(FunctionError::unknown_method("range", "rewind"))
        );

        let mut range = builtin_registry().resolve("range").unwrap();
        assert!(matches!(
            range.step("open", json!({"start": 1})).await,
            Err(FunctionError::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn accumulate_sums_across_steps() {
        let mut acc = builtin_registry().resolve("accumulate").unwrap();
        acc.step("add", json!({"value": 1.5})).await.unwrap();
        let partial = acc.step("add", json!({"value": 2.5})).await.unwrap();
        assert_eq!(partial, Step::Partial(json!({"total": 4.0})));

        let done = acc.step("total", json!(null)).await.unwrap();
        assert_eq!(done, Step::Finish(json!({"total": 4.0, "count": 2})));
    }

    #[tokio::test]
    async fn echo_and_fail() {
        let registry = builtin_registry();
        let mut echo = registry.resolve("echo").unwrap();
        assert_eq!(
            echo.step("call", json!({"a": 1})).await,
            Ok(Step::Finish(json!({"a": 1})))
        );

        let mut fail = registry.resolve("fail").unwrap();
        assert_eq!(
            fail.step("call", json!({"message": "nope"})).await,
            Err(FunctionError::Failed("nope".to_string()))
        );
    }
}
