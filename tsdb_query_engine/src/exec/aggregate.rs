use serde::Deserialize;
use serde_json::Value;

use crate::{value, ErrorKind};

/// The aggregate functions the engine can split into partial and merge phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Mean,
}

impl AggregateFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        // A match statement seems like the right thing to do, but it means forcing the
        // string to lowercase first. This allows the comparison to stay allocation-free.
        if name.eq_ignore_ascii_case("count") {
            Some(Self::Count)
        } else if name.eq_ignore_ascii_case("sum") {
            Some(Self::Sum)
        } else if name.eq_ignore_ascii_case("min") {
            Some(Self::Min)
        } else if name.eq_ignore_ascii_case("max") {
            Some(Self::Max)
        } else if name.eq_ignore_ascii_case("mean") || name.eq_ignore_ascii_case("avg") {
            Some(Self::Mean)
        } else {
            None
        }
    }

    pub fn accumulator(&self) -> Accumulator {
        match self {
            Self::Count => Accumulator::Count { count: 0 },
            Self::Sum => Accumulator::Sum { sum: 0.0 },
            Self::Min => Accumulator::Min { min: None, count: 0 },
            Self::Max => Accumulator::Max { max: None, count: 0 },
            Self::Mean => Accumulator::Mean { sum: 0.0, count: 0 },
        }
    }
}

/// Per-group aggregation state.
///
/// An accumulator is fed row-by-row on a shard ([`update`](Accumulator::update)), shipped
/// between nodes as a JSON state value ([`state`](Accumulator::state)), combined on the
/// coordinator ([`merge`](Accumulator::merge)), and finalized to a scalar. Merge is
/// associative and commutative, so shard arrival order doesn't affect results.
#[derive(Clone, Debug)]
pub enum Accumulator {
    Count { count: u64 },
    Sum { sum: f64 },
    Mean { sum: f64, count: u64 },
    Min { min: Option<Value>, count: u64 },
    Max { max: Option<Value>, count: u64 },
}

impl Accumulator {
    /// Folds one input row's argument values into the accumulator.
    ///
    /// NULL arguments are skipped, except for a zero-argument COUNT which counts every
    /// row.
    pub fn update(&mut self, args: &[Value]) -> crate::Result<()> {
        let arg = args.first();
        match self {
            Accumulator::Count { count } => {
                if arg.map(|v| !v.is_null()).unwrap_or(true) {
                    *count += 1;
                }
            }
            Accumulator::Sum { sum } => {
                if let Some(arg) = non_null(arg) {
                    *sum += value::as_f64(arg)?;
                }
            }
            Accumulator::Mean { sum, count } => {
                if let Some(arg) = non_null(arg) {
                    *sum += value::as_f64(arg)?;
                    *count += 1;
                }
            }
            Accumulator::Min { min, count } => {
                if let Some(arg) = non_null(arg) {
                    if better_candidate(min, arg, std::cmp::Ordering::Less)? {
                        *min = Some(arg.clone());
                    }
                    *count += 1;
                }
            }
            Accumulator::Max { max, count } => {
                if let Some(arg) = non_null(arg) {
                    if better_candidate(max, arg, std::cmp::Ordering::Greater)? {
                        *max = Some(arg.clone());
                    }
                    *count += 1;
                }
            }
        }
        Ok(())
    }

    /// The intermediate state shipped from a partial aggregation to the merge operator.
    pub fn state(&self) -> crate::Result<Value> {
        Ok(match self {
            Accumulator::Count { count } => Value::from(*count),
            Accumulator::Sum { sum } => value::number(*sum)?,
            Accumulator::Mean { sum, count } => {
                serde_json::json!({ "sum": sum, "count": count })
            }
            Accumulator::Min { min, count } => serde_json::json!({
                "min": min.clone().unwrap_or(Value::Null),
                "count": count,
            }),
            Accumulator::Max { max, count } => serde_json::json!({
                "max": max.clone().unwrap_or(Value::Null),
                "count": count,
            }),
        })
    }

    /// Combines another shard's intermediate state into this accumulator.
    pub fn merge(&mut self, state: &Value) -> crate::Result<()> {
        match self {
            Accumulator::Count { count } => {
                let shard_count = state.as_u64().ok_or_else(|| {
                    ErrorKind::RuntimeError
                        .with_message("count aggregator expects an integer state")
                })?;
                *count += shard_count;
            }
            Accumulator::Sum { sum } => {
                *sum += value::as_f64(state)?;
            }
            Accumulator::Mean { sum, count } => {
                #[derive(Debug, Deserialize)]
                struct MeanState {
                    sum: f64,
                    count: u64,
                }
                let shard: MeanState = serde_json::from_value(state.clone()).map_err(|e| {
                    ErrorKind::RuntimeError.with_message(format!(
                        "mean aggregator expects an object with 'sum' and 'count': {e}"
                    ))
                })?;
                *sum += shard.sum;
                *count += shard.count;
            }
            Accumulator::Min { min, count } => {
                if let Some((candidate, shard_count)) = minmax_candidate(state, "min")? {
                    if better_candidate(min, &candidate, std::cmp::Ordering::Less)? {
                        *min = Some(candidate);
                    }
                    *count += shard_count;
                }
            }
            Accumulator::Max { max, count } => {
                if let Some((candidate, shard_count)) = minmax_candidate(state, "max")? {
                    if better_candidate(max, &candidate, std::cmp::Ordering::Greater)? {
                        *max = Some(candidate);
                    }
                    *count += shard_count;
                }
            }
        }
        Ok(())
    }

    /// Finalizes the accumulator to the scalar the SELECT list observes.
    pub fn finalize(self) -> crate::Result<Value> {
        Ok(match self {
            Accumulator::Count { count } => Value::from(count),
            Accumulator::Sum { sum } => value::number(sum)?,
            Accumulator::Mean { sum, count } => {
                let mean = if count == 0 { 0.0 } else { sum / (count as f64) };
                value::number(mean)?
            }
            Accumulator::Min { min, .. } => min.unwrap_or(Value::Null),
            Accumulator::Max { max, .. } => max.unwrap_or(Value::Null),
        })
    }
}

fn non_null(arg: Option<&Value>) -> Option<&Value> {
    arg.filter(|v| !v.is_null())
}

/// Whether `candidate` should replace the current min/max value.
fn better_candidate(
    current: &Option<Value>,
    candidate: &Value,
    preferred_ordering: std::cmp::Ordering,
) -> crate::Result<bool> {
    match current {
        None => Ok(true),
        Some(existing) => Ok(value::compare(candidate, existing)? == preferred_ordering),
    }
}

/// Decodes a min/max shard state into a candidate value and contribution count.
///
/// States from partial aggregations are `{"min"/"max": value, "count": n}` objects; a
/// zero count means the shard's partition held no matching rows and is ignored. Bare
/// values are accepted as a candidate with an implicit count of one.
fn minmax_candidate(state: &Value, field: &str) -> crate::Result<Option<(Value, u64)>> {
    let Value::Object(map) = state else {
        return Ok(Some((state.clone(), 1)));
    };

    let candidate = map.get(field).cloned().ok_or_else(|| {
        ErrorKind::RuntimeError
            .with_message(format!("{field} aggregator expects an object with '{field}'"))
    })?;
    let count = map.get("count").and_then(|c| c.as_u64()).unwrap_or(0);

    if count == 0 {
        // The shard saw no rows; its placeholder value must not win the comparison.
        return Ok(None);
    }
    Ok(Some((candidate, count)))
}
