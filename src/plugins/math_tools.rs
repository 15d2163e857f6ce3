//! Mathematical calculation tools.
//!
//! `math.calculate` deliberately evaluates a fixed operator set over
//! numeric operands rather than interpreting free-form expressions — the
//! tool surface is the boundary for model-produced input.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tools::{ToolHandler, ToolPermission, ToolSpec};

use super::{loader::Plugin, registry::PluginRegistry};

const MAX_FIBONACCI_TERMS: u64 = 100;

pub struct MathToolsPlugin;

impl Plugin for MathToolsPlugin {
    fn name(&self) -> &str {
        "math_tools"
    }

    fn register(&self, registry: &mut PluginRegistry) -> Result<(), String> {
        registry
            .register_tool(
                ToolSpec::new(
                    "math.calculate",
                    "Apply a named operation (add, sub, mul, div, pow, sqrt, abs) to numeric operands.",
                    ToolPermission::Read,
                    json!({
                        "type": "object",
                        "properties": {
                            "op": { "type": "string", "enum": ["add", "sub", "mul", "div", "pow", "sqrt", "abs"] },
                            "a": { "type": "number" },
                            "b": { "type": "number" }
                        },
                        "required": ["op", "a"]
                    }),
                ),
                Arc::new(CalculateTool),
            )
            .map_err(|e| e.to_string())?;

        registry
            .register_tool(
                ToolSpec::new(
                    "math.statistics",
                    "Calculate statistical metrics (mean, median, min, max, range) for a list of numbers.",
                    ToolPermission::Read,
                    json!({
                        "type": "object",
                        "properties": {
                            "numbers": { "type": "array", "items": { "type": "number" } }
                        },
                        "required": ["numbers"]
                    }),
                ),
                Arc::new(StatisticsTool),
            )
            .map_err(|e| e.to_string())?;

        registry
            .register_tool(
                ToolSpec::new(
                    "math.fibonacci",
                    "Generate the Fibonacci sequence up to n terms (max 100).",
                    ToolPermission::Read,
                    json!({
                        "type": "object",
                        "properties": { "n": { "type": "integer", "minimum": 1 } },
                        "required": ["n"]
                    }),
                ),
                Arc::new(FibonacciTool),
            )
            .map_err(|e| e.to_string())?;

        registry
            .register_tool(
                ToolSpec::new(
                    "math.prime_factors",
                    "Find the prime factorization of a positive integer.",
                    ToolPermission::Read,
                    json!({
                        "type": "object",
                        "properties": { "n": { "type": "integer", "minimum": 2 } },
                        "required": ["n"]
                    }),
                ),
                Arc::new(PrimeFactorsTool),
            )
            .map_err(|e| e.to_string())
    }
}

// ─── math.calculate ───────────────────────────────────────────────────────────

struct CalculateTool;

#[async_trait]
impl ToolHandler for CalculateTool {
    async fn invoke(&self, args: Value) -> Result<Value, String> {
        let op = args
            .get("op")
            .and_then(Value::as_str)
            .ok_or("missing 'op'")?;
        let a = args
            .get("a")
            .and_then(Value::as_f64)
            .ok_or("missing numeric 'a'")?;
        let b = args.get("b").and_then(Value::as_f64);

        let need_b = |b: Option<f64>| b.ok_or_else(|| format!("op '{op}' needs 'b'"));
        let result = match op {
            "add" => a + need_b(b)?,
            "sub" => a - need_b(b)?,
            "mul" => a * need_b(b)?,
            "div" => {
                let b = need_b(b)?;
                if b == 0.0 {
                    return Err("division by zero".to_owned());
                }
                a / b
            }
            "pow" => a.powf(need_b(b)?),
            "sqrt" => {
                if a < 0.0 {
                    return Err("sqrt of negative number".to_owned());
                }
                a.sqrt()
            }
            "abs" => a.abs(),
            other => return Err(format!("unknown op '{other}'")),
        };

        Ok(json!({ "op": op, "result": result }))
    }
}

// ─── math.statistics ──────────────────────────────────────────────────────────

struct StatisticsTool;

#[async_trait]
impl ToolHandler for StatisticsTool {
    async fn invoke(&self, args: Value) -> Result<Value, String> {
        let numbers: Vec<f64> = args
            .get("numbers")
            .and_then(Value::as_array)
            .ok_or("missing 'numbers' array")?
            .iter()
            .filter_map(Value::as_f64)
            .collect();
        if numbers.is_empty() {
            return Err("empty list provided".to_owned());
        }

        let n = numbers.len();
        let sum: f64 = numbers.iter().sum();
        let mut sorted = numbers.clone();
        sorted.sort_by(|x, y| x.total_cmp(y));
        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        };
        let min = sorted[0];
        let max = sorted[n - 1];

        Ok(json!({
            "count": n,
            "sum": sum,
            "mean": sum / n as f64,
            "median": median,
            "min": min,
            "max": max,
            "range": max - min,
        }))
    }
}

// ─── math.fibonacci ───────────────────────────────────────────────────────────

struct FibonacciTool;

#[async_trait]
impl ToolHandler for FibonacciTool {
    async fn invoke(&self, args: Value) -> Result<Value, String> {
        let n = args
            .get("n")
            .and_then(Value::as_u64)
            .ok_or("missing positive integer 'n'")?;
        if n == 0 {
            return Err("n must be positive".to_owned());
        }
        if n > MAX_FIBONACCI_TERMS {
            return Err(format!("n too large (max {MAX_FIBONACCI_TERMS})"));
        }

        let mut sequence: Vec<u128> = Vec::with_capacity(n as usize);
        let (mut a, mut b): (u128, u128) = (0, 1);
        for _ in 0..n {
            sequence.push(a);
            (a, b) = (b, a + b);
        }

        let last = *sequence.last().unwrap_or(&0);
        Ok(json!({
            "n": n,
            "sequence": sequence.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
            "last_term": last.to_string(),
        }))
    }
}

// ─── math.prime_factors ───────────────────────────────────────────────────────

struct PrimeFactorsTool;

#[async_trait]
impl ToolHandler for PrimeFactorsTool {
    async fn invoke(&self, args: Value) -> Result<Value, String> {
        let n = args
            .get("n")
            .and_then(Value::as_u64)
            .ok_or("missing positive integer 'n'")?;
        if n <= 1 {
            return Err("number must be greater than 1".to_owned());
        }

        let mut factors = Vec::new();
        let mut rest = n;
        let mut d = 2u64;
        while d.saturating_mul(d) <= rest {
            while rest % d == 0 {
                factors.push(d);
                rest /= d;
            }
            d += 1;
        }
        if rest > 1 {
            factors.push(rest);
        }

        let mut unique = factors.clone();
        unique.dedup();

        Ok(json!({ "number": n, "factors": factors, "unique_factors": unique }))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calculate_add() {
        let out = CalculateTool
            .invoke(json!({ "op": "add", "a": 2, "b": 3 }))
            .await
            .unwrap();
        assert_eq!(out["result"], 5.0);
    }

    #[tokio::test]
    async fn calculate_sqrt_rejects_negative() {
        let err = CalculateTool
            .invoke(json!({ "op": "sqrt", "a": -4 }))
            .await
            .unwrap_err();
        assert!(err.contains("negative"));
    }

    #[tokio::test]
    async fn calculate_div_by_zero_errors() {
        assert!(
            CalculateTool
                .invoke(json!({ "op": "div", "a": 1, "b": 0 }))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn statistics_median_even_count() {
        let out = StatisticsTool
            .invoke(json!({ "numbers": [1.0, 2.0, 3.0, 4.0] }))
            .await
            .unwrap();
        assert_eq!(out["median"], 2.5);
        assert_eq!(out["mean"], 2.5);
        assert_eq!(out["range"], 3.0);
    }

    #[tokio::test]
    async fn statistics_rejects_empty_list() {
        assert!(StatisticsTool.invoke(json!({ "numbers": [] })).await.is_err());
    }

    #[tokio::test]
    async fn fibonacci_first_terms() {
        let out = FibonacciTool.invoke(json!({ "n": 6 })).await.unwrap();
        let seq: Vec<String> = out["sequence"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_owned())
            .collect();
        assert_eq!(seq, vec!["0", "1", "1", "2", "3", "5"]);
    }

    #[tokio::test]
    async fn fibonacci_caps_term_count() {
        assert!(FibonacciTool.invoke(json!({ "n": 101 })).await.is_err());
    }

    #[tokio::test]
    async fn prime_factors_of_360() {
        let out = PrimeFactorsTool.invoke(json!({ "n": 360 })).await.unwrap();
        let factors: Vec<u64> = out["factors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_u64().unwrap())
            .collect();
        assert_eq!(factors, vec![2, 2, 2, 3, 3, 5]);
        let unique: Vec<u64> = out["unique_factors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_u64().unwrap())
            .collect();
        assert_eq!(unique, vec![2, 3, 5]);
    }
}
