//! Arithmetic provider.

use serde_json::{json, Value};

use super::registry::{object_schema, required_f64, required_i64, ProviderRegistry, ToolFailure};

pub const NAME: &str = "Math";

pub fn registry() -> ProviderRegistry {
    let ints = || object_schema(&[("a", "integer"), ("b", "integer")], &["a", "b"]);

    ProviderRegistry::new(NAME)
        .tool(
            "add",
            "Add two numbers together. Use this when you need to find the sum of two values. \
             Example: add(5, 3) returns 8",
            ints(),
            |args| integer_op(args, i64::checked_add),
        )
        .tool("subtract", "Subtract b from a", ints(), |args| {
            integer_op(args, i64::checked_sub)
        })
        .tool("multiply", "Multiply two numbers", ints(), |args| {
            integer_op(args, i64::checked_mul)
        })
        .tool(
            "divide",
            "Divide a by b and return the result. Use this to find averages (divide the sum \
             by the count), ratios or proportions. Example: divide(30, 2) returns 15",
            object_schema(&[("a", "number"), ("b", "number")], &["a", "b"]),
            divide,
        )
}

fn integer_op(args: &Value, op: fn(i64, i64) -> Option<i64>) -> Result<Value, ToolFailure> {
    let a = required_i64(args, "a")?;
    let b = required_i64(args, "b")?;
    op(a, b)
        .map(|n| json!(n))
        .ok_or_else(|| ToolFailure::Failed("Integer overflow".into()))
}

fn divide(args: &Value) -> Result<Value, ToolFailure> {
    let a = required_f64(args, "a")?;
    let b = required_f64(args, "b")?;
    if b == 0.0 {
        return Err(ToolFailure::Failed("Cannot divide by zero".into()));
    }
    Ok(json!(a / b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(tool: &str, args: Value) -> Result<Value, ToolFailure> {
        registry().call(tool, &args).expect("tool registered")
    }

    #[test]
    fn test_registers_four_tools() {
        let names: Vec<_> = registry().definitions().map(|d| d.name.clone()).collect();
        assert_eq!(names, vec!["add", "subtract", "multiply", "divide"]);
    }

    #[test]
    fn test_integer_operations() {
        assert_eq!(call("add", json!({"a": 5, "b": 3})), Ok(json!(8)));
        assert_eq!(call("subtract", json!({"a": 5, "b": 8})), Ok(json!(-3)));
        assert_eq!(call("multiply", json!({"a": 6, "b": 7})), Ok(json!(42)));
        assert!(call("add", json!({"a": i64::MAX, "b": 1})).is_err());
        assert!(call("add", json!({"a": 1.5, "b": 1})).is_err());
    }

    #[test]
    fn test_divide() {
        assert_eq!(call("divide", json!({"a": 10, "b": 2})), Ok(json!(5.0)));
        assert_eq!(call("divide", json!({"a": 30, "b": 4})), Ok(json!(7.5)));
        assert_eq!(
            call("divide", json!({"a": 10, "b": 0})),
            Err(ToolFailure::Failed("Cannot divide by zero".into()))
        );
    }
}
