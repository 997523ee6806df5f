//! Layer merging over JSON values.

use serde_json::{Map, Value};

/// A map or list met a value of a different shape at the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
  /// Dotted path of the conflicting key.
  pub key: String,
  pub lower: &'static str,
  pub upper: &'static str,
}

/// Merge `upper` over `lower`.
///
/// - maps merge key by key, recursively
/// - lists concatenate, `lower` first
/// - scalars are replaced by `upper`
/// - `null` on either side yields the other side
pub fn deep_merge(lower: Value, upper: Value) -> Result<Value, MergeConflict> {
  merge_at(lower, upper, &mut Vec::new())
}

fn merge_at(lower: Value, upper: Value, path: &mut Vec<String>) -> Result<Value, MergeConflict> {
  match (lower, upper) {
    (lower, Value::Null) => Ok(lower),
    (Value::Null, upper) => Ok(upper),
    (Value::Object(lower), Value::Object(upper)) => merge_maps(lower, upper, path).map(Value::Object),
    (Value::Array(mut lower), Value::Array(upper)) => {
      lower.extend(upper);
      Ok(Value::Array(lower))
    }
    (lower @ (Value::Object(_) | Value::Array(_)), upper) | (lower, upper @ (Value::Object(_) | Value::Array(_))) => {
      Err(MergeConflict {
        key: path.join("."),
        lower: shape(&lower),
        upper: shape(&upper),
      })
    }
    (_, upper) => Ok(upper),
  }
}

fn merge_maps(
  mut lower: Map<String, Value>,
  upper: Map<String, Value>,
  path: &mut Vec<String>,
) -> Result<Map<String, Value>, MergeConflict> {
  for (key, upper_value) in upper {
    let merged = match lower.remove(&key) {
      Some(lower_value) => {
        path.push(key.clone());
        let merged = merge_at(lower_value, upper_value, path);
        path.pop();
        merged?
      }
      None => upper_value,
    };
    lower.insert(key, merged);
  }
  Ok(lower)
}

fn shape(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "boolean",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "list",
    Value::Object(_) => "map",
  }
}
