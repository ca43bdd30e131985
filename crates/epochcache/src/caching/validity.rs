use serde::Serialize;
use serde_json::Value;

/// Returns `false` for values that are considered empty.
///
/// Empty values are typically the result of a transient upstream failure, like an API
/// responding with `{}` during a partial outage. Those are returned to the caller, but never
/// cached, so that the next call retries instead of serving an empty value for a whole epoch.
///
/// A value is empty if it serializes to `null` (like `None` or `()`), an empty string, an
/// empty array or an object without fields. Values that fail to serialize are not judged
/// here and count as valid.
pub fn is_valid_default<T: Serialize + ?Sized>(value: &T) -> bool {
    match serde_json::to_value(value) {
        Ok(Value::Null) => false,
        Ok(Value::String(s)) => !s.is_empty(),
        Ok(Value::Array(items)) => !items.is_empty(),
        Ok(Value::Object(fields)) => !fields.is_empty(),
        Ok(_) | Err(_) => true,
    }
}
