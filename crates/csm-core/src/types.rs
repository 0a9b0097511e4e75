use serde_json::Value;

pub use csm_definition::ContextMap;

/// Flat key-value context visible to conditions, interpolation and `@var` targets
pub type Context = ContextMap;

/// Prefix accepted (and ignored) in front of context paths
pub const CONTEXT_PREFIX: &str = "context.";

/// Resolve a dotted path such as `user.address.city` or `orders.0.size`.
///
/// A leading `context.` is accepted so the same paths work in expressions and
/// in pattern interpolation. Numeric segments index into arrays.
pub fn lookup_path<'a>(context: &'a Context, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    let path = path.strip_prefix(CONTEXT_PREFIX).unwrap_or(path);
    if path.is_empty() {
        return None;
    }

    let mut segments = path.split('.');
    let mut current = context.get(segments.next()?)?;
    for segment in segments {
        current = lookup_segment(current, segment)?;
    }
    Some(current)
}

/// Resolve a dotted path inside an arbitrary value; the empty path is the value itself
pub fn lookup_value_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, lookup_segment)
}

fn lookup_segment<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get(index)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Context {
        json!({
            "user": { "name": "Ada", "age": 36 },
            "orders": [{ "size": "large" }]
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_lookup_path() {
        let ctx = context();
        assert_eq!(lookup_path(&ctx, "user.name"), Some(&json!("Ada")));
        assert_eq!(lookup_path(&ctx, "context.user.age"), Some(&json!(36)));
        assert_eq!(lookup_path(&ctx, "orders.0.size"), Some(&json!("large")));
        assert_eq!(lookup_path(&ctx, "orders.1.size"), None);
        assert_eq!(lookup_path(&ctx, "user.name.first"), None);
        assert_eq!(lookup_path(&ctx, ""), None);
    }

    #[test]
    fn test_lookup_value_path() {
        let value = json!({ "size": "small", "extras": ["milk"] });
        assert_eq!(lookup_value_path(&value, ""), Some(&value));
        assert_eq!(lookup_value_path(&value, "extras.0"), Some(&json!("milk")));
        assert_eq!(lookup_value_path(&value, "price"), None);
    }
}
