//! Built-in properties available on template values (`items.length`,
//! `name.upcase`, ...).

use serde_json::Value;

use crate::template::renderer::type_name;

pub fn call_method(value: &Value, name: &str) -> Result<Value, String> {
    match (value, name) {
        (Value::Array(items), "length" | "len" | "size") => Ok(Value::from(items.len())),
        (Value::Array(items), "first") => Ok(items.first().cloned().unwrap_or(Value::Null)),
        (Value::Array(items), "last") => Ok(items.last().cloned().unwrap_or(Value::Null)),
        (Value::Array(items), "empty") => Ok(Value::Bool(items.is_empty())),

        (Value::String(s), "length" | "len" | "size") => Ok(Value::from(s.chars().count())),
        (Value::String(s), "empty") => Ok(Value::Bool(s.is_empty())),
        (Value::String(s), "upcase") => Ok(Value::String(s.to_uppercase())),
        (Value::String(s), "downcase") => Ok(Value::String(s.to_lowercase())),
        (Value::String(s), "first") => Ok(s
            .chars()
            .next()
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null)),
        (Value::String(s), "last") => Ok(s
            .chars()
            .last()
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null)),

        (Value::Object(map), "length" | "len" | "size") => Ok(Value::from(map.len())),
        (Value::Object(map), "empty") => Ok(Value::Bool(map.is_empty())),
        (Value::Object(map), "keys") => Ok(Value::Array(
            map.keys().map(|k| Value::String(k.clone())).collect(),
        )),
        // A field that happens to share a method name still resolves as a field.
        (Value::Object(map), _) if map.contains_key(name) => Ok(map[name].clone()),

        (Value::Null, _) => Ok(Value::Null),
        (other, _) => Err(format!("Unknown method '{}' on {}", name, type_name(other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_array_methods() {
        let v = json!([1, 2, 3]);
        assert_eq!(call_method(&v, "length").unwrap(), json!(3));
        assert_eq!(call_method(&v, "first").unwrap(), json!(1));
        assert_eq!(call_method(&v, "last").unwrap(), json!(3));
        assert_eq!(call_method(&json!([]), "empty").unwrap(), json!(true));
    }

    #[test]
    fn test_string_methods() {
        let v = json!("héllo");
        assert_eq!(call_method(&v, "size").unwrap(), json!(5));
        assert_eq!(call_method(&v, "upcase").unwrap(), json!("HÉLLO"));
    }

    #[test]
    fn test_object_field_shadows_method() {
        let v = json!({"first": "field"});
        assert_eq!(call_method(&v, "first").unwrap(), json!("field"));
        assert_eq!(call_method(&v, "keys").unwrap(), json!(["first"]));
    }

    #[test]
    fn test_unknown_method() {
        assert_eq!(
            call_method(&json!(5), "upcase").unwrap_err(),
            "Unknown method 'upcase' on number"
        );
        assert_eq!(call_method(&Value::Null, "length").unwrap(), Value::Null);
    }
}
