//! Query-string encoding for endpoint parameters.
//!
//! Parameters are a JSON object. Nested objects and arrays flatten into
//! `parent[key]=value` pairs.

use serde_json::Value;

/// Serialize `params` into a query string (without the leading `?`).
#[must_use]
pub fn serialize_params(params: &Value) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    if let Value::Object(map) = params {
        for (key, value) in map {
            append_pair(&mut serializer, key.clone(), value);
        }
    }
    serializer.finish()
}

fn append_pair(
    serializer: &mut form_urlencoded::Serializer<'_, String>,
    key: String,
    value: &Value,
) {
    match value {
        Value::Object(map) => {
            for (child, value) in map {
                append_pair(serializer, format!("{key}[{child}]"), value);
            }
        }
        Value::Array(items) => {
            for (index, value) in items.iter().enumerate() {
                append_pair(serializer, format!("{key}[{index}]"), value);
            }
        }
        // Null carries no value.
        Value::Null => {}
        Value::String(text) => {
            serializer.append_pair(&key, text);
        }
        other => {
            serializer.append_pair(&key, &other.to_string());
        }
    }
}

/// Append `params` to `url`, using `&` if the URL already has a query.
///
/// Returns `url` unchanged when `params` is empty.
#[must_use]
pub fn append_params(url: &str, params: &Value) -> String {
    let query = serialize_params(params);
    if query.is_empty() {
        return url.to_string();
    }
    let prefix = if url.contains('?') { '&' } else { '?' };
    format!("{url}{prefix}{query}")
}
