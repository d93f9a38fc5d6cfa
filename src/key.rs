//! Canonical request fingerprints.
//!
//! A fingerprint is the cache key for one logical request:
//! `METHOD:URL:paramsJson:bodyJson`. Object keys are sorted recursively so
//! two callers supplying the same parameters in different order produce
//! byte-identical keys; arrays keep their order because position carries
//! meaning. Methods without a request body (GET, HEAD, DELETE, OPTIONS)
//! leave the body segment empty.

use serde_json::{Map, Value};

/// Methods whose body never participates in the fingerprint.
const BODYLESS_METHODS: [&str; 4] = ["GET", "HEAD", "DELETE", "OPTIONS"];

/// Build the canonical fingerprint for a request.
///
/// `params` and `body` are canonicalized with recursively sorted object
/// keys before serialization. The output is deterministic across calls
/// and processes for logically identical input.
pub fn request_key(
    method: &str,
    url: &str,
    params: Option<&Value>,
    body: Option<&Value>,
) -> String {
    let method = method.to_uppercase();

    let params_json = params.map(|p| canonical_json(p)).unwrap_or_default();

    let body_json = if BODYLESS_METHODS.contains(&method.as_str()) {
        String::new()
    } else {
        body.map(|b| canonical_json(b)).unwrap_or_default()
    };

    format!("{}:{}:{}:{}", method, url, params_json, body_json)
}

/// Serialize a JSON value with all object keys sorted, recursively.
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_key_shape() {
        let key = request_key("get", "/users", None, None);
        assert_eq!(key, "GET:/users::");
    }

    #[test]
    fn test_param_order_is_irrelevant() {
        let a = json!({"page": 2, "limit": 10});
        let b = json!({"limit": 10, "page": 2});
        assert_eq!(
            request_key("GET", "/users", Some(&a), None),
            request_key("GET", "/users", Some(&b), None)
        );
    }

    #[test]
    fn test_nested_objects_sorted_recursively() {
        let a = json!({"filter": {"b": 1, "a": {"z": true, "y": false}}});
        let b = json!({"filter": {"a": {"y": false, "z": true}, "b": 1}});
        assert_eq!(
            request_key("GET", "/search", Some(&a), None),
            request_key("GET", "/search", Some(&b), None)
        );
    }

    #[test]
    fn test_array_order_is_preserved() {
        let a = json!({"ids": [3, 1, 2]});
        let b = json!({"ids": [1, 2, 3]});
        assert_ne!(
            request_key("GET", "/batch", Some(&a), None),
            request_key("GET", "/batch", Some(&b), None)
        );
    }

    #[test]
    fn test_body_included_for_post_only() {
        let body = json!({"name": "x"});
        let post = request_key("POST", "/users", None, Some(&body));
        let get = request_key("GET", "/users", None, Some(&body));
        assert!(post.ends_with(r#":{"name":"x"}"#));
        assert!(get.ends_with("::"));
    }

    #[test]
    fn test_method_is_uppercased() {
        assert_eq!(
            request_key("post", "/users", None, None),
            request_key("POST", "/users", None, None)
        );
    }

    #[test]
    fn test_different_urls_differ() {
        assert_ne!(
            request_key("GET", "/users/1", None, None),
            request_key("GET", "/users/2", None, None)
        );
    }

    // Generate arbitrary JSON objects a few levels deep.
    fn arb_json(depth: u32) -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[a-z]{0,8}".prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(depth, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::Array),
                prop::collection::hash_map("[a-z]{1,6}", inner, 0..4).prop_map(|m| {
                    serde_json::Value::Object(m.into_iter().collect())
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_key_is_deterministic(value in arb_json(3)) {
            let a = request_key("POST", "/things", Some(&value), Some(&value));
            let b = request_key("POST", "/things", Some(&value), Some(&value));
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_canonical_json_round_trips(value in arb_json(3)) {
            // Canonicalization must not lose or alter data, only reorder keys.
            let canonical = canonical_json(&value);
            let reparsed: serde_json::Value = serde_json::from_str(&canonical).unwrap();
            prop_assert_eq!(reparsed, value);
        }
    }
}
