//! Debug payload for JSON responses
//!
//! Framework-agnostic: the host decides whether the response is JSON and
//! applies the returned body fragment and headers itself.

use serde_json::{json, Map, Value as JsonValue};

use super::RequestSummary;
use crate::config::ResponseConfig;
use crate::constants::{DEBUG_REQUEST_HEADER, QUERY_COUNT_HEADER, QUERY_TIME_HEADER};

/// Whether a request should carry the debug payload
///
/// Injection happens when enabled in configuration or when the request sent
/// `X-Query-Debug: true`. `debug_header` is that header's value, if present.
pub fn should_inject(config: &ResponseConfig, debug_header: Option<&str>) -> bool {
    config.inject
        || debug_header
            .map(|value| value.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
}

/// Value placed under `response_key`
///
/// Counts, slow queries and N+1 patterns by default; the full summary
/// including every record when `include_full_queries` is set.
pub fn injection_payload(config: &ResponseConfig, summary: &RequestSummary) -> JsonValue {
    if config.include_full_queries {
        return serde_json::to_value(summary).unwrap_or(JsonValue::Null);
    }

    json!({
        "total_queries": summary.total_queries,
        "total_time_ms": summary.total_time_ms,
        "slow_queries_count": summary.slow_queries_count,
        "n_plus_one_count": summary.n_plus_one_count,
        "slow_queries": summary.slow_queries,
        "n_plus_one_patterns": summary.n_plus_one_patterns,
    })
}

/// Insert the payload into a JSON object body
///
/// Bodies that are not objects are left untouched and `false` is returned.
pub fn inject_into(body: &mut JsonValue, config: &ResponseConfig, summary: &RequestSummary) -> bool {
    match body {
        JsonValue::Object(map) => {
            map.insert(
                config.response_key.clone(),
                injection_payload(config, summary),
            );
            true
        }
        _ => false,
    }
}

/// `X-Query-Count` and `X-Query-Time-Ms` header pairs
pub fn response_headers(summary: &RequestSummary) -> [(&'static str, String); 2] {
    [
        (QUERY_COUNT_HEADER, summary.total_queries.to_string()),
        (QUERY_TIME_HEADER, summary.total_time_ms.to_string()),
    ]
}

/// Name of the request header that opts into injection
pub fn debug_header_name() -> &'static str {
    DEBUG_REQUEST_HEADER
}

/// Wrap a payload in an object under `response_key`, for non-object bodies
pub fn standalone_payload(config: &ResponseConfig, summary: &RequestSummary) -> JsonValue {
    let mut map = Map::new();
    map.insert(
        config.response_key.clone(),
        injection_payload(config, summary),
    );
    JsonValue::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> RequestSummary {
        RequestSummary {
            request_id: "req-1".to_string(),
            total_queries: 12,
            total_time_ms: 48.25,
            slow_queries_count: 0,
            n_plus_one_count: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_should_inject() {
        let config = ResponseConfig::default();
        assert!(!should_inject(&config, None));
        assert!(should_inject(&config, Some("true")));
        assert!(should_inject(&config, Some(" TRUE ")));
        assert!(!should_inject(&config, Some("1")));

        let always = ResponseConfig {
            inject: true,
            ..Default::default()
        };
        assert!(should_inject(&always, None));
    }

    #[test]
    fn test_counts_only_payload() {
        let payload = injection_payload(&ResponseConfig::default(), &summary());
        assert_eq!(payload["total_queries"], 12);
        assert_eq!(payload["total_time_ms"], 48.25);
        assert_eq!(payload["n_plus_one_count"], 2);
        assert!(payload.get("queries").is_none());
        assert!(payload.get("request_id").is_none());
    }

    #[test]
    fn test_full_payload_includes_queries() {
        let config = ResponseConfig {
            include_full_queries: true,
            ..Default::default()
        };
        let payload = injection_payload(&config, &summary());
        assert_eq!(payload["request_id"], "req-1");
        assert!(payload["queries"].is_array());
    }

    #[test]
    fn test_inject_into_object_body() {
        let mut body = json!({"data": [1, 2, 3]});
        assert!(inject_into(&mut body, &ResponseConfig::default(), &summary()));
        assert_eq!(body["_query_debug"]["total_queries"], 12);
        assert_eq!(body["data"], json!([1, 2, 3]));

        let mut list = json!([1, 2]);
        assert!(!inject_into(&mut list, &ResponseConfig::default(), &summary()));
        assert_eq!(list, json!([1, 2]));

        let wrapped = standalone_payload(&ResponseConfig::default(), &summary());
        assert_eq!(wrapped["_query_debug"]["n_plus_one_count"], 2);
    }

    #[test]
    fn test_response_headers() {
        let headers = response_headers(&summary());
        assert_eq!(headers[0], ("X-Query-Count", "12".to_string()));
        assert_eq!(headers[1], ("X-Query-Time-Ms", "48.25".to_string()));
        assert_eq!(debug_header_name(), "X-Query-Debug");
    }
}
