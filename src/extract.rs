//! Response value extraction for environment captures.
//!
//! A capture reads either a response header or the response body and
//! produces a string value, or a [`CaptureError`] explaining why it could
//! not. Body captures support JSONPath, XPath, and regex occurrence
//! lookups; header captures take the header value, optionally refined by
//! a regex.

use http::HeaderMap;
use serde_json::Value as JsonValue;
use serde_json_path::JsonPath;

use crate::error::CaptureError;
use crate::scenario::{CaptureConfig, CaptureSource, RegexCapture};

/// Run one capture rule against the response headers and body.
pub fn extract(
    headers: &HeaderMap,
    body: &[u8],
    conf: &CaptureConfig,
) -> Result<String, CaptureError> {
    match conf.from {
        CaptureSource::Header => extract_from_headers(headers, conf),
        CaptureSource::Body => extract_from_body(body, conf),
    }
}

fn extract_from_headers(headers: &HeaderMap, conf: &CaptureConfig) -> Result<String, CaptureError> {
    let key = conf
        .header_key
        .as_deref()
        .ok_or_else(|| CaptureError::new("http header key not specified"))?;

    let value = headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CaptureError::new(format!("http header {key} not found")))?;

    match &conf.regex {
        Some(re) => extract_with_regex(value, re),
        None => Ok(value.to_string()),
    }
}

fn extract_from_body(body: &[u8], conf: &CaptureConfig) -> Result<String, CaptureError> {
    if let Some(path) = &conf.json_path {
        return extract_json_path(body, path);
    }
    if let Some(re) = &conf.regex {
        let text = std::str::from_utf8(body)
            .map_err(|_| CaptureError::new("response body is not valid utf-8"))?;
        return extract_with_regex(text, re);
    }
    if let Some(xpath) = &conf.xpath {
        return extract_xpath(body, xpath);
    }
    Err(CaptureError::new("no extractor configured for body source"))
}

fn extract_json_path(body: &[u8], path: &str) -> Result<String, CaptureError> {
    let document: JsonValue = serde_json::from_slice(body)
        .map_err(|e| CaptureError::new(format!("response body is not valid json: {e}")))?;
    let compiled = JsonPath::parse(path)
        .map_err(|e| CaptureError::new(format!("invalid json path {path}: {e}")))?;
    let node = compiled
        .query(&document)
        .first()
        .ok_or_else(|| CaptureError::new(format!("no match for json path {path}")))?;
    Ok(json_to_string(node))
}

/// Scalars stringify naturally; structured values serialize compactly.
fn json_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

fn extract_with_regex(source: &str, conf: &RegexCapture) -> Result<String, CaptureError> {
    let re = regex::Regex::new(&conf.pattern)
        .map_err(|e| CaptureError::new(format!("invalid regex {}: {e}", conf.pattern)))?;
    let result = re
        .find_iter(source)
        .nth(conf.match_index)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            CaptureError::new(format!(
                "no match {} for regex {}",
                conf.match_index, conf.pattern
            ))
        });
    result
}

fn extract_xpath(body: &[u8], xpath: &str) -> Result<String, CaptureError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| CaptureError::new("response body is not valid utf-8"))?;
    let package = sxd_document::parser::parse(text)
        .map_err(|e| CaptureError::new(format!("response body is not valid xml: {e}")))?;
    let document = package.as_document();
    let value = sxd_xpath::evaluate_xpath(&document, xpath)
        .map_err(|e| CaptureError::new(format!("xpath {xpath} failed: {e}")))?;

    if let sxd_xpath::Value::Nodeset(ref nodes) = value {
        if nodes.size() == 0 {
            return Err(CaptureError::new(format!("no match for xpath {xpath}")));
        }
    }
    Ok(value.string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;

    fn conf_json(name: &str, path: &str) -> CaptureConfig {
        CaptureConfig {
            name: name.to_string(),
            from: CaptureSource::Body,
            header_key: None,
            json_path: Some(path.to_string()),
            xpath: None,
            regex: None,
        }
    }

    #[test]
    fn test_json_path_scalar() {
        let conf = conf_json("t", "$.token");
        let out = extract(&HeaderMap::new(), br#"{"token":"abc"}"#, &conf).unwrap();
        assert_eq!(out, "abc");
    }

    #[test]
    fn test_json_path_number_stringifies() {
        let conf = conf_json("n", "$.count");
        let out = extract(&HeaderMap::new(), br#"{"count":42}"#, &conf).unwrap();
        assert_eq!(out, "42");
    }

    #[test]
    fn test_json_path_nested() {
        let conf = conf_json("id", "$.data.items[1].id");
        let body = br#"{"data":{"items":[{"id":"a"},{"id":"b"}]}}"#;
        assert_eq!(extract(&HeaderMap::new(), body, &conf).unwrap(), "b");
    }

    #[test]
    fn test_json_path_no_match_is_error() {
        let conf = conf_json("t", "$.missing");
        let err = extract(&HeaderMap::new(), br#"{"token":"abc"}"#, &conf).unwrap_err();
        assert!(err.message.contains("no match"), "{err}");
    }

    #[test]
    fn test_json_path_invalid_body_is_error() {
        let conf = conf_json("t", "$.token");
        let err = extract(&HeaderMap::new(), b"<html>", &conf).unwrap_err();
        assert!(err.message.contains("not valid json"), "{err}");
    }

    #[test]
    fn test_header_capture() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("req-9"));
        let conf = CaptureConfig {
            name: "rid".to_string(),
            from: CaptureSource::Header,
            header_key: Some("X-Request-Id".to_string()),
            json_path: None,
            xpath: None,
            regex: None,
        };
        assert_eq!(extract(&headers, b"", &conf).unwrap(), "req-9");
    }

    #[test]
    fn test_header_missing_is_error() {
        let conf = CaptureConfig {
            name: "rid".to_string(),
            from: CaptureSource::Header,
            header_key: Some("x-request-id".to_string()),
            json_path: None,
            xpath: None,
            regex: None,
        };
        let err = extract(&HeaderMap::new(), b"", &conf).unwrap_err();
        assert!(err.message.contains("not found"), "{err}");
    }

    #[test]
    fn test_header_capture_with_regex_over_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "set-cookie",
            HeaderValue::from_static("session=s3cr3t; Path=/"),
        );
        let conf = CaptureConfig {
            name: "sess".to_string(),
            from: CaptureSource::Header,
            header_key: Some("set-cookie".to_string()),
            json_path: None,
            xpath: None,
            regex: Some(RegexCapture {
                pattern: r"session=\w+".to_string(),
                match_index: 0,
            }),
        };
        assert_eq!(extract(&headers, b"", &conf).unwrap(), "session=s3cr3t");
    }

    #[test]
    fn test_body_regex_match_index() {
        let conf = CaptureConfig {
            name: "second".to_string(),
            from: CaptureSource::Body,
            header_key: None,
            json_path: None,
            xpath: None,
            regex: Some(RegexCapture {
                pattern: r"\d+".to_string(),
                match_index: 1,
            }),
        };
        assert_eq!(extract(&HeaderMap::new(), b"a=10 b=20 c=30", &conf).unwrap(), "20");
    }

    #[test]
    fn test_body_regex_out_of_range_is_error() {
        let conf = CaptureConfig {
            name: "nope".to_string(),
            from: CaptureSource::Body,
            header_key: None,
            json_path: None,
            xpath: None,
            regex: Some(RegexCapture {
                pattern: r"\d+".to_string(),
                match_index: 5,
            }),
        };
        assert!(extract(&HeaderMap::new(), b"only 1", &conf).is_err());
    }

    #[test]
    fn test_xpath_capture() {
        let conf = CaptureConfig {
            name: "title".to_string(),
            from: CaptureSource::Body,
            header_key: None,
            json_path: None,
            xpath: Some("/catalog/book/title".to_string()),
            regex: None,
        };
        let body = b"<catalog><book><title>Dune</title></book></catalog>";
        assert_eq!(extract(&HeaderMap::new(), body, &conf).unwrap(), "Dune");
    }

    #[test]
    fn test_xpath_no_match_is_error() {
        let conf = CaptureConfig {
            name: "title".to_string(),
            from: CaptureSource::Body,
            header_key: None,
            json_path: None,
            xpath: Some("/catalog/missing".to_string()),
            regex: None,
        };
        let body = b"<catalog><book/></catalog>";
        assert!(extract(&HeaderMap::new(), body, &conf).is_err());
    }
}
