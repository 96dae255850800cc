//! Response types for unary calls.

use grpcweb_core::{Code, ErrorDetail, Status};
use http::HeaderMap;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

/// Response metadata, header or trailer map.
///
/// Serializes as `{ name: [values...] }`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    headers: HeaderMap,
}

impl Metadata {
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }

    /// Get a header value by name.
    ///
    /// Returns `None` if the header is not present or is not valid text.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|v| v.to_str().ok())
    }

    /// All values for a header that appears more than once.
    pub fn get_all(&self, key: &str) -> impl Iterator<Item = &str> {
        self.headers
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn into_headers(self) -> HeaderMap {
        self.headers
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }
}

impl From<HeaderMap> for Metadata {
    fn from(headers: HeaderMap) -> Self {
        Self::new(headers)
    }
}

impl Serialize for Metadata {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.headers.keys_len()))?;
        for name in self.headers.keys() {
            let values: Vec<String> = self
                .headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect();
            map.serialize_entry(name.as_str(), &values)?;
        }
        map.end()
    }
}

/// Result of a unary call that reached the server.
///
/// A call the server rejected is still an `InvokeResponse`: `status` is
/// non-OK, `error` and `error_details` describe why, and `message` is null.
#[derive(Debug, Clone, Serialize)]
pub struct InvokeResponse {
    pub headers: Metadata,
    pub trailers: Metadata,
    pub message: Value,
    pub error: Option<String>,
    pub error_details: Vec<ErrorDetail>,
    pub status: Code,
}

impl InvokeResponse {
    pub(crate) fn ok(headers: HeaderMap, trailers: HeaderMap, message: Value) -> Self {
        Self {
            headers: headers.into(),
            trailers: trailers.into(),
            message,
            error: None,
            error_details: Vec::new(),
            status: Code::Ok,
        }
    }

    pub(crate) fn failed(headers: HeaderMap, trailers: HeaderMap, status: Status) -> Self {
        let (code, message, details) = status.into_parts();
        Self {
            headers: headers.into(),
            trailers: trailers.into(),
            message: Value::Null,
            error: Some(message.unwrap_or_else(|| code.as_str().to_string())),
            error_details: details,
            status: code,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Code::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use serde_json::json;

    #[test]
    fn test_metadata_get() {
        let mut headers = HeaderMap::new();
        headers.insert("x-custom", HeaderValue::from_static("value"));
        headers.append("x-multi", HeaderValue::from_static("a"));
        headers.append("x-multi", HeaderValue::from_static("b"));
        let metadata = Metadata::new(headers);

        assert_eq!(metadata.get("x-custom"), Some("value"));
        assert_eq!(metadata.get("missing"), None);
        assert_eq!(metadata.get_all("x-multi").collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(metadata.contains("x-multi"));
    }

    #[test]
    fn test_ok_response_serialization() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/grpc-web+proto"));
        let response = InvokeResponse::ok(headers, HeaderMap::new(), json!({ "summary": "sunny" }));

        assert!(response.is_ok());
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "headers": { "content-type": ["application/grpc-web+proto"] },
                "trailers": {},
                "message": { "summary": "sunny" },
                "error": null,
                "error_details": [],
                "status": 0,
            })
        );
    }

    #[test]
    fn test_failed_response() {
        let status = Status::new(Code::NotFound, "no such city")
            .add_detail("type.googleapis.com/google.rpc.ResourceInfo", vec![1, 2]);
        let response = InvokeResponse::failed(HeaderMap::new(), HeaderMap::new(), status);

        assert!(!response.is_ok());
        assert_eq!(response.status, Code::NotFound);
        assert_eq!(response.error.as_deref(), Some("no such city"));
        assert_eq!(response.error_details.len(), 1);
        assert_eq!(response.message, Value::Null);
    }

    #[test]
    fn test_failed_response_without_message() {
        let response =
            InvokeResponse::failed(HeaderMap::new(), HeaderMap::new(), Status::from_code(Code::Unavailable));
        assert_eq!(response.error.as_deref(), Some("unavailable"));
    }
}
