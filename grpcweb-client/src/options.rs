//! Per-call and per-connection options.
//!
//! [`CallOptions`] and [`ConnectParams`] are plain builders. Both also
//! convert from host-shaped JSON objects, which is where validation of
//! metadata and timeout values happens.

use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};

use crate::ClientError;
use crate::host::Tags;

/// Timeout applied to unary calls when none (or a non-positive one) is given.
pub const DEFAULT_UNARY_TIMEOUT: Duration = Duration::from_secs(120);

/// Options for configuring individual RPC calls.
///
/// # Example
///
/// ```
/// use grpcweb_client::CallOptions;
/// use std::time::Duration;
///
/// let options = CallOptions::new()
///     .timeout(Duration::from_secs(5))
///     .try_header("authorization", "Bearer token123")
///     .unwrap()
///     .tag("scenario", "smoke");
/// assert_eq!(options.get_timeout(), Some(Duration::from_secs(5)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// `None` means "use the default for this call shape".
    pub(crate) timeout: Option<Duration>,
    pub(crate) headers: HeaderMap,
    pub(crate) tags: Tags,
}

impl CallOptions {
    /// Create new default call options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout for this call. A zero duration counts as unset.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Get the configured timeout, if any.
    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Try to add a metadata entry.
    ///
    /// Fails for invalid header names or values and for names reserved by
    /// the protocol.
    pub fn try_header<K, V>(mut self, name: K, value: V) -> Result<Self, ClientError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        insert_metadata(&mut self.headers, name.as_ref(), value.as_ref())?;
        Ok(self)
    }

    /// Get the metadata headers.
    pub fn get_headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Add an observability tag.
    pub fn tag<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Get the tags.
    pub fn get_tags(&self) -> &Tags {
        &self.tags
    }

    /// Timeout for a unary call: the configured one or
    /// [`DEFAULT_UNARY_TIMEOUT`].
    pub(crate) fn unary_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_UNARY_TIMEOUT)
    }
}

impl TryFrom<&Value> for CallOptions {
    type Error = ClientError;

    /// Parse `{ metadata, tags, timeout }`. `null` means defaults.
    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        let Some(params) = as_params(value, "call")? else {
            return Ok(Self::default());
        };

        let mut options = CallOptions::new();
        for (key, value) in params {
            match key.as_str() {
                "metadata" => options.headers = parse_metadata(value)?,
                "tags" => options.tags = parse_tags(value)?,
                "timeout" => options.timeout = parse_timeout(value)?,
                other => {
                    return Err(ClientError::InvalidArgument(format!(
                        "unknown call param: {other:?}"
                    )));
                }
            }
        }
        Ok(options)
    }
}

/// Options for [`Client::connect`](crate::Client::connect).
///
/// # Example
///
/// ```
/// use grpcweb_client::ConnectParams;
/// use serde_json::json;
///
/// let params = ConnectParams::try_from(&json!({
///     "reflect": true,
///     "metadata": { "x-api-key": "secret" },
/// }))
/// .unwrap();
/// assert!(params.get_reflect());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    pub(crate) reflect: bool,
    pub(crate) headers: HeaderMap,
}

impl ConnectParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discover the schema through server reflection while connecting.
    pub fn reflect(mut self, enabled: bool) -> Self {
        self.reflect = enabled;
        self
    }

    pub fn get_reflect(&self) -> bool {
        self.reflect
    }

    /// Metadata sent with every call on this connection.
    pub fn try_header<K, V>(mut self, name: K, value: V) -> Result<Self, ClientError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        insert_metadata(&mut self.headers, name.as_ref(), value.as_ref())?;
        Ok(self)
    }

    pub fn get_headers(&self) -> &HeaderMap {
        &self.headers
    }
}

impl TryFrom<&Value> for ConnectParams {
    type Error = ClientError;

    /// Parse `{ reflect, metadata }`. `null` means defaults.
    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        let Some(params) = as_params(value, "connect")? else {
            return Ok(Self::default());
        };

        let mut out = ConnectParams::new();
        for (key, value) in params {
            match key.as_str() {
                "reflect" => {
                    out.reflect = value.as_bool().ok_or_else(|| {
                        ClientError::InvalidArgument("reflect value must be boolean".into())
                    })?;
                }
                "metadata" => out.headers = parse_metadata(value)?,
                other => {
                    return Err(ClientError::InvalidArgument(format!(
                        "unknown connect param: {other:?}"
                    )));
                }
            }
        }
        Ok(out)
    }
}

fn as_params<'a>(value: &'a Value, what: &str) -> Result<Option<&'a Map<String, Value>>, ClientError> {
    match value {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        _ => Err(ClientError::InvalidArgument(format!(
            "{what} params must be an object"
        ))),
    }
}

fn parse_metadata(value: &Value) -> Result<HeaderMap, ClientError> {
    let mut headers = HeaderMap::new();
    let entries = match value {
        Value::Null => return Ok(headers),
        Value::Object(entries) => entries,
        _ => {
            return Err(ClientError::InvalidMetadata(
                "metadata must be an object".into(),
            ));
        }
    };

    for (key, value) in entries {
        let Value::String(value) = value else {
            return Err(ClientError::InvalidMetadata(format!(
                "{key:?} value must be string"
            )));
        };
        insert_metadata(&mut headers, key, value)?;
    }
    Ok(headers)
}

fn parse_tags(value: &Value) -> Result<Tags, ClientError> {
    let mut tags = Tags::new();
    let entries = match value {
        Value::Null => return Ok(tags),
        Value::Object(entries) => entries,
        _ => return Err(ClientError::InvalidArgument("tags must be an object".into())),
    };

    for (key, value) in entries {
        let Value::String(value) = value else {
            return Err(ClientError::InvalidArgument(format!(
                "tag {key:?} value must be string"
            )));
        };
        tags.insert(key.clone(), value.clone());
    }
    Ok(tags)
}

/// Numbers are milliseconds; strings are durations like `"1m30s"`.
/// Zero and negative values mean "unset".
fn parse_timeout(value: &Value) -> Result<Option<Duration>, ClientError> {
    let millis = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ClientError::InvalidArgument("invalid timeout".into()))?,
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(n) => n,
            Err(_) => parse_duration_millis(s)?,
        },
        _ => {
            return Err(ClientError::InvalidArgument(
                "timeout must be a number of milliseconds or a duration string".into(),
            ));
        }
    };

    if !millis.is_finite() || millis <= 0.0 {
        return Ok(None);
    }
    Duration::try_from_secs_f64(millis / 1000.0)
        .map(Some)
        .map_err(|_| ClientError::InvalidArgument(format!("timeout out of range: {millis}ms")))
}

/// Parse a duration string such as `"300ms"`, `"1.5s"`, `"2h45m"`, or
/// `"-1s"` into (possibly negative) milliseconds.
pub fn parse_duration_millis(input: &str) -> Result<f64, ClientError> {
    let invalid = || ClientError::InvalidArgument(format!("invalid duration {input:?}"));

    let mut rest = input.trim();
    let negative = match rest.as_bytes().first() {
        Some(b'-') => {
            rest = &rest[1..];
            true
        }
        Some(b'+') => {
            rest = &rest[1..];
            false
        }
        _ => false,
    };
    if rest.is_empty() {
        return Err(invalid());
    }
    if rest == "0" {
        return Ok(0.0);
    }

    let mut total = 0.0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_len == 0 {
            return Err(invalid());
        }
        let number: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-6,
            "us" | "µs" | "μs" => 1e-3,
            "ms" => 1.0,
            "s" => 1e3,
            "m" => 60e3,
            "h" => 3600e3,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total += number * scale;
    }

    Ok(if negative { -total } else { total })
}

/// Headers the client sets itself.
pub(crate) fn is_reserved_header(name: &HeaderName) -> bool {
    let name = name.as_str();
    name.starts_with("grpc-")
        || name == "content-type"
        || name == "content-length"
        || name == "te"
        || name == "x-grpc-web"
        || name == "x-user-agent"
}

fn insert_metadata(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), ClientError> {
    let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
        .map_err(|_| ClientError::InvalidMetadata(format!("invalid metadata key {name:?}")))?;
    if is_reserved_header(&name) {
        return Err(ClientError::InvalidMetadata(format!(
            "metadata key {:?} is reserved",
            name.as_str()
        )));
    }
    let value = HeaderValue::from_str(value).map_err(|_| {
        ClientError::InvalidMetadata(format!("invalid value for metadata key {:?}", name.as_str()))
    })?;
    headers.append(name, value);
    Ok(())
}

/// Maximum digits allowed in a `grpc-timeout` value.
const MAX_TIMEOUT_DIGITS: u128 = 99_999_999;

/// Convert a Duration to a `grpc-timeout` header value (`<n><unit>`).
///
/// Picks the finest unit whose value fits in eight digits.
pub(crate) fn duration_to_timeout_header(duration: Duration) -> Option<String> {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return None;
    }

    const UNITS: [(u128, char); 6] = [
        (1, 'n'),
        (1_000, 'u'),
        (1_000_000, 'm'),
        (1_000_000_000, 'S'),
        (60_000_000_000, 'M'),
        (3_600_000_000_000, 'H'),
    ];
    UNITS.iter().find_map(|&(per_unit, unit)| {
        let value = nanos.div_ceil(per_unit);
        (value <= MAX_TIMEOUT_DIGITS).then(|| format!("{value}{unit}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_options_default() {
        let options = CallOptions::new();
        assert!(options.timeout.is_none());
        assert_eq!(options.unary_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_zero_timeout_is_unset() {
        let options = CallOptions::new().timeout(Duration::ZERO);
        assert_eq!(options.get_timeout(), None);
    }

    #[test]
    fn test_call_options_from_value() {
        let options = CallOptions::try_from(&json!({
            "metadata": { "X-Request-Id": "abc-123" },
            "tags": { "scenario": "smoke" },
            "timeout": "1.5s",
        }))
        .unwrap();

        assert_eq!(options.get_headers().get("x-request-id").unwrap(), "abc-123");
        assert_eq!(options.get_tags().get("scenario").unwrap(), "smoke");
        assert_eq!(options.get_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_non_string_metadata_rejected() {
        let err = CallOptions::try_from(&json!({ "metadata": { "x-count": 3 } })).unwrap_err();
        assert!(matches!(err, ClientError::InvalidMetadata(ref m) if m == "\"x-count\" value must be string"));
    }

    #[test]
    fn test_reserved_metadata_rejected() {
        let err = CallOptions::try_from(&json!({ "metadata": { "grpc-timeout": "1S" } })).unwrap_err();
        assert!(matches!(err, ClientError::InvalidMetadata(_)));
    }

    #[test]
    fn test_unknown_param_rejected() {
        let err = CallOptions::try_from(&json!({ "retries": 3 })).unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[test]
    fn test_numeric_timeout_is_millis() {
        let options = CallOptions::try_from(&json!({ "timeout": 250 })).unwrap();
        assert_eq!(options.get_timeout(), Some(Duration::from_millis(250)));

        let options = CallOptions::try_from(&json!({ "timeout": "250" })).unwrap();
        assert_eq!(options.get_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_non_positive_timeout_is_unset() {
        for timeout in [json!(0), json!(-5), json!("-1s"), json!("0")] {
            let options = CallOptions::try_from(&json!({ "timeout": timeout })).unwrap();
            assert_eq!(options.unary_timeout(), DEFAULT_UNARY_TIMEOUT);
        }
    }

    #[test]
    fn test_out_of_range_timeout_rejected() {
        for timeout in [json!(1e30), json!("1e30")] {
            let err = CallOptions::try_from(&json!({ "timeout": timeout })).unwrap_err();
            assert!(matches!(err, ClientError::InvalidArgument(ref m) if m.contains("out of range")));
        }
    }

    #[test]
    fn test_huge_timeout_omits_header() {
        assert_eq!(duration_to_timeout_header(Duration::MAX), None);
    }

    #[test]
    fn test_timeout_wrong_type() {
        assert!(CallOptions::try_from(&json!({ "timeout": true })).is_err());
        assert!(CallOptions::try_from(&json!({ "timeout": "soon" })).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_millis("300ms").unwrap(), 300.0);
        assert_eq!(parse_duration_millis("2h45m").unwrap(), 9_900_000.0);
        assert_eq!(parse_duration_millis("1m30s").unwrap(), 90_000.0);
        assert!((parse_duration_millis("1500us").unwrap() - 1.5).abs() < 1e-9);
        assert_eq!(parse_duration_millis("-2s").unwrap(), -2000.0);
        assert!(parse_duration_millis("").is_err());
        assert!(parse_duration_millis("5").is_err());
        assert!(parse_duration_millis("5 days").is_err());
        assert!(parse_duration_millis("s").is_err());
    }

    #[test]
    fn test_connect_params() {
        let params = ConnectParams::try_from(&json!({
            "reflect": true,
            "metadata": { "authorization": "Bearer t" },
        }))
        .unwrap();
        assert!(params.get_reflect());
        assert_eq!(params.get_headers().len(), 1);

        let params = ConnectParams::try_from(&Value::Null).unwrap();
        assert!(!params.get_reflect());
    }

    #[test]
    fn test_connect_params_bad_reflect() {
        let err = ConnectParams::try_from(&json!({ "reflect": "yes" })).unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(ref m) if m == "reflect value must be boolean"));
    }

    #[test]
    fn test_duration_to_timeout_header() {
        assert_eq!(duration_to_timeout_header(Duration::ZERO), None);
        assert_eq!(
            duration_to_timeout_header(Duration::from_millis(1)),
            Some("1000000n".into())
        );
        assert_eq!(
            duration_to_timeout_header(Duration::from_secs(120)),
            Some("120000m".into())
        );
        assert_eq!(
            duration_to_timeout_header(Duration::from_secs(3600)),
            Some("3600000m".into())
        );
    }
}
