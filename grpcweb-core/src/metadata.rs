//! Status extraction from gRPC-Web headers and trailers.
//!
//! A call's outcome is carried by `grpc-status`, `grpc-message`
//! (percent-encoded), and `grpc-status-details-bin` (base64 of a
//! serialized `google.rpc.Status`). They arrive either in the trailer frame
//! or, for trailers-only responses, in the response headers.

use base64::Engine;
use http::{HeaderMap, HeaderValue, StatusCode};
use prost::Message;

use crate::error::{Code, ErrorDetail, Status};

/// Status code header.
pub const GRPC_STATUS: &str = "grpc-status";

/// Status message header.
pub const GRPC_MESSAGE: &str = "grpc-message";

/// Binary status details header.
pub const GRPC_STATUS_DETAILS_BIN: &str = "grpc-status-details-bin";

/// `google.rpc.Status`, the payload of `grpc-status-details-bin`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<prost_types::Any>,
}

/// Read the status out of a header or trailer map.
///
/// Returns `None` when `grpc-status` is absent. An unparsable code becomes
/// [`Code::Unknown`]; undecodable details are dropped.
pub fn status_from_metadata(metadata: &HeaderMap) -> Option<Status> {
    let raw = metadata.get(GRPC_STATUS)?;

    let code = raw
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .and_then(Code::from_u32);
    let Some(code) = code else {
        return Some(Status::new(
            Code::Unknown,
            format!("invalid grpc-status: {:?}", raw),
        ));
    };

    let message = metadata
        .get(GRPC_MESSAGE)
        .and_then(|v| v.to_str().ok())
        .map(percent_decode)
        .filter(|m| !m.is_empty());

    let status = match message {
        Some(message) => Status::new(code, message),
        None => Status::from_code(code),
    };

    let details = metadata
        .get(GRPC_STATUS_DETAILS_BIN)
        .and_then(|v| decode_status_details(v.as_bytes()))
        .unwrap_or_default();

    Some(status.with_details(details))
}

/// Write a status into a header or trailer map.
pub fn insert_status(metadata: &mut HeaderMap, status: &Status) {
    metadata.insert(GRPC_STATUS, HeaderValue::from(status.code().as_u32()));
    if let Some(message) = status.message() {
        if let Ok(value) = HeaderValue::from_str(&percent_encode(message)) {
            metadata.insert(GRPC_MESSAGE, value);
        }
    }
    if !status.details().is_empty() {
        let encoded = encode_status_details(status);
        if let Ok(value) = HeaderValue::from_str(&encoded) {
            metadata.insert(GRPC_STATUS_DETAILS_BIN, value);
        }
    }
}

fn decode_status_details(raw: &[u8]) -> Option<Vec<ErrorDetail>> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};

    let raw = raw.trim_ascii();
    let bytes = STANDARD_NO_PAD
        .decode(raw)
        .or_else(|_| STANDARD.decode(raw))
        .ok()?;
    let status = RpcStatus::decode(bytes.as_slice()).ok()?;

    Some(
        status
            .details
            .into_iter()
            .map(|any| ErrorDetail::new(any.type_url, any.value))
            .collect(),
    )
}

/// Base64 (unpadded) `google.rpc.Status` for a status.
pub fn encode_status_details(status: &Status) -> String {
    use base64::engine::general_purpose::STANDARD_NO_PAD;

    let proto = RpcStatus {
        code: status.code().as_u32() as i32,
        message: status.message().unwrap_or_default().to_string(),
        details: status
            .details()
            .iter()
            .map(|d| prost_types::Any {
                type_url: d.type_url().to_string(),
                value: d.value().to_vec(),
            })
            .collect(),
    };
    STANDARD_NO_PAD.encode(proto.encode_to_vec())
}

/// Map a non-200 HTTP status to a gRPC code.
pub fn http_status_to_code(status: StatusCode) -> Code {
    match status.as_u16() {
        400 => Code::Internal,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::Unimplemented,
        429 | 502 | 503 | 504 => Code::Unavailable,
        _ => Code::Unknown,
    }
}

/// Decode a percent-encoded `grpc-message`.
///
/// Malformed escapes are kept verbatim.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Percent-encode a `grpc-message`: everything outside printable ASCII,
/// plus `%` itself.
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        if (0x20..=0x7e).contains(&b) && b != b'%' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
