//! gRPC-Web envelope framing.
//!
//! Every message and the final trailer block travel in the same envelope:
//!
//! ```text
//! [flags:1][length:4][payload:length]
//! ```
//!
//! The high bit of `flags` marks the trailer frame, the low bit marks a
//! compressed payload.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::compression::CompressionEncoding;
use crate::error::EnvelopeError;

/// gRPC-Web envelope flags.
pub mod envelope_flags {
    /// Regular message (uncompressed).
    pub const MESSAGE: u8 = 0x00;
    /// Compressed payload.
    pub const COMPRESSED: u8 = 0x01;
    /// Trailer frame, carries `grpc-status` and friends.
    pub const TRAILERS: u8 = 0x80;
}

/// Envelope header size (flags + length).
pub const ENVELOPE_HEADER_SIZE: usize = 5;

/// Payload of one envelope after flag validation and decompression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// A serialized message.
    Message(Bytes),
    /// The trailer block, still in `name: value\r\n` form.
    Trailers(Bytes),
}

/// Wrap payload in a gRPC-Web message envelope.
pub fn wrap_envelope(payload: &[u8], compressed: bool) -> Vec<u8> {
    let flags = if compressed {
        envelope_flags::COMPRESSED
    } else {
        envelope_flags::MESSAGE
    };
    frame(flags, payload)
}

/// Wrap a trailer map in a gRPC-Web trailer envelope.
pub fn wrap_trailers(trailers: &HeaderMap) -> Vec<u8> {
    frame(envelope_flags::TRAILERS, &encode_trailer_block(trailers))
}

fn frame(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ENVELOPE_HEADER_SIZE + payload.len());
    frame.push(flags);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Parse envelope header from bytes.
///
/// Returns `(flags, length)` if successful.
pub fn parse_envelope_header(data: &[u8]) -> Result<(u8, u32), EnvelopeError> {
    if data.len() < ENVELOPE_HEADER_SIZE {
        return Err(EnvelopeError::IncompleteHeader {
            expected: ENVELOPE_HEADER_SIZE,
            actual: data.len(),
        });
    }

    let flags = data[0];
    let length = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);

    Ok((flags, length))
}

/// Validate flags and decompress the payload of one envelope.
pub fn process_envelope_payload(
    flags: u8,
    payload: Bytes,
    encoding: CompressionEncoding,
) -> Result<Envelope, EnvelopeError> {
    let known = envelope_flags::TRAILERS | envelope_flags::COMPRESSED;
    if flags & !known != 0 {
        return Err(EnvelopeError::InvalidFlags(flags));
    }

    let payload = if flags & envelope_flags::COMPRESSED != 0 {
        decompress_payload(payload, encoding)?
    } else {
        payload
    };

    if flags & envelope_flags::TRAILERS != 0 {
        Ok(Envelope::Trailers(payload))
    } else {
        Ok(Envelope::Message(payload))
    }
}

fn decompress_payload(payload: Bytes, encoding: CompressionEncoding) -> Result<Bytes, EnvelopeError> {
    let Some(codec) = encoding.codec() else {
        return Err(EnvelopeError::MissingEncoding);
    };

    codec
        .decompress(&payload)
        .map_err(|e| EnvelopeError::Decompression(e.to_string()))
}

/// Parse a trailer block (`name: value` lines separated by CRLF).
///
/// Header names are case-insensitive and stored lowercased.
pub fn parse_trailer_block(block: &[u8]) -> Result<HeaderMap, EnvelopeError> {
    let text = std::str::from_utf8(block)
        .map_err(|_| EnvelopeError::InvalidTrailers("not valid UTF-8".into()))?;

    let mut trailers = HeaderMap::new();
    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| EnvelopeError::InvalidTrailers(format!("missing ':' in {line:?}")))?;
        let name = HeaderName::from_bytes(name.trim().to_ascii_lowercase().as_bytes())
            .map_err(|e| EnvelopeError::InvalidTrailers(e.to_string()))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| EnvelopeError::InvalidTrailers(e.to_string()))?;
        trailers.append(name, value);
    }

    Ok(trailers)
}

/// Serialize a trailer map into a trailer block.
pub fn encode_trailer_block(trailers: &HeaderMap) -> Vec<u8> {
    let mut block = Vec::new();
    for (name, value) in trailers {
        block.extend_from_slice(name.as_str().as_bytes());
        block.extend_from_slice(b": ");
        block.extend_from_slice(value.as_bytes());
        block.extend_from_slice(b"\r\n");
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_envelope_uncompressed() {
        let frame = wrap_envelope(b"hello", false);

        assert_eq!(frame[0], envelope_flags::MESSAGE);
        assert_eq!(
            u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]),
            5
        );
        assert_eq!(&frame[5..], b"hello");
    }

    #[test]
    fn test_parse_envelope_header() {
        let data = [0x80, 0x00, 0x00, 0x01, 0x02];
        let (flags, length) = parse_envelope_header(&data).unwrap();

        assert_eq!(flags, envelope_flags::TRAILERS);
        assert_eq!(length, 258);
    }

    #[test]
    fn test_parse_envelope_header_incomplete() {
        let err = parse_envelope_header(&[0x00, 0x00, 0x00]).unwrap_err();
        assert!(matches!(
            err,
            EnvelopeError::IncompleteHeader {
                expected: 5,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_process_envelope_payload_message() {
        let payload = Bytes::from_static(b"hello");
        let result = process_envelope_payload(
            envelope_flags::MESSAGE,
            payload.clone(),
            CompressionEncoding::Identity,
        )
        .unwrap();

        assert_eq!(result, Envelope::Message(payload));
    }

    #[test]
    fn test_process_envelope_payload_trailers() {
        let payload = Bytes::from_static(b"grpc-status: 0\r\n");
        let result = process_envelope_payload(
            envelope_flags::TRAILERS,
            payload.clone(),
            CompressionEncoding::Identity,
        )
        .unwrap();

        assert_eq!(result, Envelope::Trailers(payload));
    }

    #[test]
    fn test_process_envelope_payload_invalid_flags() {
        let result = process_envelope_payload(
            0x02,
            Bytes::from_static(b"x"),
            CompressionEncoding::Identity,
        );
        assert!(matches!(result, Err(EnvelopeError::InvalidFlags(0x02))));
    }

    #[test]
    fn test_compressed_frame_without_encoding() {
        let result = process_envelope_payload(
            envelope_flags::COMPRESSED,
            Bytes::from_static(b"x"),
            CompressionEncoding::Identity,
        );
        assert!(matches!(result, Err(EnvelopeError::MissingEncoding)));
    }

    #[test]
    fn test_parse_trailer_block() {
        let block = b"grpc-status: 5\r\nGrpc-Message: not%20found\r\nx-extra: a\r\nx-extra: b\r\n";
        let trailers = parse_trailer_block(block).unwrap();

        assert_eq!(trailers.get("grpc-status").unwrap(), "5");
        assert_eq!(trailers.get("grpc-message").unwrap(), "not%20found");
        assert_eq!(trailers.get_all("x-extra").iter().count(), 2);
    }

    #[test]
    fn test_parse_trailer_block_rejects_garbage() {
        assert!(parse_trailer_block(b"no colon here\r\n").is_err());
    }

    #[test]
    fn test_wrap_trailers_parses_back() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        let frame = wrap_trailers(&trailers);

        let (flags, length) = parse_envelope_header(&frame).unwrap();
        assert_eq!(flags, envelope_flags::TRAILERS);
        assert_eq!(length as usize, frame.len() - ENVELOPE_HEADER_SIZE);

        let parsed = parse_trailer_block(&frame[ENVELOPE_HEADER_SIZE..]).unwrap();
        assert_eq!(parsed.get("grpc-status").unwrap(), "0");
    }
}
