//! Compression encoding negotiation.
//!
//! gRPC-Web advertises accepted algorithms with `grpc-accept-encoding` and
//! names the algorithm used for compressed frames with `grpc-encoding`.

use crate::codec::BoxedCodec;

#[cfg(feature = "compression-gzip")]
use crate::codec::GzipCodec;

/// Header naming the algorithm used for compressed frames.
pub const GRPC_ENCODING: &str = "grpc-encoding";

/// Header listing algorithms the sender can decompress.
pub const GRPC_ACCEPT_ENCODING: &str = "grpc-accept-encoding";

/// Supported compression encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionEncoding {
    #[default]
    Identity,
    #[cfg(feature = "compression-gzip")]
    Gzip,
}

impl CompressionEncoding {
    /// Parse from a `grpc-encoding` header value.
    ///
    /// Returns `None` for unsupported encodings.
    pub fn from_header(value: Option<&str>) -> Option<Self> {
        match value.map(str::trim) {
            None | Some("identity") | Some("") => Some(Self::Identity),
            #[cfg(feature = "compression-gzip")]
            Some("gzip") => Some(Self::Gzip),
            _ => None,
        }
    }

    /// Get the header value string for this encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            #[cfg(feature = "compression-gzip")]
            Self::Gzip => "gzip",
        }
    }

    /// Returns true if this encoding is identity.
    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }

    /// Get the codec for this encoding, `None` for identity.
    pub fn codec(&self) -> Option<BoxedCodec> {
        match self {
            Self::Identity => None,
            #[cfg(feature = "compression-gzip")]
            Self::Gzip => Some(BoxedCodec::new(GzipCodec)),
        }
    }
}

/// Value for `grpc-accept-encoding`, or `None` when only identity is
/// available.
pub fn accept_encoding_header() -> Option<&'static str> {
    if cfg!(feature = "compression-gzip") {
        Some("gzip")
    } else {
        None
    }
}
