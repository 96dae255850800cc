//! Decompression codecs for response frames.
//!
//! gRPC-Web compresses individual message frames (flag `0x01`) with the
//! algorithm named in `grpc-encoding`. Identity needs no codec.
//! - [`GzipCodec`]: gzip (requires the `compression-gzip` feature)

use bytes::Bytes;
use std::io;
use std::sync::Arc;

#[cfg(feature = "compression-gzip")]
use std::io::Read;

#[cfg(feature = "compression-gzip")]
use flate2::read::GzDecoder;

/// Codec trait for per-message decompression.
pub trait Codec: Send + Sync + 'static {
    /// The encoding name used in `grpc-encoding` headers.
    fn name(&self) -> &'static str;

    /// Decompress data.
    fn decompress(&self, data: &[u8]) -> io::Result<Bytes>;
}

/// A boxed codec for type-erased storage.
///
/// Use `Option<BoxedCodec>` where `None` represents identity.
#[derive(Clone)]
pub struct BoxedCodec(Arc<dyn Codec>);

impl BoxedCodec {
    /// Create a new boxed codec.
    pub fn new<C: Codec>(codec: C) -> Self {
        BoxedCodec(Arc::new(codec))
    }

    /// Get the codec name.
    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    /// Decompress data.
    pub fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        self.0.decompress(data)
    }
}

impl std::fmt::Debug for BoxedCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BoxedCodec").field(&self.name()).finish()
    }
}

/// Gzip codec using flate2.
#[cfg(feature = "compression-gzip")]
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCodec;

#[cfg(feature = "compression-gzip")]
impl Codec for GzipCodec {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        Ok(Bytes::from(decompressed))
    }
}
