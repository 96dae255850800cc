//! HTTP transport layer.
//!
//! [`Transport`] is the seam between the client and the network. The
//! default [`HyperTransport`] speaks HTTP/1.1 (TLS via rustls, feature-gated);
//! tests and embedders can inject their own.
//!
//! # Feature Flags
//!
//! - `tls` (default) - `tls-ring` + `tls-native-roots`
//! - `tls-ring` / `tls-aws-lc` - crypto providers
//! - `tls-native-roots` / `tls-webpki-roots` - root certificates

mod body;
mod connector;
mod hyper;

use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::combinators::UnsyncBoxBody;

use crate::ClientError;

pub use body::TransportBody;
pub use connector::{build_https_connector, default_tls_config, has_tls_support};
pub use hyper::{HyperTransport, HyperTransportBuilder};

pub use rustls::ClientConfig as TlsClientConfig;

/// Response body handed back by a [`Transport`].
pub type ResponseBody = UnsyncBoxBody<Bytes, ClientError>;

/// Sends one HTTP request and resolves with the response head; the body is
/// read afterwards.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: http::Request<TransportBody>,
    ) -> BoxFuture<'static, Result<http::Response<ResponseBody>, ClientError>>;
}
