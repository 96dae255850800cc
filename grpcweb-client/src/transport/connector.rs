//! TLS connector setup for the hyper HTTP client.
//!
//! TLS needs both a crypto provider and root certificates:
//!
//! - **Crypto providers** (choose one): `tls-ring` (default with `tls`) or
//!   `tls-aws-lc`. Without either, a globally installed rustls provider is
//!   used if present.
//! - **Root certificates** (choose one): `tls-native-roots` (default with
//!   `tls`) or `tls-webpki-roots`.

use std::sync::Arc;

use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use rustls::ClientConfig;

use crate::ClientError;

/// Whether both a crypto provider and root certificates are compiled in.
#[inline]
pub const fn has_tls_support() -> bool {
    cfg!(any(feature = "tls-ring", feature = "tls-aws-lc"))
        && cfg!(any(feature = "tls-native-roots", feature = "tls-webpki-roots"))
}

/// Feature-gated provider first, then the process-wide default.
fn crypto_provider() -> Option<Arc<rustls::crypto::CryptoProvider>> {
    #[cfg(feature = "tls-ring")]
    return Some(Arc::new(rustls::crypto::ring::default_provider()));

    #[cfg(all(feature = "tls-aws-lc", not(feature = "tls-ring")))]
    return Some(Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    #[cfg(not(any(feature = "tls-ring", feature = "tls-aws-lc")))]
    rustls::crypto::CryptoProvider::get_default().cloned()
}

/// Build the default TLS configuration from the enabled features.
///
/// Returns `Ok(None)` when no crypto provider is available.
pub fn default_tls_config() -> Result<Option<ClientConfig>, ClientError> {
    let Some(provider) = crypto_provider() else {
        return Ok(None);
    };
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ClientError::Transport(format!("tls setup failed: {}", e)))?
        .with_root_certificates(build_root_store())
        .with_no_client_auth();
    Ok(Some(config))
}

fn build_root_store() -> rustls::RootCertStore {
    #[allow(unused_mut)]
    let mut roots = rustls::RootCertStore::empty();

    #[cfg(feature = "tls-native-roots")]
    {
        let native = rustls_native_certs::load_native_certs();
        if !native.errors.is_empty() {
            tracing::debug!(errors = ?native.errors, "errors loading native certs");
        }
        roots.add_parsable_certificates(native.certs);
    }

    #[cfg(all(feature = "tls-webpki-roots", not(feature = "tls-native-roots")))]
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    roots
}

/// Build an HTTP/1.1 connector that speaks both `http://` and `https://`.
///
/// Fails when no TLS configuration is given and none can be built from the
/// enabled features.
pub fn build_https_connector(
    tls_config: Option<ClientConfig>,
) -> Result<HttpsConnector<HttpConnector>, ClientError> {
    let config = match tls_config {
        Some(config) => config,
        None => default_tls_config()?.ok_or_else(|| {
            ClientError::Transport(
                "no TLS crypto provider: enable `tls-ring` or `tls-aws-lc`, \
                 or install a process-wide rustls provider"
                    .into(),
            )
        })?,
    };

    Ok(HttpsConnectorBuilder::new()
        .with_tls_config(config)
        .https_or_http()
        .enable_http1()
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_tls_support_matches_features() {
        let expected = cfg!(any(feature = "tls-ring", feature = "tls-aws-lc"))
            && cfg!(any(feature = "tls-native-roots", feature = "tls-webpki-roots"));
        assert_eq!(has_tls_support(), expected);
    }

    #[cfg(feature = "tls-ring")]
    #[test]
    fn test_default_tls_config_with_ring() {
        assert!(default_tls_config().unwrap().is_some());
        assert!(build_https_connector(None).is_ok());
    }
}
