//! Hyper-based HTTP transport.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use rustls::ClientConfig;

use super::body::TransportBody;
use super::connector::build_https_connector;
use super::{ResponseBody, Transport};
use crate::ClientError;

type HyperClient = Client<HttpsConnector<HttpConnector>, TransportBody>;

/// HTTP/1.1 transport on hyper_util's legacy client.
///
/// One logical connection per client: by default at most one idle
/// connection is kept per host.
#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport").finish_non_exhaustive()
    }
}

impl HyperTransport {
    /// Create a new transport builder.
    pub fn builder() -> HyperTransportBuilder {
        HyperTransportBuilder::new()
    }

    /// Create a transport with default settings.
    pub fn new() -> Result<Self, ClientError> {
        Self::builder().build()
    }
}

impl Transport for HyperTransport {
    fn send(
        &self,
        request: http::Request<TransportBody>,
    ) -> BoxFuture<'static, Result<http::Response<ResponseBody>, ClientError>> {
        let client = self.client.clone();
        async move {
            let response = client
                .request(request)
                .await
                .map_err(|e| ClientError::Transport(format!("request failed: {}", e)))?;
            Ok(response.map(|body| {
                body.map_err(|e| ClientError::Transport(format!("response body: {}", e)))
                    .boxed_unsync()
            }))
        }
        .boxed()
    }
}

/// Builder for [`HyperTransport`].
pub struct HyperTransportBuilder {
    tls_config: Option<ClientConfig>,
    pool_idle_timeout: Option<Duration>,
    pool_max_idle_per_host: usize,
}

impl Default for HyperTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HyperTransportBuilder {
    pub fn new() -> Self {
        Self {
            tls_config: None,
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 1,
        }
    }

    /// Use a custom TLS configuration (roots, client certificates).
    pub fn tls_config(mut self, config: ClientConfig) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Close pooled connections idle for longer than `timeout`.
    ///
    /// Default: 90 seconds.
    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = Some(timeout);
        self
    }

    /// Maximum idle connections kept per host.
    ///
    /// Default: 1.
    pub fn pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.pool_max_idle_per_host = max;
        self
    }

    /// Build the transport.
    pub fn build(self) -> Result<HyperTransport, ClientError> {
        let connector = build_https_connector(self.tls_config)?;

        let mut builder = Client::builder(TokioExecutor::new());
        builder.pool_timer(TokioTimer::new());
        if let Some(timeout) = self.pool_idle_timeout {
            builder.pool_idle_timeout(timeout);
        }
        builder.pool_max_idle_per_host(self.pool_max_idle_per_host);

        Ok(HyperTransport {
            client: builder.build(connector),
        })
    }
}

impl std::fmt::Debug for HyperTransportBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransportBuilder")
            .field("tls_config", &self.tls_config.is_some())
            .field("pool_idle_timeout", &self.pool_idle_timeout)
            .field("pool_max_idle_per_host", &self.pool_max_idle_per_host)
            .finish()
    }
}
