//! Client builder.
//!
//! Provides a fluent API for configuring and building a [`Client`].

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::client::{Client, Runtime};
use crate::error::ClientError;
use crate::event_loop::EventLoop;
use crate::host::{ExecutionContext, FileAccessor, NoopSink, OsFileAccessor, TelemetrySink};
use crate::request::DEFAULT_USER_AGENT;
use crate::transport::Transport;

/// Builder for creating a [`Client`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use grpcweb_client::{ClientBuilder, EventLoop, HostContext};
///
/// let event_loop = EventLoop::new();
/// let ctx = Arc::new(HostContext::new("."));
/// let client = ClientBuilder::new(event_loop, ctx)
///     .user_agent("load-test/1.0")
///     .build()
///     .unwrap();
/// assert!(client.methods().is_empty());
/// ```
pub struct ClientBuilder {
    event_loop: EventLoop,
    context: Arc<dyn ExecutionContext>,
    /// Reads `.proto` files for [`Client::load`].
    accessor: Arc<dyn FileAccessor>,
    telemetry: Arc<dyn TelemetrySink>,
    /// Replaces the hyper transport `connect` would build.
    transport: Option<Arc<dyn Transport>>,
    runtime: Option<Handle>,
    user_agent: String,
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("event_loop", &self.event_loop)
            .field("phase", &self.context.phase())
            .field("transport", &self.transport.is_some())
            .field("runtime", &self.runtime.is_some())
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl ClientBuilder {
    /// Create a builder bound to an event loop and the caller's context.
    pub fn new(event_loop: EventLoop, context: Arc<dyn ExecutionContext>) -> Self {
        Self {
            event_loop,
            context,
            accessor: Arc::new(OsFileAccessor),
            telemetry: Arc::new(NoopSink),
            transport: None,
            runtime: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    /// Read schema files through `accessor` instead of the filesystem.
    pub fn file_accessor<A: FileAccessor>(mut self, accessor: A) -> Self {
        self.accessor = Arc::new(accessor);
        self
    }

    /// Send metric samples to `sink`.
    pub fn telemetry<S: TelemetrySink>(mut self, sink: S) -> Self {
        self.telemetry = Arc::new(sink);
        self
    }

    /// Use `transport` for every request instead of building one in
    /// [`Client::connect`].
    pub fn transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Run network work on an existing tokio runtime.
    ///
    /// The client's blocking methods must then be called from a thread that
    /// is not itself driving that runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Set the `x-user-agent` header value.
    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Build the client. Creates a multi-threaded runtime unless one was
    /// supplied.
    pub fn build(self) -> Result<Client, ClientError> {
        if http::HeaderValue::from_str(&self.user_agent).is_err() {
            return Err(ClientError::InvalidArgument(format!(
                "invalid user agent {:?}",
                self.user_agent
            )));
        }

        let runtime = match self.runtime {
            Some(handle) => Runtime::Shared(handle),
            None => Runtime::Owned(Arc::new(
                tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .thread_name("grpcweb-client")
                    .build()
                    .map_err(|e| ClientError::Transport(format!("failed to start runtime: {}", e)))?,
            )),
        };

        Ok(Client::from_parts(
            self.event_loop,
            self.context,
            self.accessor,
            self.telemetry,
            self.transport,
            runtime,
            self.user_agent,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostContext;

    #[test]
    fn test_build_with_defaults() {
        let client = ClientBuilder::new(EventLoop::new(), Arc::new(HostContext::new("/tmp")))
            .build()
            .unwrap();
        assert!(client.methods().is_empty());
        assert!(client.user_agent().starts_with("grpcweb-rust/"));
    }

    #[test]
    fn test_invalid_user_agent() {
        let err = ClientBuilder::new(EventLoop::new(), Arc::new(HostContext::new("/tmp")))
            .user_agent("bad\nagent")
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }
}
