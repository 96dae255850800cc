//! The dynamic gRPC-Web client.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use prost_reflect::MethodDescriptor;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{Instrument, info_span};

use crate::builder::ClientBuilder;
use crate::codec;
use crate::descriptor::{DescriptorStore, MethodInfo};
use crate::error::ClientError;
use crate::event_loop::{EventLoop, Promise, TaskQueue};
use crate::host::{ExecutionContext, FileAccessor, Metric, Phase, Tags, Telemetry, TelemetrySink};
use crate::loader;
use crate::options::{CallOptions, ConnectParams};
use crate::reflection::Reflector;
use crate::request::{build_request, open_stream, unary_exchange};
use crate::response::InvokeResponse;
use crate::stream::{self, Receiver, StreamHandle};
use crate::transport::{HyperTransport, Transport, TransportBody};

/// Where background work runs.
pub(crate) enum Runtime {
    Owned(Arc<tokio::runtime::Runtime>),
    Shared(Handle),
}

impl Runtime {
    fn handle(&self) -> &Handle {
        match self {
            Runtime::Owned(runtime) => runtime.handle(),
            Runtime::Shared(handle) => handle,
        }
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        match self {
            Runtime::Owned(runtime) => runtime.block_on(future),
            Runtime::Shared(handle) => handle.block_on(future),
        }
    }
}

/// The one logical connection set up by [`Client::connect`].
struct Connection {
    base_url: String,
    transport: Arc<dyn Transport>,
    headers: HeaderMap,
}

/// A call whose arguments have been validated and encoded.
pub(crate) struct PreparedCall {
    transport: Arc<dyn Transport>,
    request: http::Request<TransportBody>,
    method: MethodDescriptor,
    path: String,
    timeout: Option<Duration>,
    tags: Tags,
    telemetry: Telemetry,
}

impl PreparedCall {
    /// Run a unary call to completion.
    ///
    /// Server rejections come back as a non-OK [`InvokeResponse`].
    /// Transport failures, timeouts and undecodable responses are errors.
    pub(crate) async fn unary(self) -> Result<InvokeResponse, ClientError> {
        let span = info_span!(
            "rpc.call",
            rpc.system = "grpc_web",
            rpc.method = %self.path,
            rpc.type = "unary",
            otel.kind = "client",
        );
        let PreparedCall {
            transport,
            request,
            method,
            timeout,
            tags,
            telemetry,
            ..
        } = self;
        let timeout = timeout.unwrap_or(crate::options::DEFAULT_UNARY_TIMEOUT);

        async move {
            let started = Instant::now();
            let result = tokio::time::timeout(timeout, unary_exchange(&*transport, request)).await;
            telemetry.push(
                Metric::ReqDuration,
                started.elapsed().as_secs_f64() * 1000.0,
                &tags,
            );

            let exchange = match result {
                Ok(exchange) => exchange?,
                Err(_) => return Err(ClientError::TimedOut(timeout)),
            };

            let response = match exchange.outcome {
                Ok(frame) => {
                    let message = frame.decode(&method.output())?;
                    InvokeResponse::ok(exchange.headers, exchange.trailers, message)
                }
                Err(status) => InvokeResponse::failed(exchange.headers, exchange.trailers, status),
            };
            tracing::debug!(status = %response.status, "unary call finished");
            Ok(response)
        }
        .instrument(span)
        .await
    }
}

/// Dynamic gRPC-Web client.
///
/// Schemas are registered at run time with [`load`](Client::load) or
/// through server reflection in [`connect`](Client::connect). Calls take
/// and return `serde_json::Value`s.
///
/// Blocking methods run on the client's tokio runtime; results of
/// [`async_invoke`](Client::async_invoke) and stream events are delivered
/// through the [`EventLoop`] the client was built with.
pub struct Client {
    event_loop: EventLoop,
    context: Arc<dyn ExecutionContext>,
    accessor: Arc<dyn FileAccessor>,
    telemetry: Arc<dyn TelemetrySink>,
    injected: Option<Arc<dyn Transport>>,
    runtime: Runtime,
    user_agent: String,
    store: DescriptorStore,
    connection: Option<Connection>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("methods", &self.store.len())
            .field(
                "address",
                &self.connection.as_ref().map(|c| c.base_url.as_str()),
            )
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl Client {
    /// Start building a client.
    pub fn builder(event_loop: EventLoop, context: Arc<dyn ExecutionContext>) -> ClientBuilder {
        ClientBuilder::new(event_loop, context)
    }

    pub(crate) fn from_parts(
        event_loop: EventLoop,
        context: Arc<dyn ExecutionContext>,
        accessor: Arc<dyn FileAccessor>,
        telemetry: Arc<dyn TelemetrySink>,
        injected: Option<Arc<dyn Transport>>,
        runtime: Runtime,
        user_agent: String,
    ) -> Self {
        Self {
            event_loop,
            context,
            accessor,
            telemetry,
            injected,
            runtime,
            user_agent,
            store: DescriptorStore::new(),
            connection: None,
        }
    }

    /// Compile `.proto` files and register their methods.
    ///
    /// Only allowed in the init phase. Relative import paths resolve against
    /// the context's working directory, which is also the only import path
    /// when none are given.
    pub fn load<P, F>(&mut self, import_paths: &[P], filenames: &[F]) -> Result<Vec<MethodInfo>, ClientError>
    where
        P: AsRef<Path>,
        F: AsRef<Path>,
    {
        if self.context.phase() != Phase::Init {
            return Err(ClientError::Sequencing(
                "load must be called in the init context".into(),
            ));
        }
        let set = loader::compile(
            self.accessor.clone(),
            &self.context.working_dir(),
            import_paths,
            filenames,
        )?;
        self.store.register(set)
    }

    /// Connect to `address` (`http://` or `https://`).
    ///
    /// With `reflect` set, the server's schema is fetched and registered and
    /// its methods are returned.
    pub fn connect(&mut self, address: &str, params: ConnectParams) -> Result<Vec<MethodInfo>, ClientError> {
        if self.context.phase() != Phase::Execution {
            return Err(ClientError::Sequencing(
                "connecting to a gRPC-Web server in the init context is not supported".into(),
            ));
        }
        let base_url = parse_address(address)?;
        let transport: Arc<dyn Transport> = match &self.injected {
            Some(transport) => transport.clone(),
            None => Arc::new(HyperTransport::new()?),
        };

        let mut methods = Vec::new();
        if params.reflect {
            let set = self.runtime.block_on(
                Reflector::new(&*transport, &base_url, &params.headers, &self.user_agent).fetch_all(),
            )?;
            methods = self.store.register(set)?;
        }

        tracing::debug!(address = %base_url, reflect = params.reflect, "connected");
        self.connection = Some(Connection {
            base_url,
            transport,
            headers: params.headers,
        });
        Ok(methods)
    }

    /// Call a unary method and wait for the response.
    pub fn invoke(&self, path: &str, request: &Value, options: CallOptions) -> Result<InvokeResponse, ClientError> {
        let call = self.prepare(path, request, options, true)?;
        self.runtime.block_on(call.unary())
    }

    /// Start a unary call and return a promise settled on the event loop.
    ///
    /// Argument and sequencing errors are returned immediately.
    pub fn async_invoke(
        &self,
        path: &str,
        request: &Value,
        options: CallOptions,
    ) -> Result<Promise<InvokeResponse>, ClientError> {
        let call = self.prepare(path, request, options, true)?;
        let (promise, resolver) = Promise::new(&self.event_loop);
        self.runtime.handle().spawn(async move {
            resolver.settle(call.unary().await);
        });
        Ok(promise)
    }

    /// Open a server-streaming call.
    ///
    /// Returns once the response head has arrived. Register listeners on the
    /// handle; events are delivered by the event loop.
    pub fn stream(&self, path: &str, request: &Value, options: CallOptions) -> Result<StreamHandle, ClientError> {
        let call = self.prepare(path, request, options, false)?;
        let span = info_span!(
            "rpc.call",
            rpc.system = "grpc_web",
            rpc.method = %call.path,
            rpc.type = "server_stream",
            otel.kind = "client",
        );

        let PreparedCall {
            transport,
            request,
            method,
            path,
            timeout,
            tags,
            telemetry,
        } = call;

        let (opened, deadline) = self.runtime.block_on(
            async {
                let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
                let opened = match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, open_stream(&*transport, request))
                        .await
                        .map_err(|_| ClientError::TimedOut(timeout.unwrap_or_default()))?,
                    None => open_stream(&*transport, request).await,
                }?;
                Ok::<_, ClientError>((opened, deadline))
            }
            .instrument(span.clone()),
        )?;

        telemetry.push(Metric::Streams, 1.0, &tags);

        let (handle, task) = stream::start(
            opened,
            Receiver {
                method,
                path,
                queue: TaskQueue::new(&self.event_loop),
                telemetry,
                tags,
                deadline,
                done: self.context.cancellation(),
            },
        );
        self.runtime.handle().spawn(task.instrument(span));
        Ok(handle)
    }

    /// Drop the connection. Later calls fail until `connect` is called again.
    pub fn close(&mut self) {
        self.connection = None;
    }

    /// Summaries of every registered method.
    pub fn methods(&self) -> Vec<MethodInfo> {
        self.store.methods()
    }

    /// The schema pool and method index this client resolves calls against.
    pub fn store(&self) -> &DescriptorStore {
        &self.store
    }

    /// The loop that delivers stream events and settles promises. Run it on
    /// the host thread.
    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// The `user-agent` sent with every request.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Validate and encode a call. `unary` selects the timeout default.
    pub(crate) fn prepare(
        &self,
        path: &str,
        request: &Value,
        options: CallOptions,
        unary: bool,
    ) -> Result<PreparedCall, ClientError> {
        if self.context.phase() != Phase::Execution {
            return Err(ClientError::Sequencing(
                "invoking RPC methods in the init context is not supported".into(),
            ));
        }
        let Some(connection) = &self.connection else {
            return Err(ClientError::Sequencing("no connection, call connect first".into()));
        };
        let method = self.store.resolve(path)?;
        if request.is_null() {
            return Err(ClientError::InvalidArgument("request cannot be null".into()));
        }

        let timeout = if unary {
            Some(options.unary_timeout())
        } else {
            options.timeout
        };

        let mut tags = self.context.tags();
        tags.extend(options.tags);
        tags.insert("url".into(), format!("{}{}", connection.base_url, path));
        tags.insert("service".into(), method.parent_service().full_name().to_string());
        tags.insert("method".into(), method.name().to_string());

        let mut headers = connection.headers.clone();
        for name in options.headers.keys() {
            headers.remove(name);
        }
        for (name, value) in options.headers.iter() {
            headers.append(name.clone(), value.clone());
        }

        let payload = codec::encode(&method.input(), request)?;
        let request = build_request(
            &connection.base_url,
            path,
            &headers,
            &self.user_agent,
            timeout,
            &payload,
        )?;

        Ok(PreparedCall {
            transport: connection.transport.clone(),
            request,
            method,
            path: path.to_string(),
            timeout,
            tags,
            telemetry: Telemetry::new(self.telemetry.clone(), self.context.cancellation()),
        })
    }
}

/// Check the scheme and drop a trailing `/`.
fn parse_address(address: &str) -> Result<String, ClientError> {
    let uri: http::Uri = address
        .parse()
        .map_err(|e| ClientError::InvalidArgument(format!("invalid address {address:?}: {}", e)))?;
    match uri.scheme_str() {
        Some("http") | Some("https") if uri.authority().is_some() => {}
        _ => {
            return Err(ClientError::InvalidArgument(format!(
                "address must be an absolute http:// or https:// URL, got {address:?}"
            )));
        }
    }
    Ok(address.trim_end_matches('/').to_string())
}
