//! Dynamic gRPC-Web client for Rust.
//!
//! Calls services described by protobuf schemas that are only known at run
//! time, either compiled from `.proto` files or fetched through server
//! reflection. Requests and responses are `serde_json::Value`s.
//!
//! ## Features
//!
//! - Unary calls, blocking or settled through an [`EventLoop`] promise
//! - Server streaming with `data` / `error` / `end` listeners
//! - Schema loading with `protox`, or server reflection (v1, v1alpha)
//! - Binary gRPC-Web framing over HTTP/1.1 (`hyper`)
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use grpcweb_client::{CallOptions, Client, ConnectParams, EventLoop, HostContext};
//! use serde_json::json;
//!
//! let ctx = HostContext::new("./protos");
//! let event_loop = EventLoop::new();
//! let mut client = Client::builder(event_loop.clone(), Arc::new(ctx.clone())).build()?;
//!
//! client.load::<&str, _>(&[], &["weather.proto"])?;
//! ctx.enter_execution();
//! client.connect("http://localhost:8080", ConnectParams::new())?;
//!
//! let response = client.invoke(
//!     "/weather.Weather/Get",
//!     &json!({ "city": "Oslo" }),
//!     CallOptions::new(),
//! )?;
//! println!("{} {}", response.status, response.message);
//! ```
//!
//! ## Streaming
//!
//! ```ignore
//! let stream = client.stream("/weather.Weather/Watch", &json!({ "city": "Oslo" }), CallOptions::new())?;
//! stream
//!     .on("data", |event| { println!("{:?}", event); Ok(()) })
//!     .on("end", |_| { println!("done"); Ok(()) });
//!
//! // Listeners run here, on this thread.
//! event_loop.run();
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `tls` (default) | `tls-ring` + `tls-native-roots` |
//! | `tls-aws-lc` | aws-lc-rs crypto provider |
//! | `tls-webpki-roots` | Bundled Mozilla roots |
//! | `compression-gzip` | Accept gzip-compressed response frames |

mod builder;
mod client;
mod codec;
mod descriptor;
mod error;
mod event_loop;
mod frame;
mod host;
mod loader;
mod options;
mod reflection;
mod request;
mod response;
mod stream;
pub mod transport;

pub use builder::ClientBuilder;
pub use client::Client;
pub use codec::{DeferredFrame, Unmarshal, decode, encode, from_dynamic, marshal, to_dynamic};
pub use descriptor::{DescriptorStore, MethodInfo, dispatch_path, walk_file_descriptors};
pub use error::{BoxError, ClientError};
pub use event_loop::{Callback, EventLoop, Promise, Resolver, Task, TaskQueue};
pub use frame::FrameDecoder;
pub use host::{
    ExecutionContext, FileAccessor, HostContext, Metric, NoopSink, OsFileAccessor, Phase, Sample, Tags,
    TelemetrySink,
};
pub use options::{CallOptions, ConnectParams, DEFAULT_UNARY_TIMEOUT};
pub use request::{DEFAULT_USER_AGENT, GRPC_WEB_CONTENT_TYPE};
pub use response::{InvokeResponse, Metadata};
pub use stream::{EventKind, StreamEvent, StreamHandle, StreamState, UnknownEventKind};
pub use transport::{HyperTransport, HyperTransportBuilder, Transport, TransportBody};

// Re-export core protocol types
pub use grpcweb_core::{Code, ErrorDetail, Status};

// Re-export schema crates used in the public API
pub use prost_reflect;
pub use prost_types;
