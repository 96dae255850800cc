//! In-process gRPC-Web stub server for integration tests.
//!
//! Serves `weather.Weather` from `tests/protos/weather.proto` and,
//! optionally, the v1alpha reflection service. With `cyclic` set,
//! reflection describes `ring.Ring` from two files that import each other.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use grpcweb_core::{Code, Status, insert_status, wrap_envelope, wrap_trailers};
use http::{HeaderMap, HeaderValue};
use prost::Message;
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    MethodDescriptorProto, ServiceDescriptorProto,
};
use tokio::sync::oneshot;

pub const WEATHER_GET: &str = "/weather.Weather/Get";
pub const WEATHER_WATCH: &str = "/weather.Weather/Watch";
pub const WEATHER_SLOW: &str = "/weather.Weather/Slow";

/// A city the server knows nothing about.
pub const UNKNOWN_CITY: &str = "Atlantis";
/// `days` value that makes `Watch` fail after two messages.
pub const FAILING_DAYS: i32 = 99;

#[derive(Clone, PartialEq, Message)]
pub struct Location {
    #[prost(string, tag = "1")]
    pub city: String,
    #[prost(double, tag = "2")]
    pub lat: f64,
    #[prost(double, tag = "3")]
    pub lon: f64,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetRequest {
    #[prost(message, optional, tag = "1")]
    pub location: Option<Location>,
    #[prost(int32, tag = "2")]
    pub days: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Forecast {
    #[prost(message, optional, tag = "1")]
    pub location: Option<Location>,
    #[prost(string, tag = "2")]
    pub summary: String,
    #[prost(int32, tag = "3")]
    pub temperature: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReflectionRequest {
    #[prost(string, tag = "1")]
    pub host: String,
    #[prost(oneof = "reflection_request::Kind", tags = "3, 4, 7")]
    pub kind: Option<reflection_request::Kind>,
}

pub mod reflection_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(string, tag = "3")]
        FileByFilename(String),
        #[prost(string, tag = "4")]
        FileContainingSymbol(String),
        #[prost(string, tag = "7")]
        ListServices(String),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ReflectionResponse {
    #[prost(oneof = "reflection_response::Kind", tags = "4, 6, 7")]
    pub kind: Option<reflection_response::Kind>,
}

pub mod reflection_response {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Files {
        #[prost(bytes = "vec", repeated, tag = "1")]
        pub file_descriptor_proto: Vec<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Services {
        #[prost(message, repeated, tag = "1")]
        pub service: Vec<Service>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Service {
        #[prost(string, tag = "1")]
        pub name: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Error {
        #[prost(int32, tag = "1")]
        pub error_code: i32,
        #[prost(string, tag = "2")]
        pub error_message: String,
    }

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "4")]
        Files(Files),
        #[prost(message, tag = "6")]
        Services(Services),
        #[prost(message, tag = "7")]
        Error(Error),
    }
}

/// Directory holding the test `.proto` files.
pub fn protos_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("protos")
}

/// Server options.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    pub reflection: bool,
    pub cyclic: bool,
}

/// A running stub server. Stops when dropped.
pub struct TestServer {
    pub addr: SocketAddr,
    fetched: Arc<Mutex<Vec<String>>>,
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// File names requested through reflection `file_by_filename`, in order.
    pub fn fetched_files(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

pub fn start() -> TestServer {
    start_with(Options {
        reflection: true,
        ..Options::default()
    })
}

/// Route client logs through the test harness writer.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Start a server on its own thread and runtime, so tests can drive the
/// blocking client from the test thread.
pub fn start_with(options: Options) -> TestServer {
    init_tracing();
    let (addr_tx, addr_rx) = std::sync::mpsc::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let fetched = Arc::new(Mutex::new(Vec::new()));
    let state = Reflection {
        fetched: fetched.clone(),
        ..reflection_state(options)
    };

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();
            axum::serve(listener, router(options, state))
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });
    });

    TestServer {
        addr: addr_rx.recv().unwrap(),
        fetched,
        _shutdown: shutdown_tx,
    }
}

/// What the reflection service describes.
#[derive(Clone)]
struct Reflection {
    schema: Arc<FileDescriptorSet>,
    /// (service, defining file)
    services: Vec<(String, String)>,
    fetched: Arc<Mutex<Vec<String>>>,
}

fn reflection_state(options: Options) -> Reflection {
    if options.cyclic {
        return Reflection {
            schema: Arc::new(ring_schema()),
            services: vec![("ring.Ring".into(), "ring/a.proto".into())],
            fetched: Arc::default(),
        };
    }
    let mut compiler = protox::Compiler::new([protos_dir()]).unwrap();
    compiler.include_imports(true);
    compiler.open_file("weather.proto").unwrap();
    Reflection {
        schema: Arc::new(compiler.file_descriptor_set()),
        services: vec![("weather.Weather".into(), "weather.proto".into())],
        fetched: Arc::default(),
    }
}

/// `ring/a.proto` and `ring/b.proto` import each other.
fn ring_schema() -> FileDescriptorSet {
    let message = |name: &str, field: &str, type_name: &str| DescriptorProto {
        name: Some(name.into()),
        field: vec![FieldDescriptorProto {
            name: Some(field.into()),
            json_name: Some(field.into()),
            number: Some(1),
            label: Some(Label::Optional as i32),
            r#type: Some(Type::Message as i32),
            type_name: Some(type_name.into()),
            ..Default::default()
        }],
        ..Default::default()
    };
    let a = FileDescriptorProto {
        name: Some("ring/a.proto".into()),
        package: Some("ring".into()),
        dependency: vec!["ring/b.proto".into()],
        message_type: vec![message("A", "next", ".ring.B")],
        service: vec![ServiceDescriptorProto {
            name: Some("Ring".into()),
            method: vec![MethodDescriptorProto {
                name: Some("Spin".into()),
                input_type: Some(".ring.B".into()),
                output_type: Some(".ring.A".into()),
                ..Default::default()
            }],
            ..Default::default()
        }],
        syntax: Some("proto3".into()),
        ..Default::default()
    };
    let b = FileDescriptorProto {
        name: Some("ring/b.proto".into()),
        package: Some("ring".into()),
        dependency: vec!["ring/a.proto".into()],
        message_type: vec![message("B", "prev", ".ring.A")],
        syntax: Some("proto3".into()),
        ..Default::default()
    };
    FileDescriptorSet { file: vec![a, b] }
}

fn router(options: Options, state: Reflection) -> Router {
    let mut router = Router::new()
        .route(WEATHER_GET, post(get))
        .route(WEATHER_WATCH, post(watch))
        .route(WEATHER_SLOW, post(slow));
    if options.reflection {
        // v1 is deliberately missing so clients fall back to v1alpha.
        router = router.route(
            "/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo",
            post(reflect),
        );
    }
    router.with_state(state)
}

/// Strip the 5-byte envelope of a single-message request body.
fn unwrap_request<M: Message + Default>(body: &Bytes) -> M {
    M::decode(&body[5..]).unwrap()
}

fn grpc_web(body: Body) -> Response {
    http::Response::builder()
        .header("content-type", "application/grpc-web+proto")
        .body(body)
        .unwrap()
}

fn ok_trailers() -> Vec<u8> {
    let mut trailers = HeaderMap::new();
    insert_status(&mut trailers, &Status::from_code(Code::Ok));
    trailers.insert("x-served-by", HeaderValue::from_static("stub"));
    wrap_trailers(&trailers)
}

fn error_trailers(status: &Status) -> Vec<u8> {
    let mut trailers = HeaderMap::new();
    insert_status(&mut trailers, status);
    wrap_trailers(&trailers)
}

/// Status in the response headers and no body.
fn trailers_only(status: &Status) -> Response {
    let mut response = grpc_web(Body::empty());
    insert_status(response.headers_mut(), status);
    response
}

fn forecast(city: &str, day: i32) -> Forecast {
    Forecast {
        location: Some(Location {
            city: city.to_string(),
            lat: 59.91,
            lon: 10.75,
        }),
        summary: format!("sunny in {} on day {}", city, day),
        temperature: 20 + day,
    }
}

async fn get(headers: HeaderMap, body: Bytes) -> Response {
    let request: GetRequest = unwrap_request(&body);
    let city = request.location.map(|l| l.city).unwrap_or_default();
    if city == UNKNOWN_CITY {
        let status = Status::new(Code::NotFound, format!("no forecast for {}", city));
        return grpc_web(Body::from(error_trailers(&status)));
    }

    let mut out = wrap_envelope(&forecast(&city, 0).encode_to_vec(), false);
    out.extend(ok_trailers());
    let mut response = grpc_web(Body::from(out));
    if let Some(key) = headers.get("x-api-key") {
        response.headers_mut().insert("x-echo-api-key", key.clone());
    }
    if let Some(timeout) = headers.get("grpc-timeout") {
        response.headers_mut().insert("x-echo-timeout", timeout.clone());
    }
    response
}

async fn slow(body: Bytes) -> Response {
    tokio::time::sleep(Duration::from_secs(5)).await;
    get(HeaderMap::new(), body).await
}

async fn watch(body: Bytes) -> Response {
    let request: GetRequest = unwrap_request(&body);
    let city = request.location.map(|l| l.city).unwrap_or_default();
    if city == UNKNOWN_CITY {
        return trailers_only(&Status::new(Code::NotFound, format!("no forecast for {}", city)));
    }

    let days = request.days;
    let stream = async_stream::stream! {
        let count = if days == FAILING_DAYS { 2 } else { days };
        for day in 0..count {
            tokio::time::sleep(Duration::from_millis(5)).await;
            yield Ok::<_, Infallible>(Bytes::from(wrap_envelope(&forecast(&city, day).encode_to_vec(), false)));
        }
        if days == FAILING_DAYS {
            yield Ok(Bytes::from(error_trailers(&Status::new(Code::ResourceExhausted, "quota exceeded"))));
        } else {
            yield Ok(Bytes::from(ok_trailers()));
        }
    };
    grpc_web(Body::from_stream(stream))
}

async fn reflect(State(state): State<Reflection>, body: Bytes) -> Response {
    use reflection_response::{Error, Files, Kind, Service, Services};

    let request: ReflectionRequest = unwrap_request(&body);
    let file = |name: &str| state.schema.file.iter().find(|f| f.name() == name);
    let files = |name: &str| Files {
        file_descriptor_proto: file(name).map(|f| vec![f.encode_to_vec()]).unwrap_or_default(),
    };

    let kind = match request.kind {
        Some(reflection_request::Kind::ListServices(_)) => Kind::Services(Services {
            service: state
                .services
                .iter()
                .map(|(name, _)| Service { name: name.clone() })
                .collect(),
        }),
        // Only the defining file; clients fetch dependencies by name.
        Some(reflection_request::Kind::FileContainingSymbol(symbol))
            if state.services.iter().any(|(name, _)| *name == symbol) =>
        {
            let (_, defining) = state
                .services
                .iter()
                .find(|(name, _)| *name == symbol)
                .unwrap();
            Kind::Files(files(defining))
        }
        Some(reflection_request::Kind::FileByFilename(name)) if file(&name).is_some() => {
            state.fetched.lock().unwrap().push(name.clone());
            Kind::Files(files(&name))
        }
        other => Kind::Error(Error {
            error_code: Code::NotFound.as_u32() as i32,
            error_message: format!("not found: {:?}", other),
        }),
    };

    let reply = ReflectionResponse { kind: Some(kind) };
    let mut out = wrap_envelope(&reply.encode_to_vec(), false);
    out.extend(ok_trailers());
    grpc_web(Body::from(out))
}
