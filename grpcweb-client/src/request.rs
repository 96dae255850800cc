//! gRPC-Web request construction and the unary exchange.

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use grpcweb_core::{Code, GRPC_ACCEPT_ENCODING, Status, accept_encoding_header, wrap_envelope};
use http::{HeaderMap, HeaderValue, Method, Request, header};

use crate::ClientError;
use crate::codec::DeferredFrame;
use crate::frame::{FrameDecoder, check_response_head, response_encoding};
use crate::options::duration_to_timeout_header;
use crate::transport::{Transport, TransportBody};

/// Content type of binary gRPC-Web requests and responses.
pub const GRPC_WEB_CONTENT_TYPE: &str = "application/grpc-web+proto";

/// Default `x-user-agent` value.
pub const DEFAULT_USER_AGENT: &str = concat!("grpcweb-rust/", env!("CARGO_PKG_VERSION"));

const X_GRPC_WEB: &str = "x-grpc-web";
const X_USER_AGENT: &str = "x-user-agent";
const GRPC_TIMEOUT: &str = "grpc-timeout";

/// Build a POST carrying one uncompressed envelope.
///
/// `metadata` is copied first; protocol headers are then set and win.
pub(crate) fn build_request(
    base_url: &str,
    path: &str,
    metadata: &HeaderMap,
    user_agent: &str,
    timeout: Option<Duration>,
    message: &[u8],
) -> Result<Request<TransportBody>, ClientError> {
    let url = format!("{}{}", base_url, path);

    let mut headers = metadata.clone();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(GRPC_WEB_CONTENT_TYPE),
    );
    headers.insert(X_GRPC_WEB, HeaderValue::from_static("1"));
    headers.insert(
        X_USER_AGENT,
        HeaderValue::from_str(user_agent)
            .map_err(|_| ClientError::InvalidArgument(format!("invalid user agent {user_agent:?}")))?,
    );
    if let Some(value) = timeout.and_then(duration_to_timeout_header) {
        headers.insert(
            GRPC_TIMEOUT,
            HeaderValue::from_str(&value)
                .map_err(|e| ClientError::Protocol(format!("invalid grpc-timeout: {}", e)))?,
        );
    }
    if let Some(accept) = accept_encoding_header() {
        headers.insert(GRPC_ACCEPT_ENCODING, HeaderValue::from_static(accept));
    }

    let mut request = Request::builder()
        .method(Method::POST)
        .uri(&url)
        .body(TransportBody::full(Bytes::from(wrap_envelope(message, false))))
        .map_err(|e| ClientError::InvalidArgument(format!("invalid request url {url:?}: {}", e)))?;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Result of a unary exchange that reached the server.
#[derive(Debug)]
pub(crate) struct Exchange {
    pub headers: HeaderMap,
    pub trailers: HeaderMap,
    /// The single response message, or the status the call ended with.
    pub outcome: Result<DeferredFrame, Status>,
}

/// Send a unary request and read the whole response.
///
/// Only transport failures are errors; everything the server says,
/// including malformed responses, ends up in [`Exchange::outcome`].
pub(crate) async fn unary_exchange(
    transport: &dyn Transport,
    request: Request<TransportBody>,
) -> Result<Exchange, ClientError> {
    let response = transport.send(request).await?;
    let (parts, body) = response.into_parts();

    let ended = match check_response_head(parts.status, &parts.headers) {
        Ok(ended) => ended,
        Err(e) => Some(e.to_status()),
    };
    if let Some(status) = ended {
        let outcome = if status.is_ok() {
            Err(Status::new(Code::Unimplemented, "unary response has zero messages"))
        } else {
            Err(status)
        };
        return Ok(Exchange {
            headers: parts.headers,
            trailers: HeaderMap::new(),
            outcome,
        });
    }

    let encoding = response_encoding(&parts.headers)?;
    let mut decoder = FrameDecoder::<DeferredFrame>::new(body, encoding);
    let mut messages = Vec::with_capacity(1);
    let mut failure = None;
    while let Some(item) = decoder.next().await {
        match item {
            Ok(frame) => messages.push(frame),
            Err(ClientError::Transport(msg)) => return Err(ClientError::Transport(msg)),
            Err(e) => {
                failure = Some(e.to_status());
                break;
            }
        }
    }

    let outcome = match failure {
        Some(status) => Err(status),
        None if messages.len() == 1 => Ok(messages.remove(0)),
        None if messages.is_empty() => Err(Status::new(
            Code::Unimplemented,
            "unary response has zero messages",
        )),
        None => Err(Status::new(
            Code::Unimplemented,
            "unary response has multiple messages",
        )),
    };

    Ok(Exchange {
        headers: parts.headers,
        trailers: decoder.take_trailers().unwrap_or_default(),
        outcome,
    })
}

/// A streaming response after its head has been read.
pub(crate) enum Opened {
    /// Frames follow.
    Frames(FrameDecoder<DeferredFrame>),
    /// The response head already carried the final status.
    Ended(Status),
}

/// Send a request and read the response head.
pub(crate) async fn open_stream(
    transport: &dyn Transport,
    request: Request<TransportBody>,
) -> Result<Opened, ClientError> {
    let response = transport.send(request).await?;
    let (parts, body) = response.into_parts();
    match check_response_head(parts.status, &parts.headers) {
        Ok(Some(status)) => Ok(Opened::Ended(status)),
        Err(e) => Ok(Opened::Ended(e.to_status())),
        Ok(None) => {
            let encoding = response_encoding(&parts.headers)?;
            Ok(Opened::Frames(FrameDecoder::new(body, encoding)))
        }
    }
}
