//! gRPC-Web response decoding.
//!
//! [`check_response_head`] turns a non-200 or trailers-only response into a
//! status before the body is touched. [`FrameDecoder`] then splits the body
//! into envelopes and yields one unmarshalled value per message frame,
//! keeping the trailer block for the caller.

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures::Stream;
use grpcweb_core::{
    Code, CompressionEncoding, ENVELOPE_HEADER_SIZE, Envelope, GRPC_ENCODING, Status,
    http_status_to_code, parse_envelope_header, parse_trailer_block, process_envelope_payload,
    status_from_metadata,
};
use http::{HeaderMap, StatusCode};
use http_body::Frame;
use http_body_util::BodyStream;
use pin_project_lite::pin_project;

use crate::ClientError;
use crate::codec::Unmarshal;
use crate::transport::ResponseBody;

/// Inspect a response head.
///
/// Returns the status the call already ended with, if any: a mapped HTTP
/// error or a trailers-only response carrying `grpc-status` in its headers.
/// Unsupported `grpc-encoding` is an `Internal` status.
pub(crate) fn check_response_head(
    status: StatusCode,
    headers: &HeaderMap,
) -> Result<Option<Status>, ClientError> {
    if status != StatusCode::OK {
        let code = http_status_to_code(status);
        let status = status_from_metadata(headers)
            .filter(|s| !s.is_ok())
            .unwrap_or_else(|| Status::new(code, format!("HTTP status {}", status)));
        return Ok(Some(status));
    }
    if let Some(status) = status_from_metadata(headers) {
        return Ok(Some(status));
    }
    response_encoding(headers)?;
    Ok(None)
}

/// Compression encoding named by the response's `grpc-encoding` header.
pub(crate) fn response_encoding(headers: &HeaderMap) -> Result<CompressionEncoding, ClientError> {
    let value = headers.get(GRPC_ENCODING).and_then(|v| v.to_str().ok());
    CompressionEncoding::from_header(value).ok_or_else(|| {
        ClientError::new(
            Code::Internal,
            format!("unsupported response encoding {:?}", value.unwrap_or_default()),
        )
    })
}

pin_project! {
    /// Stream adapter that splits a gRPC-Web body into envelope frames.
    ///
    /// Yields one `T` per message frame. The trailer frame (or HTTP trailers)
    /// ends the stream: an OK status ends it cleanly, any other status is
    /// yielded as a final [`ClientError::Status`]. A body that ends without
    /// any status yields `Internal`.
    pub struct FrameDecoder<T> {
        #[pin]
        body: BodyStream<ResponseBody>,
        buffer: BytesMut,
        encoding: CompressionEncoding,
        trailers: Option<HeaderMap>,
        finished: bool,
        _marker: PhantomData<fn() -> T>,
    }
}

impl<T> FrameDecoder<T> {
    pub fn new(body: ResponseBody, encoding: CompressionEncoding) -> Self {
        Self {
            body: BodyStream::new(body),
            buffer: BytesMut::new(),
            encoding,
            trailers: None,
            finished: false,
            _marker: PhantomData,
        }
    }

    /// Take the trailers, leaving `None` in place.
    pub fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }
}

/// Parse one complete envelope off the front of `buffer`.
fn next_envelope(
    buffer: &mut BytesMut,
    encoding: CompressionEncoding,
) -> Result<Option<Envelope>, ClientError> {
    if buffer.len() < ENVELOPE_HEADER_SIZE {
        return Ok(None);
    }
    let (flags, length) = parse_envelope_header(buffer)?;
    let frame_size = ENVELOPE_HEADER_SIZE + length as usize;
    if buffer.len() < frame_size {
        return Ok(None);
    }
    let payload = buffer.split_to(frame_size).freeze().slice(ENVELOPE_HEADER_SIZE..);
    Ok(Some(process_envelope_payload(flags, payload, encoding)?))
}

fn merge_trailers(slot: &mut Option<HeaderMap>, more: HeaderMap) {
    match slot {
        Some(existing) => existing.extend(more),
        None => *slot = Some(more),
    }
}

/// Error to yield once the body has been fully read, if any.
fn finish(trailers: Option<&HeaderMap>) -> Option<ClientError> {
    match trailers.and_then(status_from_metadata) {
        Some(status) if status.is_ok() => None,
        Some(status) => Some(status.into()),
        None => Some(ClientError::new(
            Code::Internal,
            "server closed the stream without sending trailers",
        )),
    }
}

impl<T> Stream for FrameDecoder<T>
where
    T: Unmarshal + Default,
{
    type Item = Result<T, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if *this.finished {
                return Poll::Ready(None);
            }

            match next_envelope(this.buffer, *this.encoding) {
                Ok(Some(Envelope::Message(payload))) => {
                    let mut target = T::default();
                    if let Err(e) = target.unmarshal(&payload) {
                        *this.finished = true;
                        return Poll::Ready(Some(Err(e)));
                    }
                    return Poll::Ready(Some(Ok(target)));
                }
                Ok(Some(Envelope::Trailers(block))) => match parse_trailer_block(&block) {
                    Ok(trailers) => {
                        merge_trailers(this.trailers, trailers);
                        continue;
                    }
                    Err(e) => {
                        *this.finished = true;
                        return Poll::Ready(Some(Err(e.into())));
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    *this.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
            }

            match this.body.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(frame))) => absorb(frame, this.buffer, this.trailers),
                Poll::Ready(Some(Err(e))) => {
                    *this.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    *this.finished = true;
                    if !this.buffer.is_empty() {
                        return Poll::Ready(Some(Err(ClientError::Protocol(format!(
                            "stream ended with {} bytes of incomplete data",
                            this.buffer.len()
                        )))));
                    }
                    return Poll::Ready(finish(this.trailers.as_ref()).map(Err));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn absorb(frame: Frame<bytes::Bytes>, buffer: &mut BytesMut, trailers: &mut Option<HeaderMap>) {
    match frame.into_data() {
        Ok(data) => buffer.extend_from_slice(&data),
        Err(frame) => {
            if let Ok(more) = frame.into_trailers() {
                merge_trailers(trailers, more);
            }
        }
    }
}
