//! Server reflection over gRPC-Web.
//!
//! Reflection is a bidirectional stream in gRPC; gRPC-Web cannot carry that,
//! so every request is its own POST with one framed `ServerReflectionRequest`
//! and one response message back.

use std::collections::HashMap;

use http::HeaderMap;
use prost::Message;
use prost_types::{FileDescriptorProto, FileDescriptorSet};

use crate::ClientError;
use crate::descriptor::walk_file_descriptors;
use crate::request::{build_request, unary_exchange};
use crate::transport::Transport;
use grpcweb_core::Code;

pub(crate) const REFLECTION_V1: &str = "/grpc.reflection.v1.ServerReflection/ServerReflectionInfo";
pub(crate) const REFLECTION_V1ALPHA: &str =
    "/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo";

#[derive(Clone, PartialEq, Message)]
pub struct ServerReflectionRequest {
    #[prost(string, tag = "1")]
    pub host: String,
    #[prost(oneof = "MessageRequest", tags = "3, 4, 7")]
    pub message_request: Option<MessageRequest>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum MessageRequest {
    #[prost(string, tag = "3")]
    FileByFilename(String),
    #[prost(string, tag = "4")]
    FileContainingSymbol(String),
    #[prost(string, tag = "7")]
    ListServices(String),
}

#[derive(Clone, PartialEq, Message)]
pub struct ServerReflectionResponse {
    #[prost(string, tag = "1")]
    pub valid_host: String,
    #[prost(oneof = "MessageResponse", tags = "4, 6, 7")]
    pub message_response: Option<MessageResponse>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum MessageResponse {
    #[prost(message, tag = "4")]
    FileDescriptorResponse(FileDescriptorResponse),
    #[prost(message, tag = "6")]
    ListServicesResponse(ListServiceResponse),
    #[prost(message, tag = "7")]
    ErrorResponse(ErrorResponse),
}

/// Serialized `FileDescriptorProto`s.
#[derive(Clone, PartialEq, Message)]
pub struct FileDescriptorResponse {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub file_descriptor_proto: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ListServiceResponse {
    #[prost(message, repeated, tag = "1")]
    pub service: Vec<ServiceResponse>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ServiceResponse {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ErrorResponse {
    #[prost(int32, tag = "1")]
    pub error_code: i32,
    #[prost(string, tag = "2")]
    pub error_message: String,
}

/// One reflection session against a server.
pub(crate) struct Reflector<'a> {
    transport: &'a dyn Transport,
    base_url: &'a str,
    metadata: &'a HeaderMap,
    user_agent: &'a str,
    /// Service path that answered, fixed after the first success.
    path: Option<&'static str>,
}

impl<'a> Reflector<'a> {
    pub(crate) fn new(
        transport: &'a dyn Transport,
        base_url: &'a str,
        metadata: &'a HeaderMap,
        user_agent: &'a str,
    ) -> Self {
        Self {
            transport,
            base_url,
            metadata,
            user_agent,
            path: None,
        }
    }

    async fn request(&mut self, request: MessageRequest) -> Result<MessageResponse, ClientError> {
        let payload = ServerReflectionRequest {
            host: String::new(),
            message_request: Some(request),
        }
        .encode_to_vec();

        let candidates = match self.path {
            Some(path) => vec![path],
            None => vec![REFLECTION_V1, REFLECTION_V1ALPHA],
        };

        let mut last = None;
        for path in candidates {
            let http_request =
                build_request(self.base_url, path, self.metadata, self.user_agent, None, &payload)?;
            let exchange = unary_exchange(self.transport, http_request).await?;
            match exchange.outcome {
                Ok(frame) => {
                    self.path = Some(path);
                    let response = ServerReflectionResponse::decode(frame.into_bytes())
                        .map_err(|e| ClientError::Discovery(format!("bad reflection response: {}", e)))?;
                    return match response.message_response {
                        Some(MessageResponse::ErrorResponse(err)) => Err(ClientError::Discovery(
                            format!("{} (code {})", err.error_message, err.error_code),
                        )),
                        Some(other) => Ok(other),
                        None => Err(ClientError::Discovery("empty reflection response".into())),
                    };
                }
                Err(status) if status.code() == Code::Unimplemented => {
                    tracing::debug!(path, "reflection service not available");
                    last = Some(status);
                }
                Err(status) => {
                    return Err(ClientError::Discovery(format!("{}: {}", path, status)));
                }
            }
        }

        Err(ClientError::Discovery(match last {
            Some(status) => format!("server reflection unavailable: {}", status),
            None => "server reflection unavailable".into(),
        }))
    }

    async fn list_services(&mut self) -> Result<Vec<String>, ClientError> {
        match self.request(MessageRequest::ListServices("*".into())).await? {
            MessageResponse::ListServicesResponse(list) => {
                Ok(list.service.into_iter().map(|s| s.name).collect())
            }
            _ => Err(ClientError::Discovery("unexpected reply to list_services".into())),
        }
    }

    async fn files(&mut self, request: MessageRequest) -> Result<Vec<FileDescriptorProto>, ClientError> {
        match self.request(request).await? {
            MessageResponse::FileDescriptorResponse(response) => response
                .file_descriptor_proto
                .iter()
                .map(|raw| {
                    FileDescriptorProto::decode(raw.as_slice())
                        .map_err(|e| ClientError::Discovery(format!("bad file descriptor: {}", e)))
                })
                .collect(),
            _ => Err(ClientError::Discovery("unexpected reply to file request".into())),
        }
    }

    /// Every file needed to describe every listed service.
    pub(crate) async fn fetch_all(&mut self) -> Result<FileDescriptorSet, ClientError> {
        let services = self.list_services().await?;
        tracing::debug!(count = services.len(), "reflection listed services");

        let mut files: HashMap<String, FileDescriptorProto> = HashMap::new();
        let mut wanted: Vec<String> = Vec::new();

        for service in services {
            let found = self
                .files(MessageRequest::FileContainingSymbol(service))
                .await?;
            absorb_files(found, &mut files, &mut wanted);

            while let Some(name) = wanted.pop() {
                if files.contains_key(&name) {
                    continue;
                }
                let found = self.files(MessageRequest::FileByFilename(name)).await?;
                absorb_files(found, &mut files, &mut wanted);
            }
        }

        Ok(walk_file_descriptors(files.into_values()))
    }
}

fn absorb_files(
    found: Vec<FileDescriptorProto>,
    files: &mut HashMap<String, FileDescriptorProto>,
    wanted: &mut Vec<String>,
) {
    for file in found {
        if files.contains_key(file.name()) {
            continue;
        }
        for dep in &file.dependency {
            if !files.contains_key(dep) {
                wanted.push(dep.clone());
            }
        }
        files.insert(file.name().to_string(), file);
    }
}
