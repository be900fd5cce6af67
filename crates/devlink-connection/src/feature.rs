//! Feature RPC contract: named server-side features invoked with a string map.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use devlink_proto::devlink::v1::{ErrorInfo, FeatureRequest, FeatureResponse};
use prost::Message;
use tracing::warn;

use crate::error::{ConnectionError, ConnectionResult, ErrorId};

#[async_trait]
pub trait FeatureClient: Send + Sync {
    async fn trigger_feature(
        &self,
        name: &str,
        args: HashMap<String, String>,
    ) -> ConnectionResult<FeatureResponse>;
}

#[async_trait]
pub trait FeatureHandler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, request: FeatureRequest) -> FeatureResponse;
}

pub fn success_response(text: impl Into<String>) -> FeatureResponse {
    FeatureResponse {
        response: Some(text.into()),
        error_info: None,
    }
}

pub fn error_response(err: &ConnectionError) -> FeatureResponse {
    FeatureResponse {
        response: None,
        error_info: Some(ErrorInfo {
            error_trace: encode_error_trace(err),
        }),
    }
}

pub fn encode_error_trace(err: &ConnectionError) -> String {
    serde_json::to_string(err).unwrap_or_else(|_| err.to_string())
}

/// Turns an error trace back into a typed error. Device availability errors are
/// returned as-is; anything else is wrapped with `context`. A trace that doesn't
/// decode becomes a generic runtime error carrying the raw text.
pub fn decode_error_trace(trace: &str, context: &str) -> ConnectionError {
    match serde_json::from_str::<ConnectionError>(trace) {
        Ok(err) if err.is_device_not_available() => err,
        Ok(err) => ConnectionError::runtime(format!("{context}: {err}"), err.id()),
        Err(decode_err) => {
            warn!("undecodable error trace ({decode_err})");
            ConnectionError::runtime(
                format!("{context}. Unserialized error response: {trace}"),
                ErrorId::Undetermined,
            )
        }
    }
}

/// Dispatches requests to registered handlers by name.
#[derive(Default)]
pub struct FeatureServer {
    handlers: HashMap<&'static str, Arc<dyn FeatureHandler>>,
}

impl FeatureServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, handler: Arc<dyn FeatureHandler>) -> Self {
        self.handlers.insert(handler.name(), handler);
        self
    }

    pub async fn dispatch(&self, request: FeatureRequest) -> FeatureResponse {
        match self.handlers.get(request.name.as_str()) {
            Some(handler) => handler.execute(request).await,
            None => error_response(&ConnectionError::runtime(
                format!("no feature named '{}'", request.name),
                ErrorId::Undetermined,
            )),
        }
    }

    /// Same as `dispatch`, over encoded messages.
    pub async fn handle_encoded(&self, request: &[u8]) -> Result<Vec<u8>, prost::DecodeError> {
        let request = FeatureRequest::decode(request)?;
        Ok(self.dispatch(request).await.encode_to_vec())
    }
}

/// Client that talks to a server living in the same process.
#[derive(Clone)]
pub struct LocalFeatureClient {
    server: Arc<FeatureServer>,
}

impl LocalFeatureClient {
    pub fn new(server: Arc<FeatureServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl FeatureClient for LocalFeatureClient {
    async fn trigger_feature(
        &self,
        name: &str,
        args: HashMap<String, String>,
    ) -> ConnectionResult<FeatureResponse> {
        let request = FeatureRequest {
            name: name.to_string(),
            args,
        };
        let reply = self
            .server
            .handle_encoded(&request.encode_to_vec())
            .await
            .map_err(|err| {
                ConnectionError::runtime(format!("bad feature request: {err}"), ErrorId::Undetermined)
            })?;
        FeatureResponse::decode(reply.as_slice()).map_err(|err| {
            ConnectionError::runtime(format!("bad feature response: {err}"), ErrorId::Undetermined)
        })
    }
}
