//! Remote service seam.
//!
//! The client never speaks a wire protocol itself; it hands documents to a
//! [`Transport`] implementation supplied by the application.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sieve_core::{Document, RequestContext, TransportError, Variables};
use std::sync::Arc;

/// One operation to execute remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub document: Document,
    pub variables: Variables,
    /// Global context merged with the caller's own.
    pub context: RequestContext,
}

impl OperationRequest {
    pub fn new(document: Document, variables: Variables) -> Self {
        Self {
            document,
            variables,
            context: RequestContext::new(),
        }
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn operation_name(&self) -> &str {
        self.document.operation_name()
    }
}

/// What the remote service answered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl OperationResponse {
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn errors<I, S>(messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            data: None,
            errors: messages.into_iter().map(Into::into).collect(),
        }
    }

    /// The response data, or the remote errors as a [`TransportError`].
    pub fn into_data(self, operation: &str) -> Result<Value, TransportError> {
        if !self.errors.is_empty() {
            return Err(TransportError::Remote {
                operation: operation.to_string(),
                messages: self.errors,
            });
        }
        self.data.ok_or_else(|| TransportError::RequestFailed {
            operation: operation.to_string(),
            reason: "response carried neither data nor errors".to_string(),
        })
    }
}

/// Executes operations against the remote service.
///
/// Used for reads, writes and subscription setup alike. Implementations must
/// be thread-safe.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: OperationRequest) -> Result<OperationResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn execute(&self, request: OperationRequest) -> Result<OperationResponse, TransportError> {
        (**self).execute(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_into_data_prefers_errors() {
        let response = OperationResponse {
            data: Some(json!({"a": 1})),
            errors: vec!["boom".to_string()],
        };
        assert_eq!(
            response.into_data("Op"),
            Err(TransportError::Remote {
                operation: "Op".to_string(),
                messages: vec!["boom".to_string()]
            })
        );
        assert_eq!(
            OperationResponse::data(json!({"a": 1})).into_data("Op"),
            Ok(json!({"a": 1}))
        );
        assert!(matches!(
            OperationResponse::default().into_data("Op"),
            Err(TransportError::RequestFailed { .. })
        ));
    }

    #[test]
    fn test_response_deserializes_without_errors() {
        let response: OperationResponse = serde_json::from_value(json!({"data": {"ok": true}})).unwrap();
        assert_eq!(response, OperationResponse::data(json!({"ok": true})));
    }
}
