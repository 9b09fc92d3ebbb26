use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    AuthRequired,
    ConnectionFailed,
    NotConnected,
    RemoteOperation,
    InvalidRequest,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::AuthRequired => "urn:sandbox-explorer:error:auth_required",
            Self::ConnectionFailed => "urn:sandbox-explorer:error:connection_failed",
            Self::NotConnected => "urn:sandbox-explorer:error:not_connected",
            Self::RemoteOperation => "urn:sandbox-explorer:error:remote_operation",
            Self::InvalidRequest => "urn:sandbox-explorer:error:invalid_request",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::AuthRequired => "API Key Required",
            Self::ConnectionFailed => "Connection Failed",
            Self::NotConnected => "Not Connected",
            Self::RemoteOperation => "Remote Operation Failed",
            Self::InvalidRequest => "Invalid Request",
        }
    }

    /// Whether a host may offer an automatic retry for this class of error.
    ///
    /// Missing keys and unknown sandboxes need user action first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailed | Self::RemoteOperation)
    }
}

/// Serializable form of [`SandboxError`] handed to editor hosts for display.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    #[serde(rename = "type")]
    pub type_: ErrorType,
    pub urn: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorReport {
    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(ErrorReport)
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("api key not configured; set it in settings or the E2B_API_KEY environment variable")]
    AuthRequired,
    #[error("failed to connect to sandbox {sandbox_id}: {message}")]
    ConnectionFailed { sandbox_id: String, message: String },
    #[error("not connected to sandbox {sandbox_id}")]
    NotConnected { sandbox_id: String },
    #[error("{operation} failed on sandbox {sandbox_id}: {message}")]
    RemoteOperation {
        sandbox_id: String,
        operation: String,
        message: String,
    },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl SandboxError {
    pub fn not_connected(sandbox_id: impl Into<String>) -> Self {
        Self::NotConnected {
            sandbox_id: sandbox_id.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::AuthRequired => ErrorType::AuthRequired,
            Self::ConnectionFailed { .. } => ErrorType::ConnectionFailed,
            Self::NotConnected { .. } => ErrorType::NotConnected,
            Self::RemoteOperation { .. } => ErrorType::RemoteOperation,
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
        }
    }

    pub fn sandbox_id(&self) -> Option<&str> {
        match self {
            Self::ConnectionFailed { sandbox_id, .. }
            | Self::NotConnected { sandbox_id }
            | Self::RemoteOperation { sandbox_id, .. } => Some(sandbox_id.as_str()),
            Self::AuthRequired | Self::InvalidRequest { .. } => None,
        }
    }

    pub fn to_report(&self) -> ErrorReport {
        let details = match self {
            Self::ConnectionFailed { message, .. } | Self::InvalidRequest { message } => {
                let mut map = Map::new();
                map.insert("message".to_string(), Value::String(message.clone()));
                Some(Value::Object(map))
            }
            Self::RemoteOperation {
                operation, message, ..
            } => {
                let mut map = Map::new();
                map.insert("operation".to_string(), Value::String(operation.clone()));
                map.insert("message".to_string(), Value::String(message.clone()));
                Some(Value::Object(map))
            }
            Self::AuthRequired | Self::NotConnected { .. } => None,
        };

        let error_type = self.error_type();
        ErrorReport {
            type_: error_type,
            urn: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            message: self.to_string(),
            sandbox_id: self.sandbox_id().map(str::to_string),
            details,
        }
    }
}

impl From<SandboxError> for ErrorReport {
    fn from(value: SandboxError) -> Self {
        value.to_report()
    }
}

impl From<&SandboxError> for ErrorReport {
    fn from(value: &SandboxError) -> Self {
        value.to_report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_operation_report_carries_details() {
        let err = SandboxError::RemoteOperation {
            sandbox_id: "sbx-1".to_string(),
            operation: "read".to_string(),
            message: "no such file".to_string(),
        };
        let report = err.to_report();
        assert_eq!(report.type_, ErrorType::RemoteOperation);
        assert_eq!(report.urn, "urn:sandbox-explorer:error:remote_operation");
        assert_eq!(report.sandbox_id.as_deref(), Some("sbx-1"));

        let value = serde_json::to_value(&report).expect("serialize report");
        assert_eq!(value["type"], "remote_operation");
        assert_eq!(value["sandboxId"], "sbx-1");
        assert_eq!(value["details"]["operation"], "read");
    }

    #[test]
    fn auth_errors_are_not_retryable() {
        let report = ErrorReport::from(SandboxError::AuthRequired);
        assert!(!report.type_.is_retryable());
        assert!(report.sandbox_id.is_none());
        assert!(report.details.is_none());
        assert!(SandboxError::not_connected("x").sandbox_id() == Some("x"));
    }

    #[test]
    fn report_schema_names_fields() {
        let schema = serde_json::to_value(ErrorReport::json_schema()).expect("schema json");
        let properties = &schema["properties"];
        assert!(properties.get("sandboxId").is_some());
        assert!(properties.get("type").is_some());
    }
}
