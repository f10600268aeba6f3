use std::sync::Arc;

use serde_json::Value;

use crate::{error_chain_fmt, Document, ServerAddress, TopologyDescription, TopologyVersion};

pub const RETRYABLE_WRITE_ERROR_LABEL: &str = "RetryableWriteError";

const NOT_PRIMARY_CODES: [i32; 3] = [10107, 13435, 10058];
const NODE_RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const SHUTTING_DOWN_CODES: [i32; 2] = [11600, 91];
const RETRYABLE_WRITE_CODES: [i32; 12] = [
    6, 7, 89, 91, 189, 262, 9001, 10107, 11600, 11602, 13435, 13436,
];

#[derive(thiserror::Error)]
pub enum SdamError {
    #[error("Network error: {message}")]
    Network { message: String, timeout: bool },
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("{message}")]
    ServerSelection {
        message: String,
        description: Arc<TopologyDescription>,
    },
    #[error("{0}")]
    Compatibility(String),
    #[error("Server `{0}` is closed")]
    ServerClosed(ServerAddress),
    #[error("Topology is closed")]
    TopologyClosed,
    #[error("Server `{0}` does not support collation")]
    CollationNotSupported(ServerAddress),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("Invalid server reply: {0}")]
    InvalidReply(String),
    #[error("DNS resolution failed: {0}")]
    Dns(String),
    #[error("No hosts were supplied and a topology can't exist without at least one")]
    MissingHosts,
    #[error("No connector was supplied, the topology has no way to reach its servers")]
    MissingConnector,
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl std::fmt::Debug for SdamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// An `ok: 0` reply from a server.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("Command failed with code {code} ({code_name}): {message}")]
pub struct CommandError {
    pub code: i32,
    pub code_name: String,
    pub message: String,
    pub labels: Vec<String>,
    pub topology_version: Option<TopologyVersion>,
}

impl CommandError {
    /// Extracts the error from a reply whose `ok` field is not 1.
    pub fn from_reply(reply: &Document) -> Self {
        Self {
            code: reply
                .get("code")
                .and_then(Value::as_i64)
                .map(|c| c as i32)
                .unwrap_or_default(),
            code_name: reply
                .get("codeName")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            message: reply
                .get("errmsg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            labels: reply
                .get("errorLabels")
                .and_then(Value::as_array)
                .map(|labels| {
                    labels
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            topology_version: reply
                .get("topologyVersion")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
        }
    }
}

/// Returns the reply unchanged when `ok` is 1, otherwise the [`CommandError`] it carries.
pub fn check_command_reply(reply: Document) -> Result<Document, SdamError> {
    let ok = match reply.get("ok") {
        Some(Value::Number(n)) => n.as_f64() == Some(1.0),
        Some(Value::Bool(b)) => *b,
        _ => false,
    };
    if ok {
        Ok(reply)
    } else {
        Err(CommandError::from_reply(&reply).into())
    }
}

impl SdamError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            timeout: false,
        }
    }

    pub fn network_timeout(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            timeout: true,
        }
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    pub fn is_network_timeout(&self) -> bool {
        matches!(self, Self::Network { timeout: true, .. })
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Command(e) => Some(e.code),
            _ => None,
        }
    }

    pub fn topology_version(&self) -> Option<&TopologyVersion> {
        match self {
            Self::Command(e) => e.topology_version.as_ref(),
            _ => None,
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        match self {
            Self::Command(e) => e.labels.iter().any(|l| l == label),
            _ => false,
        }
    }

    pub fn is_not_primary(&self) -> bool {
        match self {
            Self::Command(e) if e.code != 0 => NOT_PRIMARY_CODES.contains(&e.code),
            Self::Command(e) => {
                let message = e.message.to_lowercase();
                message.contains("not master") || message.contains("not primary")
            }
            _ => false,
        }
    }

    pub fn is_node_recovering(&self) -> bool {
        match self {
            Self::Command(e) if e.code != 0 => NODE_RECOVERING_CODES.contains(&e.code),
            Self::Command(e) => {
                let message = e.message.to_lowercase();
                message.contains("node is recovering")
                    || message.contains("not master or secondary")
            }
            _ => false,
        }
    }

    /// A state-change error after which the node's role can no longer be trusted.
    pub fn is_sdam_unrecoverable(&self) -> bool {
        self.is_not_primary() || self.is_node_recovering()
    }

    pub fn is_node_shutting_down(&self) -> bool {
        matches!(self, Self::Command(e) if SHUTTING_DOWN_CODES.contains(&e.code))
    }

    pub fn is_retryable_write_error(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Command(e) => {
                e.labels.iter().any(|l| l == RETRYABLE_WRITE_ERROR_LABEL)
                    || RETRYABLE_WRITE_CODES.contains(&e.code)
                    || (e.code == 0 && self.is_sdam_unrecoverable())
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use serde_json::json;

    use super::*;

    fn reply(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn check_command_reply_accepts_numeric_and_boolean_ok() {
        assert!(check_command_reply(reply(json!({"ok": 1}))).is_ok());
        assert!(check_command_reply(reply(json!({"ok": 1.0}))).is_ok());
        assert!(check_command_reply(reply(json!({"ok": true}))).is_ok());
    }

    #[test]
    fn check_command_reply_extracts_command_error() {
        // Arrange
        let doc = reply(json!({
            "ok": 0,
            "code": 10107,
            "codeName": "NotWritablePrimary",
            "errmsg": "not primary",
            "errorLabels": ["RetryableWriteError"],
            "topologyVersion": {"processId": "000000000000000000000001", "counter": 4}
        }));

        // Act
        let err = check_command_reply(doc).unwrap_err();

        // Assert
        assert_eq!(err.code(), Some(10107));
        assert!(err.is_not_primary());
        assert!(err.is_sdam_unrecoverable());
        assert!(err.has_label(RETRYABLE_WRITE_ERROR_LABEL));
        assert_eq!(err.topology_version().map(|tv| tv.counter), Some(4));
    }

    #[test]
    fn shutdown_codes_are_recovering_and_shutting_down() {
        let err: SdamError = CommandError {
            code: 91,
            code_name: "ShutdownInProgress".to_string(),
            message: String::new(),
            labels: vec![],
            topology_version: None,
        }
        .into();

        assert!(err.is_node_recovering());
        assert!(err.is_node_shutting_down());
        assert!(err.is_retryable_write_error());
    }

    #[test]
    fn legacy_messages_are_classified_without_a_code() {
        let err: SdamError = CommandError {
            code: 0,
            code_name: String::new(),
            message: "node is recovering".to_string(),
            labels: vec![],
            topology_version: None,
        }
        .into();

        assert!(err.is_node_recovering());
        assert!(err.is_retryable_write_error());
    }

    #[test]
    fn network_errors_are_retryable_and_timeouts_are_flagged() {
        assert!(SdamError::network("reset").is_retryable_write_error());
        assert!(!SdamError::network("reset").is_network_timeout());
        assert!(SdamError::network_timeout("slow").is_network_timeout());
    }

    #[test]
    fn other_command_errors_are_not_retryable() {
        let err: SdamError = CommandError {
            code: 11000,
            code_name: "DuplicateKey".to_string(),
            message: "E11000".to_string(),
            labels: vec![],
            topology_version: None,
        }
        .into();

        assert!(!err.is_retryable_write_error());
        assert!(!err.is_sdam_unrecoverable());
    }
}
