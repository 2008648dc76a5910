//! Bus errors
//!
//! `BusError` travels inside response envelopes, so every variant has to
//! survive a JSON round trip. The `reason` tag is what remote callers match on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::module::traits::ModuleError;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusError {
    /// Malformed topic, scope or listener argument
    #[error("invalid argument: {message}")]
    Validation { message: String },

    /// Scope or user mismatch between caller and registration
    #[error("permission denied on topic {topic}")]
    Permissions { topic: String },

    /// Nothing anywhere handles the request topic
    #[error("no listener for topic {topic}")]
    NoListener { topic: String },

    /// Removal of a listener that was never added
    #[error("listener is not registered on topic {topic}")]
    NotRegistered { topic: String },

    /// The handler rejected the request
    #[error("{name}: {message}")]
    HandlerFailure {
        topic: String,
        name: String,
        message: String,
        /// Full error chain; only kept while the error stays in-process
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },

    #[error("transport error: {message}")]
    Transport { message: String },
}

impl BusError {
    pub fn validation(message: impl Into<String>) -> Self {
        BusError::Validation {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        BusError::Transport {
            message: message.into(),
        }
    }

    /// Wire value of the `reason` tag
    pub fn reason(&self) -> &'static str {
        match self {
            BusError::Validation { .. } => "VALIDATION",
            BusError::Permissions { .. } => "PERMISSIONS",
            BusError::NoListener { .. } => "NO_LISTENER",
            BusError::NotRegistered { .. } => "NOT_REGISTERED",
            BusError::HandlerFailure { .. } => "HANDLER_FAILURE",
            BusError::Transport { .. } => "TRANSPORT",
        }
    }

    /// Converts a handler's error into a response error
    ///
    /// A `BusError` returned by a handler (for example from a nested request)
    /// passes through untouched.
    pub(crate) fn from_handler(topic: &str, error: anyhow::Error) -> Self {
        match error.downcast::<BusError>() {
            Ok(bus_error) => bus_error,
            Err(error) => {
                let name = error
                    .downcast_ref::<ModuleError>()
                    .map(|e| e.kind().to_string())
                    .unwrap_or_else(|| "Error".to_string());
                BusError::HandlerFailure {
                    topic: topic.to_string(),
                    name,
                    message: error.to_string(),
                    stack: Some(format!("{:?}", error)),
                }
            }
        }
    }

    /// Strips detail that must not leave the process
    pub(crate) fn for_wire(self) -> Self {
        match self {
            BusError::HandlerFailure {
                topic,
                name,
                message,
                ..
            } => BusError::HandlerFailure {
                topic,
                name,
                message,
                stack: None,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_error_shape() {
        let error = BusError::Permissions {
            topic: "wallet.sign".to_string(),
        };
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["reason"], "PERMISSIONS");
        assert_eq!(json["topic"], "wallet.sign");
        assert_eq!(error.reason(), "PERMISSIONS");
    }

    #[test]
    fn test_handler_error_keeps_bus_errors() {
        let nested = anyhow::Error::new(BusError::NoListener {
            topic: "inner".to_string(),
        });
        assert_eq!(
            BusError::from_handler("outer", nested),
            BusError::NoListener {
                topic: "inner".to_string()
            }
        );
    }

    #[test]
    fn test_stack_stripped_for_wire() {
        let error = BusError::from_handler(
            "t",
            anyhow::Error::new(ModuleError::NotLoaded("x".to_string())),
        );
        match &error {
            BusError::HandlerFailure { name, stack, .. } => {
                assert_eq!(name, "NotLoaded");
                assert!(stack.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
        match error.for_wire() {
            BusError::HandlerFailure { stack, .. } => assert!(stack.is_none()),
            other => panic!("unexpected {:?}", other),
        }
    }
}
