//! Normalization of failed HTTP exchanges into field-scoped errors.
//!
//! Backend failures arrive in a few loosely-typed shapes. They are classified
//! once into [`ErrorShape`] and flattened into an ordered `Vec<FieldError>`
//! plus an Unauthorized flag. Everything here is pure.

use std::collections::BTreeMap;
use std::fmt;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field name used for errors that are not scoped to a form field.
pub const GENERAL_ERRORS: &str = "Errors";

/// Top-level `message` that signals an invalid or expired session.
pub const UNAUTHORIZED_MESSAGE: &str = "Unauthorized";

/// Error code used for transport failures (no response received).
pub const NETWORK_ERROR_CODE: &str = "NETWORK_ERROR";

const NETWORK_ERROR_MESSAGE: &str = "Network error: the server could not be reached";

/// A normalized validation or general failure, scoped to a named field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Offending field, or [`GENERAL_ERRORS`]
    pub name: String,
    /// Error code -> human message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<BTreeMap<String, String>>,
}

impl FieldError {
    pub fn new(name: impl Into<String>, errors: Option<BTreeMap<String, String>>) -> Self {
        Self {
            name: name.into(),
            errors,
        }
    }

    /// Creates a single-code error under the [`GENERAL_ERRORS`] sentinel.
    pub fn general(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            GENERAL_ERRORS,
            Some(BTreeMap::from([(code.into(), message.into())])),
        )
    }

    pub fn is_general(&self) -> bool {
        self.name == GENERAL_ERRORS
    }

    /// Iterates the human messages in code order.
    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().flat_map(|m| m.values().map(String::as_str))
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        let mut messages = self.messages().peekable();
        if messages.peek().is_some() {
            write!(f, ":")?;
            for (i, msg) in messages.enumerate() {
                if i > 0 {
                    write!(f, ";")?;
                }
                write!(f, " {msg}")?;
            }
        }
        Ok(())
    }
}

/// Raw description of a failed exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum FailedExchange {
    /// A non-2xx response was received.
    Response { status: u16, body: Value },
    /// No response was received (connect error, timeout, broken body).
    Transport { reason: String },
}

impl FailedExchange {
    pub fn response(status: u16, body: Value) -> Self {
        Self::Response { status, body }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }
}

/// The failure shapes the backend produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorShape {
    /// `{ errors: [{ property, constraints }, ...] }`
    FieldList(Vec<FieldError>),
    /// `{ code, message }`
    SingleCode { code: String, message: String },
    /// No response at all
    Transport,
}

impl ErrorShape {
    pub fn classify(failure: &FailedExchange) -> Self {
        match failure {
            FailedExchange::Transport { .. } => Self::Transport,
            FailedExchange::Response { status, body } => {
                if let Some(items) = body.get("errors").and_then(Value::as_array) {
                    return Self::FieldList(items.iter().map(field_error_from_item).collect());
                }
                Self::SingleCode {
                    code: body
                        .get("code")
                        .and_then(scalar_to_string)
                        .unwrap_or_else(|| status.to_string()),
                    message: body
                        .get("message")
                        .and_then(message_to_string)
                        .unwrap_or_else(|| default_message(*status)),
                }
            }
        }
    }

    pub fn into_field_errors(self) -> Vec<FieldError> {
        match self {
            Self::FieldList(errors) => errors,
            Self::SingleCode { code, message } => vec![FieldError::general(code, message)],
            Self::Transport => vec![FieldError::general(
                NETWORK_ERROR_CODE,
                NETWORK_ERROR_MESSAGE,
            )],
        }
    }
}

/// Output of [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub field_errors: Vec<FieldError>,
    /// Set when the session must be torn down. Never shown as a form error.
    pub is_unauthorized: bool,
}

/// Maps a failed exchange into the uniform error list.
pub fn normalize(failure: &FailedExchange) -> Normalized {
    let is_unauthorized = match failure {
        FailedExchange::Response { body, .. } => {
            body.get("message").and_then(Value::as_str) == Some(UNAUTHORIZED_MESSAGE)
        }
        FailedExchange::Transport { .. } => false,
    };

    Normalized {
        field_errors: ErrorShape::classify(failure).into_field_errors(),
        is_unauthorized,
    }
}

fn field_error_from_item(item: &Value) -> FieldError {
    let name = item
        .get("property")
        .and_then(scalar_to_string)
        .unwrap_or_else(|| GENERAL_ERRORS.to_string());

    let errors = item
        .get("constraints")
        .and_then(Value::as_object)
        .map(|constraints| {
            constraints
                .iter()
                .filter_map(|(code, msg)| Some((code.clone(), message_to_string(msg)?)))
                .collect()
        });

    FieldError { name, errors }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Messages are usually strings; some backends send a list of strings.
fn message_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Array(parts) => {
            let joined = parts
                .iter()
                .filter_map(scalar_to_string)
                .collect::<Vec<_>>()
                .join("; ");
            (!joined.is_empty()).then_some(joined)
        }
        other => scalar_to_string(other),
    }
}

fn default_message(status: u16) -> String {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .map_or_else(|| format!("HTTP {status}"), str::to_string)
}
