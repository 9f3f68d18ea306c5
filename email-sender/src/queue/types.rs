//! Queue message types.
//!
//! The wire format is a UTF-8 JSON object whose field names match the
//! request's property names (`To`, `ToName`, `Subject`, `Body`). There is no
//! version header, so consumers validate every payload they decode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// Queue name for email send requests.
pub const EMAIL_QUEUE: &str = "email-sender";

/// A request to send one plain-text email.
///
/// Missing fields decode as empty strings so that validation can report them
/// per field instead of failing the whole document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "PascalCase")]
pub struct EmailSendRequest {
    /// Recipient email address
    #[serde(default, alias = "to")]
    #[validate(email(message = "The To field is not a valid e-mail address."))]
    pub to: String,

    /// Recipient display name
    #[serde(default, alias = "toName")]
    #[validate(length(min = 1, message = "The ToName field is required."))]
    pub to_name: String,

    /// Email subject
    #[serde(default, alias = "subject")]
    #[validate(length(
        min = 1,
        max = 100,
        message = "The Subject field is required and must be at most 100 characters."
    ))]
    pub subject: String,

    /// Plain text body
    #[serde(default, alias = "body")]
    #[validate(length(min = 1, message = "The Body field is required."))]
    pub body: String,
}

/// Reasons a queued payload could not be turned into a request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("payload is not a valid request document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("request failed validation: {0}")]
    Invalid(#[from] ValidationErrors),
}

impl EmailSendRequest {
    /// Create a new request.
    pub fn new(
        to: impl Into<String>,
        to_name: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into(),
            to_name: to_name.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Encode the request as a queue payload.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode and validate a queue payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, RequestError> {
        let request: Self = serde_json::from_slice(payload)?;
        request.validate()?;
        Ok(request)
    }
}

/// Flatten validation errors into `{ "To": ["message", ...] }` keyed by wire names.
pub fn field_errors(errors: &ValidationErrors) -> BTreeMap<String, Vec<String>> {
    errors
        .field_errors()
        .into_iter()
        .map(|(field, errs)| {
            let messages = errs
                .iter()
                .map(|e| {
                    e.message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string())
                })
                .collect();
            (wire_name(&field).to_string(), messages)
        })
        .collect()
}

fn wire_name(field: &str) -> &str {
    match field {
        "to" | "To" => "To",
        "to_name" | "ToName" => "ToName",
        "subject" | "Subject" => "Subject",
        "body" | "Body" => "Body",
        other => other,
    }
}
