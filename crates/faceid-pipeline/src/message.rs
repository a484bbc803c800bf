//! Wire contracts for the three pipeline hops.
//!
//! Inbound bodies are parsed into `*Body` structs whose fields are all
//! optional, then validated into owned message types. Binary payloads
//! travel as standard base64.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use faceid_core::Outcome;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("malformed message body: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("missing one or more required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("field {field} is not valid base64: {source}")]
    InvalidBase64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },
}

/// Raw image request as submitted by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub request_id: String,
    pub filename: String,
    pub image_bytes: Vec<u8>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RequestBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

impl Request {
    /// Parse and validate a `{request_id, filename, content}` body.
    pub fn parse(body: &str) -> Result<Self, MessageError> {
        let raw: RequestBody = serde_json::from_str(body)?;

        let request_id = present(raw.request_id);
        let filename = present(raw.filename);
        let content = present(raw.content);

        let mut missing = Vec::new();
        if content.is_none() {
            missing.push("content");
        }
        if request_id.is_none() {
            missing.push("request_id");
        }
        if filename.is_none() {
            missing.push("filename");
        }
        let (Some(request_id), Some(filename), Some(content)) = (request_id, filename, content)
        else {
            return Err(MessageError::MissingFields(missing));
        };

        Ok(Self {
            request_id,
            filename,
            image_bytes: decode_field("content", &content)?,
        })
    }

    /// Serialize into the inbound wire form.
    pub fn to_json(&self) -> String {
        let body = RequestBody {
            request_id: Some(self.request_id.clone()),
            filename: Some(self.filename.clone()),
            content: Some(BASE64.encode(&self.image_bytes)),
        };
        serde_json::to_string(&body).unwrap_or_default()
    }
}

/// Encoded face crop forwarded from detection to recognition.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceCropMessage {
    pub request_id: String,
    /// Carried through from the request; not needed for matching.
    pub filename: Option<String>,
    pub face_image_bytes: Vec<u8>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FaceCropBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    face_image: Option<String>,
}

impl FaceCropMessage {
    /// Parse and validate a `{request_id, face_image[, filename]}` record body.
    pub fn parse(body: &str) -> Result<Self, MessageError> {
        let raw: FaceCropBody = serde_json::from_str(body)?;

        let request_id = present(raw.request_id);
        let face_image = present(raw.face_image);
        let mut missing = Vec::new();
        if request_id.is_none() {
            missing.push("request_id");
        }
        if face_image.is_none() {
            missing.push("face_image");
        }
        let (Some(request_id), Some(face_image)) = (request_id, face_image) else {
            return Err(MessageError::MissingFields(missing));
        };

        Ok(Self {
            request_id,
            filename: raw.filename,
            face_image_bytes: decode_field("face_image", &face_image)?,
        })
    }

    pub fn to_json(&self) -> String {
        let body = FaceCropBody {
            request_id: Some(self.request_id.clone()),
            filename: self.filename.clone(),
            face_image: Some(BASE64.encode(&self.face_image_bytes)),
        };
        serde_json::to_string(&body).unwrap_or_default()
    }
}

/// Terminal result delivered to the response channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentificationResult {
    pub request_id: String,
    pub outcome: Outcome,
}

impl IdentificationResult {
    pub fn new(request_id: impl Into<String>, outcome: Outcome) -> Self {
        Self { request_id: request_id.into(), outcome }
    }

    pub fn parse(body: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Treat absent and empty strings alike.
fn present(field: Option<String>) -> Option<String> {
    field.filter(|s| !s.is_empty())
}

/// Line-wrapped base64 is accepted; embedded ASCII whitespace is dropped.
fn decode_field(field: &'static str, value: &str) -> Result<Vec<u8>, MessageError> {
    let compact: String = value.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    BASE64
        .decode(compact)
        .map_err(|source| MessageError::InvalidBase64 { field, source })
}
