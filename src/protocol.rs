use crate::error::LeafError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RudRequest {
    pub read: BTreeSet<String>,
    /// Kept in wire order, so when two spellings normalize to one key the
    /// later entry wins.
    pub update: IndexMap<String, String>,
    pub delete: BTreeSet<String>,
}

impl RudRequest {
    pub fn read<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            read: keys.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RudResult {
    pub values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ErrorMessage {
    pub error_code: String,
    pub message: String,
}

impl From<&LeafError> for ErrorMessage {
    fn from(err: &LeafError) -> Self {
        Self {
            error_code: err.code_str().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorList {
    pub errors: Vec<ErrorMessage>,
}

/// A version 1 wire message. Messages carry no type tag; each variant is
/// recognised by its exact set of fields:
///
/// | message  | shape                                         |
/// |----------|-----------------------------------------------|
/// | `Rud`    | `{"read": [..], "update": {..}, "delete": [..]}` |
/// | `Result` | `{"values": {..}}`                            |
/// | `Errors` | `{"errors": [{"errorCode", "message"}, ..]}`  |
/// | `Error`  | `{"errorCode": "..", "message": ".."}`        |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Rud(RudRequest),
    Result(RudResult),
    Errors(ErrorList),
    Error(ErrorMessage),
}

impl Message {
    pub fn parse(bytes: &[u8]) -> Result<Self, LeafError> {
        serde_json::from_slice(bytes).map_err(|e| LeafError::BadMessage(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, LeafError> {
        serde_json::to_vec(self).map_err(|e| LeafError::Encode(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Rud(_) => "RUD",
            Message::Result(_) => "Result",
            Message::Errors(_) => "Errors",
            Message::Error(_) => "Error",
        }
    }

    pub fn errors(errors: &[LeafError]) -> Self {
        Message::Errors(ErrorList {
            errors: errors.iter().map(ErrorMessage::from).collect(),
        })
    }
}

impl From<&LeafError> for Message {
    fn from(err: &LeafError) -> Self {
        Message::Error(ErrorMessage::from(err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Message(Message),
    Text(String),
    Empty,
}

/// A status code with its body, as the request boundary sends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: ResponseBody,
}

impl Response {
    pub fn message(status: u16, message: Message) -> Self {
        Self {
            status,
            body: ResponseBody::Message(message),
        }
    }

    pub fn text(value: String) -> Self {
        Self {
            status: 200,
            body: ResponseBody::Text(value),
        }
    }

    pub fn empty() -> Self {
        Self {
            status: 200,
            body: ResponseBody::Empty,
        }
    }

    pub fn error(err: &LeafError) -> Self {
        Self::message(err.status(), Message::from(err))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn as_message(&self) -> Option<&Message> {
        match &self.body {
            ResponseBody::Message(message) => Some(message),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, LeafError> {
        match &self.body {
            ResponseBody::Message(message) => message.to_bytes(),
            ResponseBody::Text(text) => Ok(text.as_bytes().to_vec()),
            ResponseBody::Empty => Ok(Vec::new()),
        }
    }
}
