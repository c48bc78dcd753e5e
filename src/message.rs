//! Module that contains the messages exchanged by monitor peers and the envelope they travel in.

use crate::error::{MonitorError, Result};
use crate::token::Handoff;
use serde::{Deserialize, Serialize};

/// Discriminant carried in the `type` field of every channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Token,
}

/// Body of a REQUEST message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBody {
    pub request_number: u64,
}

/// Enum that represents the decoded protocol messages.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorMessage {
    Request(RequestBody),
    Token(Handoff),
}

/// Message sent on a channel, stamped with the name of its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub sender: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub body: serde_json::Value,
}

/// Outermost wire object, routed by `channel` and `tag` on the receiving side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub tag: String,
    pub message: ChannelMessage,
}

impl MonitorMessage {
    pub fn request(request_number: u64) -> Self {
        Self::Request(RequestBody { request_number })
    }

    pub fn kind(&self) -> MessageType {
        match self {
            Self::Request(_) => MessageType::Request,
            Self::Token(_) => MessageType::Token,
        }
    }
}

impl ChannelMessage {
    /// Function that encodes a protocol message on behalf of `sender`.
    pub fn new(sender: &str, message: &MonitorMessage) -> Result<Self> {
        let body = match message {
            MonitorMessage::Request(body) => serde_json::to_value(body)?,
            MonitorMessage::Token(handoff) => serde_json::to_value(handoff)?,
        };

        Ok(Self {
            sender: sender.to_string(),
            kind: message.kind(),
            body,
        })
    }

    /// Function that decodes the body according to the message type.
    pub fn decode(&self) -> Result<MonitorMessage> {
        let decoded = match self.kind {
            MessageType::Request => {
                serde_json::from_value::<RequestBody>(self.body.clone()).map(MonitorMessage::Request)
            }
            MessageType::Token => {
                serde_json::from_value::<Handoff>(self.body.clone()).map(MonitorMessage::Token)
            }
        };

        decoded.map_err(|e| {
            MonitorError::Protocol(format!("malformed {:?} from {}: {e}", self.kind, self.sender))
        })
    }
}

impl Envelope {
    pub fn new(channel: &str, tag: &str, message: ChannelMessage) -> Self {
        Self {
            channel: channel.to_string(),
            tag: tag.to_string(),
            message,
        }
    }

    /// Function that returns the envelope as a JSON formatted `String`.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Function that parses the envelope from a JSON formatted `String`.
    pub fn from_json_string(line: &str) -> Result<Self> {
        serde_json::from_str::<Self>(line)
            .map_err(|e| MonitorError::Protocol(format!("unreadable envelope: {e}")))
    }
}
