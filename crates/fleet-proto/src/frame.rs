use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Item, NodeDescriptor, Request};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Couldn't encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPing {
    pub node: NodeDescriptor,
    /// Client wall clock, unix millis
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPong {
    pub node_id: String,
    pub timestamp: i64,
    pub network_delay_ms: i64,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPing {
    pub idle_concurrency: i64,
    pub max_concurrency: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPong {
    pub network_delay_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
    pub request_id: String,
    pub succeeded: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub request: Request,
}

/// Frames sent by a node to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Inbound {
    JoinPing(JoinPing),
    HeartbeatPing(HeartbeatPing),
    CommandError(CommandError),
    CommandRequest(CommandRequest),
    Item(Item),
}

impl Inbound {
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        serde_json::from_slice(bytes).map_err(FrameError::Malformed)
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        serde_json::to_vec(self).map_err(FrameError::Encode)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinPing(_) => "joinPing",
            Self::HeartbeatPing(_) => "heartbeatPing",
            Self::CommandError(_) => "commandError",
            Self::CommandRequest(_) => "commandRequest",
            Self::Item(_) => "item",
        }
    }
}

/// Frames sent by the control plane to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Outbound {
    JoinPong(JoinPong),
    HeartbeatPong(HeartbeatPong),
    Command(Command),
}

impl Outbound {
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        serde_json::from_slice(bytes).map_err(FrameError::Malformed)
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        serde_json::to_vec(self).map_err(FrameError::Encode)
    }
}
