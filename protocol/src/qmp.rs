use serde::{Deserialize, Serialize};

/// A QMP command: `{"execute": ..., "arguments": ...}`.
#[derive(Debug, Clone, Serialize)]
pub struct QmpCommand {
    pub execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

impl QmpCommand {
    pub fn new(execute: impl Into<String>, arguments: Option<serde_json::Value>) -> Self {
        Self {
            execute: execute.into(),
            arguments,
        }
    }

    /// Serialize as one newline-terminated line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// The greeting QEMU sends as soon as a client connects.
#[derive(Debug, Clone, Deserialize)]
pub struct QmpGreeting {
    #[serde(rename = "QMP")]
    pub qmp: QmpGreetingInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QmpGreetingInfo {
    pub version: serde_json::Value,
    #[serde(default)]
    pub capabilities: Vec<serde_json::Value>,
}

/// Error object of a failed command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QmpErrorBody {
    pub class: String,
    pub desc: String,
}

/// Asynchronous event. May arrive between any two lines.
#[derive(Debug, Clone, Deserialize)]
pub struct QmpEvent {
    pub event: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
}

/// Any line QEMU sends after the greeting.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum QmpMessage {
    Return {
        #[serde(rename = "return")]
        ret: serde_json::Value,
    },
    Error {
        error: QmpErrorBody,
    },
    Event(QmpEvent),
}
