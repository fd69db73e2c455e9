use regpoll_core::{CycleOutcome, RegisterKey, RegisterValue, Snapshot, WriteError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn v1() -> Self {
        Self { major: 1, minor: 0 }
    }

    pub fn is_supported(&self) -> bool {
        self.major == 1
    }
}

/// Published on connect and after every completed cycle.
#[derive(Debug, Serialize)]
pub struct OutcomeMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub protocol_version: ProtocolVersion,
    pub sequence: u64,
    /// `pending` until the first cycle completes.
    pub status: &'static str,
    pub values: Option<Snapshot>,
    pub stale: Vec<RegisterKey>,
    pub error: Option<String>,
}

impl OutcomeMsg {
    pub fn new(sequence: u64, outcome: Option<&CycleOutcome>) -> Self {
        let mut msg = Self {
            msg_type: "outcome",
            protocol_version: ProtocolVersion::v1(),
            sequence,
            status: "pending",
            values: None,
            stale: Vec::new(),
            error: None,
        };
        match outcome {
            None => {}
            Some(CycleOutcome::Success { snapshot }) => {
                msg.status = "success";
                msg.values = Some(snapshot.clone());
            }
            Some(CycleOutcome::Partial { snapshot, stale }) => {
                msg.status = "partial";
                msg.values = Some(snapshot.clone());
                msg.stale = stale.iter().copied().collect();
            }
            Some(CycleOutcome::Failed(err)) => {
                msg.status = "failed";
                msg.error = Some(err.to_string());
            }
        }
        msg
    }
}

#[derive(Debug, Serialize)]
pub struct WriteResultMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub protocol_version: ProtocolVersion,
    pub request_id: Option<u64>,
    pub register: RegisterKey,
    /// Value sent to the device, absent when a toggle never got that far.
    pub value: Option<RegisterValue>,
    pub ok: bool,
    pub error: Option<String>,
}

impl WriteResultMsg {
    pub fn new(
        request_id: Option<u64>,
        register: RegisterKey,
        value: Option<RegisterValue>,
        result: Result<(), &WriteError>,
    ) -> Self {
        Self {
            msg_type: "write_result",
            protocol_version: ProtocolVersion::v1(),
            request_id,
            register,
            value,
            ok: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub protocol_version: ProtocolVersion,
    pub message: String,
}

impl ErrorMsg {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            msg_type: "error",
            protocol_version: ProtocolVersion::v1(),
            message: message.into(),
        }
    }
}

// Incoming messages without a version are read as v1.

#[derive(Debug, Deserialize)]
pub struct HelloMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default = "ProtocolVersion::v1")]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default = "ProtocolVersion::v1")]
    pub protocol_version: ProtocolVersion,
}

#[derive(Debug, Deserialize)]
pub struct WriteMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default = "ProtocolVersion::v1")]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub request_id: Option<u64>,
    pub register: RegisterKey,
    pub value: RegisterValue,
}

#[derive(Debug, Deserialize)]
pub struct ToggleMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default = "ProtocolVersion::v1")]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub request_id: Option<u64>,
    pub register: RegisterKey,
}

#[derive(Debug)]
pub enum IncomingMessage {
    Hello(HelloMsg),
    Refresh(RefreshMsg),
    Write(WriteMsg),
    Toggle(ToggleMsg),
}

impl IncomingMessage {
    pub fn parse(line: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        let msg_type = value.get("type")?.as_str()?;
        match msg_type {
            "hello" => serde_json::from_value(value)
                .ok()
                .map(IncomingMessage::Hello),
            "refresh" => serde_json::from_value(value)
                .ok()
                .map(IncomingMessage::Refresh),
            "write" => serde_json::from_value(value)
                .ok()
                .map(IncomingMessage::Write),
            "toggle" => serde_json::from_value(value)
                .ok()
                .map(IncomingMessage::Toggle),
            _ => None,
        }
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        match self {
            IncomingMessage::Hello(m) => m.protocol_version,
            IncomingMessage::Refresh(m) => m.protocol_version,
            IncomingMessage::Write(m) => m.protocol_version,
            IncomingMessage::Toggle(m) => m.protocol_version,
        }
    }
}
