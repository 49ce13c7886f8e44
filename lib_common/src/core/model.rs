//! # Wire and Telemetry Data Model
//!
//! JSON message shapes exchanged with the acquisition endpoint, plus the
//! normalized telemetry types that flow through the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Command verbs understood by the acquisition endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    ConnectPlc,
    DisconnectPlc,
    ReadPlc,
    WritePlc,
}

/// PLC addressing configuration forwarded to the endpoint on connect.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlcConfig {
    /// Addressing mode: "tcp" or "serial".
    #[serde(rename = "type")]
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub com_port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baud_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slave: Option<u8>,
    /// Endpoint-side request timeout in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Endpoint-side polling interval in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>,
}

/// Outbound command frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundCommand {
    pub action: CommandAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub register: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<PlcConfig>,
}

impl OutboundCommand {
    /// A bare command with no operands.
    pub fn bare(action: CommandAction) -> Self {
        Self {
            action,
            register: None,
            value: None,
            count: None,
            message_id: None,
            config: None,
        }
    }
}

/// Inbound frame from the acquisition endpoint.
///
/// A frame carrying a `messageId` is a command response; one without is
/// unsolicited telemetry (or a standalone error notification).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub register: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

/// Operation kind of a correlated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

/// Where a telemetry sample was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Observed directly over the live connection.
    Live,
    /// Retrieved from the persisted sample store.
    Persisted,
}

/// A sampled register value. Coil registers carry booleans, word registers
/// carry numbers; the wire itself only ever carries numbers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Bool(bool),
    Number(f64),
}

impl SampleValue {
    /// Coil interpretation: any non-zero word reads as ON.
    pub fn as_bool(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Number(n) => *n,
        }
    }
}

impl From<bool> for SampleValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for SampleValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

/// One immutable telemetry observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub register: u16,
    pub value: SampleValue,
    pub provenance: Provenance,
}

impl TelemetrySample {
    /// A sample observed on the live connection, stamped now.
    pub fn live(register: u16, value: SampleValue) -> Self {
        Self {
            timestamp: Utc::now(),
            register,
            value,
            provenance: Provenance::Live,
        }
    }

    /// Deduplication key: millisecond timestamp plus register, independent
    /// of provenance.
    pub fn key(&self) -> (i64, u16) {
        (self.timestamp.timestamp_millis(), self.register)
    }
}

/// Non-fatal conditions surfaced to observers, never to a request caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "detail")]
pub enum Notice {
    /// The endpoint pushed an unsolicited error frame.
    RemoteError(String),
    /// Connected but no telemetry for this many seconds.
    DataflowStalled(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_write_matches_endpoint_shape() {
        let cmd = OutboundCommand {
            action: CommandAction::WritePlc,
            register: Some(0x6304),
            value: Some(1.0),
            count: None,
            message_id: Some("17".to_string()),
            config: None,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["action"], "write_plc");
        assert_eq!(json["register"], 0x6304);
        assert_eq!(json["value"], 1.0);
        assert_eq!(json["messageId"], "17");
        // Unset operands must not appear on the wire at all.
        assert!(json.get("count").is_none());
        assert!(json.get("config").is_none());
    }

    #[test]
    fn outbound_connect_carries_config() {
        let cmd = OutboundCommand {
            config: Some(PlcConfig {
                mode: "tcp".to_string(),
                ip: Some("192.168.1.10".to_string()),
                port: Some(502),
                slave: Some(1),
                ..Default::default()
            }),
            ..OutboundCommand::bare(CommandAction::ConnectPlc)
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["action"], "connect_plc");
        assert_eq!(json["config"]["type"], "tcp");
        assert_eq!(json["config"]["ip"], "192.168.1.10");
        assert_eq!(json["config"]["port"], 502);
    }

    #[test]
    fn inbound_frame_decodes_telemetry_and_response() {
        let telemetry: InboundFrame =
            serde_json::from_str(r#"{"data":[1],"register":25348,"recordCount":42}"#).unwrap();
        assert!(telemetry.message_id.is_none());
        assert_eq!(telemetry.data, Some(vec![1.0]));
        assert_eq!(telemetry.register, Some(0x6304));

        let response: InboundFrame =
            serde_json::from_str(r#"{"messageId":"3","success":true,"data":[7]}"#).unwrap();
        assert_eq!(response.message_id.as_deref(), Some("3"));
        assert_eq!(response.success, Some(true));
    }

    #[test]
    fn sample_value_coil_interpretation() {
        assert!(SampleValue::Bool(true).as_bool());
        assert!(SampleValue::Number(1.0).as_bool());
        assert!(!SampleValue::Number(0.0).as_bool());
        assert_eq!(SampleValue::Bool(true).as_f64(), 1.0);
    }

    #[test]
    fn sample_key_ignores_provenance() {
        let ts = Utc::now();
        let live = TelemetrySample {
            timestamp: ts,
            register: 0x6304,
            value: SampleValue::Bool(true),
            provenance: Provenance::Live,
        };
        let persisted = TelemetrySample {
            timestamp: ts,
            register: 0x6304,
            value: SampleValue::Bool(false),
            provenance: Provenance::Persisted,
        };
        assert_eq!(live.key(), persisted.key());
    }
}
