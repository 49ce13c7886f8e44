use lib_common::{Notice, TelemetrySample};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command sent by a UI client over the downstream socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    pub action: String,
    pub register: Option<u16>,
    pub value: Option<f64>,
    pub count: Option<u16>,
    pub message_id: Option<String>,
}

/// Event or response pushed to a UI client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl ServerMessage {
    pub fn telemetry(sample: &TelemetrySample) -> Self {
        Self {
            r#type: "telemetry".to_string(),
            message: serde_json::to_value(sample).ok(),
            error: None,
            message_id: None,
            success: None,
        }
    }

    pub fn status(connected: bool) -> Self {
        Self {
            r#type: "status".to_string(),
            message: Some(Value::Bool(connected)),
            error: None,
            message_id: None,
            success: None,
        }
    }

    pub fn notice(notice: &Notice) -> Self {
        Self {
            r#type: "notice".to_string(),
            message: serde_json::to_value(notice).ok(),
            error: None,
            message_id: None,
            success: None,
        }
    }

    pub fn history(window: &[TelemetrySample]) -> Self {
        Self {
            r#type: "history".to_string(),
            message: serde_json::to_value(window).ok(),
            error: None,
            message_id: None,
            success: None,
        }
    }

    pub fn response_ok(message_id: Option<String>, data: Value) -> Self {
        Self {
            r#type: "response".to_string(),
            message: Some(data),
            error: None,
            message_id,
            success: Some(true),
        }
    }

    pub fn response_err(message_id: Option<String>, error: String) -> Self {
        Self {
            r#type: "response".to_string(),
            message: None,
            error: Some(error),
            message_id,
            success: Some(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_decodes_write() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"action":"write_plc","register":25348,"value":1,"messageId":"abc"}"#,
        )
        .unwrap();
        assert_eq!(msg.action, "write_plc");
        assert_eq!(msg.register, Some(0x6304));
        assert_eq!(msg.value, Some(1.0));
        assert_eq!(msg.message_id.as_deref(), Some("abc"));
    }

    #[test]
    fn response_echoes_the_client_message_id() {
        let reply = ServerMessage::response_err(Some("abc".to_string()), "timeout".to_string());
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["messageId"], "abc");
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "timeout");
        assert!(json.get("message").is_none());
    }
}
