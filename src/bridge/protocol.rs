//! Messages exchanged with the script host, one JSON object per line.
//!
//! Inbound:
//!
//! ```json
//! {"type": "invoke", "id": "7", "op": "executeScript", "scriptType": "cmd", "command": "dir"}
//! {"type": "saveButtonOrder", "order": ["b2", "b1"]}
//! ```
//!
//! Outbound:
//!
//! ```json
//! {"type": "result", "id": "7", "result": "..."}
//! {"type": "buttonOrderSaved"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plugins::PluginParams;
use crate::toolbar::{ButtonConfig, ToolbarConfig};

/// A capability call, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CapabilityOperation {
    ExecuteScript {
        script_type: String,
        command: String,
        #[serde(default)]
        elevate: bool,
    },
    ExecuteApplication {
        path: String,
        #[serde(default)]
        arguments: String,
        #[serde(default)]
        elevate: bool,
    },
    OpenUrl {
        url: String,
    },
    ListPlugins,
    ExecutePlugin {
        plugin_id: String,
        #[serde(default)]
        params: Option<PluginParams>,
    },
    AddPlugin {
        path: String,
    },
    RemovePlugin {
        plugin_id: String,
    },
}

/// Layout edits sent by the toolbar UI.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ToolbarMessage {
    SaveButtonOrder { order: Vec<String> },
    OpenConfigDialog { button: ButtonConfig },
    AddButton { button: ButtonConfig },
    RemoveButton { button_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The operation is `Err` when the payload did not describe a known
    /// operation; the caller still owes the host a result for `id`.
    Invoke {
        id: String,
        operation: Result<CapabilityOperation, String>,
    },
    Toolbar(ToolbarMessage),
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Outbound {
    Result { id: String, result: String },
    ButtonOrderSaved,
    ButtonConfigUpdated { button: ButtonConfig },
    ButtonSaved { button: ButtonConfig },
    ToolbarUpdated { config: ToolbarConfig },
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("not a JSON object: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has no type")]
    MissingType,

    #[error("invoke message has no id")]
    MissingId,

    #[error("malformed {kind} message: {reason}")]
    Malformed { kind: String, reason: String },
}

const TOOLBAR_TYPES: &[&str] = &[
    "saveButtonOrder",
    "openConfigDialog",
    "addButton",
    "removeButton",
];

/// Classifies one line from the host.
pub fn parse_inbound(line: &str) -> Result<Inbound, ProtocolError> {
    let value: Value = serde_json::from_str(line)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if kind == "invoke" {
        let id = match value.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(ProtocolError::MissingId),
        };
        let operation = serde_json::from_value(value).map_err(|e| e.to_string());
        return Ok(Inbound::Invoke { id, operation });
    }

    if TOOLBAR_TYPES.contains(&kind.as_str()) {
        return serde_json::from_value(value)
            .map(Inbound::Toolbar)
            .map_err(|e| ProtocolError::Malformed {
                kind,
                reason: e.to_string(),
            });
    }

    Ok(Inbound::Unknown(kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_invoke() {
        let inbound = parse_inbound(
            r#"{"type":"invoke","id":"1","op":"executeScript","scriptType":"cmd","command":"dir"}"#,
        )
        .unwrap();
        assert_eq!(
            inbound,
            Inbound::Invoke {
                id: "1".into(),
                operation: Ok(CapabilityOperation::ExecuteScript {
                    script_type: "cmd".into(),
                    command: "dir".into(),
                    elevate: false,
                }),
            }
        );
    }

    #[test]
    fn test_parse_invoke_numeric_id_and_params() {
        let inbound = parse_inbound(
            r#"{"type":"invoke","id":42,"op":"executePlugin","pluginId":"clock","params":{"tz":"UTC"}}"#,
        )
        .unwrap();
        let Inbound::Invoke { id, operation } = inbound else {
            panic!("expected invoke");
        };
        assert_eq!(id, "42");
        let Ok(CapabilityOperation::ExecutePlugin { plugin_id, params }) = operation else {
            panic!("expected executePlugin");
        };
        assert_eq!(plugin_id, "clock");
        assert_eq!(params.unwrap()["tz"], "UTC");
    }

    #[test]
    fn test_unknown_op_keeps_the_id() {
        let inbound = parse_inbound(r#"{"type":"invoke","id":"9","op":"formatDisk"}"#).unwrap();
        assert!(matches!(inbound, Inbound::Invoke { ref id, operation: Err(_) } if id == "9"));
    }

    #[test]
    fn test_parse_toolbar_messages() {
        assert_eq!(
            parse_inbound(r#"{"type":"removeButton","buttonId":"b1"}"#).unwrap(),
            Inbound::Toolbar(ToolbarMessage::RemoveButton {
                button_id: "b1".into()
            })
        );
        let inbound =
            parse_inbound(r#"{"type":"addButton","button":{"label":"Docs","type":"url"}}"#).unwrap();
        assert!(matches!(
            inbound,
            Inbound::Toolbar(ToolbarMessage::AddButton { ref button }) if button.label == "Docs"
        ));
    }

    #[test]
    fn test_unknown_and_malformed_messages() {
        assert_eq!(
            parse_inbound(r#"{"type":"openSettings"}"#).unwrap(),
            Inbound::Unknown("openSettings".into())
        );
        assert!(matches!(
            parse_inbound(r#"{"type":"saveButtonOrder"}"#),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(parse_inbound(r#"{"id":1}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(
            parse_inbound(r#"{"type":"invoke","op":"listPlugins"}"#),
            Err(ProtocolError::MissingId)
        ));
        assert!(matches!(parse_inbound("not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_outbound_shapes() {
        let json = serde_json::to_value(Outbound::Result {
            id: "1".into(),
            result: "ok".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "result", "id": "1", "result": "ok"}));
        assert_eq!(
            serde_json::to_value(Outbound::ButtonOrderSaved).unwrap(),
            serde_json::json!({"type": "buttonOrderSaved"})
        );
    }
}
