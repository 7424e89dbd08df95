//! Realtime session protocol
//!
//! Wire types for the bidirectional speech session: the setup message with
//! tool declarations, outbound audio and tool responses, and parsing of
//! server messages into [`ServerEvent`]s. The transport itself lives in
//! [`client`].

pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::Result;
use crate::config::LiveConfig;
use crate::voice::PcmPacket;

pub use client::WsConnector;

/// Name of the booking tool
pub const BOOK_APPOINTMENT_TOOL: &str = "book_sales_appointment";

/// Name of the support ticket tool
pub const LOG_TICKET_TOOL: &str = "log_support_ticket";

/// First frame sent on a new session
#[derive(Debug, Clone, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupPayload {
    pub model: String,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
    #[serde(rename = "systemInstruction")]
    pub system_instruction: SystemInstruction,
    pub tools: Vec<ToolSet>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    pub response_modalities: Vec<String>,
    #[serde(rename = "speechConfig")]
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeechConfig {
    #[serde(rename = "voiceConfig")]
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceConfig {
    #[serde(rename = "prebuiltVoiceConfig")]
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrebuiltVoiceConfig {
    #[serde(rename = "voiceName")]
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Group of function declarations offered to the model
#[derive(Debug, Clone, Serialize)]
pub struct ToolSet {
    #[serde(rename = "functionDeclarations")]
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// A callable tool and its JSON schema
#[derive(Debug, Clone, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Declarations for the booking and ticket tools
#[must_use]
pub fn tool_declarations() -> Vec<FunctionDeclaration> {
    vec![
        FunctionDeclaration {
            name: BOOK_APPOINTMENT_TOOL.to_string(),
            description: "Schedule a meeting or service request. Triggers email & database log."
                .to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "name": { "type": "STRING" },
                    "company": { "type": "STRING" },
                    "phone": { "type": "STRING" },
                    "interest": {
                        "type": "STRING",
                        "description": "Topic: 'UPS Maintenance', 'Rentals', 'Telecom', 'Smart Solutions', etc."
                    }
                },
                "required": ["name", "phone"]
            }),
        },
        FunctionDeclaration {
            name: LOG_TICKET_TOOL.to_string(),
            description: "Log a technical issue or complaint. Triggers email & database log."
                .to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "client_name": { "type": "STRING" },
                    "phone_number": { "type": "STRING" },
                    "issue_description": { "type": "STRING" },
                    "urgency": {
                        "type": "STRING",
                        "description": "Urgency: 'Low', 'Medium', 'High'"
                    }
                },
                "required": ["client_name", "phone_number", "issue_description"]
            }),
        },
    ]
}

/// Build the setup message for an audio session
#[must_use]
pub fn build_setup_message(config: &LiveConfig, system_instruction: String) -> SetupMessage {
    let model = if config.model.starts_with("models/") {
        config.model.clone()
    } else {
        format!("models/{}", config.model)
    };

    SetupMessage {
        setup: SetupPayload {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: SystemInstruction {
                parts: vec![TextPart {
                    text: system_instruction,
                }],
            },
            tools: vec![ToolSet {
                function_declarations: tool_declarations(),
            }],
        },
    }
}

/// A function call requested by the model
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolInvocation {
    /// Correlation id echoed in the response
    #[serde(rename = "id", default)]
    pub call_id: String,
    /// Tool name
    pub name: String,
    /// Arguments object
    #[serde(rename = "args", default)]
    pub arguments: Value,
}

/// Reply to one [`ToolInvocation`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: ToolResult,
}

/// Result text reported back to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolResult {
    pub result: String,
}

impl FunctionResponse {
    /// Build the response for `invocation`
    #[must_use]
    pub fn new(invocation: &ToolInvocation, result: impl Into<String>) -> Self {
        Self {
            id: invocation.call_id.clone(),
            name: invocation.name.clone(),
            response: ToolResult {
                result: result.into(),
            },
        }
    }
}

/// Messages the session controller hands to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// One microphone frame
    Audio(PcmPacket),
    /// Results for tool calls
    ToolResponse(Vec<FunctionResponse>),
    /// Close the session
    Close,
}

impl Outbound {
    /// Serialize to the JSON text sent on the wire; `Close` has no payload
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<Option<String>> {
        let value = match self {
            Self::Audio(packet) => json!({ "realtimeInput": { "mediaChunks": [packet] } }),
            Self::ToolResponse(responses) => {
                json!({ "toolResponse": { "functionResponses": responses } })
            }
            Self::Close => return Ok(None),
        };
        Ok(Some(serde_json::to_string(&value)?))
    }
}

/// Events decoded from the remote session
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Handshake finished
    SetupComplete,
    /// Base64 PCM16 mono audio at 24kHz
    Audio(String),
    /// The user barged in; discard queued speech
    Interrupted,
    /// Model finished its turn
    TurnComplete,
    /// Model requests tool execution
    ToolCall(Vec<ToolInvocation>),
    /// Remote closed the session
    Closed,
    /// Remote or transport error
    Error(String),
}

/// Parse one JSON server message into events
///
/// Unknown message kinds yield no events.
///
/// # Errors
///
/// Returns error if the text is not valid JSON
pub fn parse_server_message(text: &str) -> Result<Vec<ServerEvent>> {
    let value: Value = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if value.get("setupComplete").is_some() {
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(content) = value.get("serverContent") {
        if let Some(parts) = content.pointer("/modelTurn/parts").and_then(Value::as_array) {
            for part in parts {
                if let Some(data) = part.pointer("/inlineData/data").and_then(Value::as_str) {
                    events.push(ServerEvent::Audio(data.to_string()));
                }
            }
        }
        if content.get("interrupted").and_then(Value::as_bool) == Some(true) {
            events.push(ServerEvent::Interrupted);
        }
        if content.get("turnComplete").and_then(Value::as_bool) == Some(true) {
            events.push(ServerEvent::TurnComplete);
        }
    }

    if let Some(calls) = value.pointer("/toolCall/functionCalls") {
        let invocations: Vec<ToolInvocation> = serde_json::from_value(calls.clone())?;
        if !invocations.is_empty() {
            events.push(ServerEvent::ToolCall(invocations));
        }
    }

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown server error");
        events.push(ServerEvent::Error(message.to_string()));
    }

    if events.is_empty() {
        tracing::trace!(len = text.len(), "ignoring server message");
    }

    Ok(events)
}

/// An open session: two outbound queues plus the inbound event stream
///
/// Microphone audio goes through a bounded queue that sheds frames when
/// full. Tool responses and the close request use an unbounded control
/// queue that is served ahead of audio. Dropping both senders closes the
/// session as if [`Outbound::Close`] had been sent.
#[derive(Debug)]
pub struct LiveConnection {
    /// Microphone frames to send
    pub audio: mpsc::Sender<PcmPacket>,
    /// Tool responses and close requests
    pub control: mpsc::UnboundedSender<Outbound>,
    /// Decoded server events
    pub events: mpsc::Receiver<ServerEvent>,
}

/// Opens realtime sessions
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session and complete the setup handshake
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Transport`] if the connection or handshake fails
    async fn open(&self, setup: SetupMessage) -> Result<LiveConnection>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn setup_message_shape() {
        let config = Config::default();
        let setup = build_setup_message(&config.live, "be helpful".to_string());
        let value = serde_json::to_value(&setup).unwrap();

        assert_eq!(
            value.pointer("/setup/model").and_then(Value::as_str),
            Some("models/gemini-2.5-flash-native-audio-preview-12-2025")
        );
        assert_eq!(
            value.pointer("/setup/generationConfig/responseModalities/0"),
            Some(&json!("AUDIO"))
        );
        assert_eq!(
            value.pointer("/setup/generationConfig/speechConfig/voiceConfig/prebuiltVoiceConfig/voiceName"),
            Some(&json!("Zephyr"))
        );
        assert_eq!(
            value.pointer("/setup/systemInstruction/parts/0/text"),
            Some(&json!("be helpful"))
        );
        let names: Vec<_> = value
            .pointer("/setup/tools/0/functionDeclarations")
            .and_then(Value::as_array)
            .unwrap()
            .iter()
            .map(|d| d["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec![BOOK_APPOINTMENT_TOOL, LOG_TICKET_TOOL]);
    }

    #[test]
    fn tool_schemas_mark_required_fields() {
        let tools = tool_declarations();
        assert_eq!(tools[0].parameters["required"], json!(["name", "phone"]));
        assert_eq!(
            tools[1].parameters["required"],
            json!(["client_name", "phone_number", "issue_description"])
        );
    }

    #[test]
    fn audio_packet_wire_format() {
        let packet = PcmPacket {
            data: "AAA=".to_string(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        };
        let json = Outbound::Audio(packet).to_json().unwrap().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            value,
            json!({"realtimeInput": {"mediaChunks": [{"data": "AAA=", "mimeType": "audio/pcm;rate=16000"}]}})
        );
        assert!(Outbound::Close.to_json().unwrap().is_none());
    }

    #[test]
    fn tool_response_wire_format() {
        let invocation = ToolInvocation {
            call_id: "call-1".to_string(),
            name: BOOK_APPOINTMENT_TOOL.to_string(),
            arguments: json!({}),
        };
        let response = FunctionResponse::new(&invocation, "ok");
        let json = Outbound::ToolResponse(vec![response]).to_json().unwrap().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            value,
            json!({"toolResponse": {"functionResponses": [
                {"id": "call-1", "name": "book_sales_appointment", "response": {"result": "ok"}}
            ]}})
        );
    }

    #[test]
    fn parses_audio_and_turn_markers() {
        let events = parse_server_message(
            r#"{"serverContent":{"modelTurn":{"parts":[
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AQI="}},
                {"text":"ignored"}
            ]},"turnComplete":true}}"#,
        )
        .unwrap();
        assert_eq!(
            events,
            vec![ServerEvent::Audio("AQI=".to_string()), ServerEvent::TurnComplete]
        );

        let events = parse_server_message(r#"{"serverContent":{"interrupted":true}}"#).unwrap();
        assert_eq!(events, vec![ServerEvent::Interrupted]);
    }

    #[test]
    fn parses_tool_calls() {
        let events = parse_server_message(
            r#"{"toolCall":{"functionCalls":[
                {"id":"c1","name":"book_sales_appointment","args":{"name":"Sara","phone":"0100"}},
                {"id":"c2","name":"log_support_ticket"}
            ]}}"#,
        )
        .unwrap();
        let [ServerEvent::ToolCall(calls)] = events.as_slice() else {
            panic!("expected a tool call, got {events:?}");
        };
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].call_id, "c1");
        assert_eq!(calls[0].arguments["name"], "Sara");
        assert_eq!(calls[1].arguments, Value::Null);
    }

    #[test]
    fn parses_setup_and_errors() {
        assert_eq!(
            parse_server_message(r#"{"setupComplete":{}}"#).unwrap(),
            vec![ServerEvent::SetupComplete]
        );
        assert_eq!(
            parse_server_message(r#"{"error":{"message":"quota"}}"#).unwrap(),
            vec![ServerEvent::Error("quota".to_string())]
        );
        assert!(parse_server_message(r#"{"usageMetadata":{}}"#).unwrap().is_empty());
        assert!(parse_server_message("not json").is_err());
    }
}
