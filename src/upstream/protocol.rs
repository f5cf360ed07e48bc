//! Wire messages of the live conversational-audio API.
//!
//! Only the subset the relay needs: the session setup, realtime audio input,
//! and the audio parts of server content. Everything else the service sends
//! is accepted and ignored.

use crate::audio::codec::INPUT_SAMPLE_RATE;
use crate::error::RelayError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Messages sent to the service.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput {
    pub audio: Blob,
}

/// Base64 payload with its mime type, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// Any message received from the service. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub inline_data: Option<Blob>,
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    pub time_left: Option<String>,
}

/// Opening message for one upstream session.
pub fn setup_message(model: &str, modality: &str, instruction: &str) -> Result<String, RelayError> {
    let model = if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{}", model)
    };
    let system_instruction = (!instruction.is_empty()).then(|| Content {
        parts: vec![TextPart {
            text: instruction.to_string(),
        }],
    });

    encode(&ClientMessage::Setup(Setup {
        model,
        generation_config: GenerationConfig {
            response_modalities: vec![modality.to_string()],
        },
        system_instruction,
    }))
}

/// One client frame as a realtime audio chunk.
pub fn audio_input(frame: &[u8]) -> Result<String, RelayError> {
    encode(&ClientMessage::RealtimeInput(RealtimeInput {
        audio: Blob {
            mime_type: format!("audio/pcm;rate={}", INPUT_SAMPLE_RATE),
            data: STANDARD.encode(frame),
        },
    }))
}

fn encode(message: &ClientMessage) -> Result<String, RelayError> {
    serde_json::to_string(message).map_err(|e| RelayError::Protocol(e.to_string()))
}

pub fn parse(text: &str) -> Result<ServerMessage, RelayError> {
    serde_json::from_str(text).map_err(|e| RelayError::Protocol(e.to_string()))
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Decoded PCM payloads of this message, in part order.
    pub fn audio_chunks(&self) -> Result<Vec<Bytes>, RelayError> {
        let Some(turn) = self
            .server_content
            .as_ref()
            .and_then(|content| content.model_turn.as_ref())
        else {
            return Ok(Vec::new());
        };

        turn.parts
            .iter()
            .filter_map(|part| part.inline_data.as_ref())
            .filter(|blob| blob.mime_type.starts_with("audio/pcm"))
            .map(|blob| {
                STANDARD
                    .decode(&blob.data)
                    .map(Bytes::from)
                    .map_err(|e| RelayError::Protocol(format!("bad audio payload: {}", e)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_setup_message_shape() {
        let text = setup_message("gemini-live", "AUDIO", "Be brief.").unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/gemini-live",
                    "generationConfig": { "responseModalities": ["AUDIO"] },
                    "systemInstruction": { "parts": [{ "text": "Be brief." }] }
                }
            })
        );
    }

    #[test]
    fn test_setup_without_instruction() {
        let text = setup_message("models/x", "AUDIO", "").unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["setup"]["model"], "models/x");
        assert!(value["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn test_audio_input_shape() {
        let text = audio_input(&[1, 0, 255, 127]).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(value["realtimeInput"]["audio"]["data"], STANDARD.encode([1, 0, 255, 127]));
    }

    #[test]
    fn test_audio_chunks_in_part_order() {
        let text = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": STANDARD.encode([1, 2]) } },
                        { "text": "thinking" },
                        { "inlineData": { "mimeType": "image/png", "data": STANDARD.encode([9]) } },
                        { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": STANDARD.encode([3, 4]) } }
                    ]
                }
            }
        })
        .to_string();

        let message = parse(&text).unwrap();
        let chunks = message.audio_chunks().unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(&[1, 2]), Bytes::from_static(&[3, 4])]);
    }

    #[test]
    fn test_control_messages() {
        assert!(parse(r#"{"setupComplete": {}}"#).unwrap().is_setup_complete());

        let done = parse(r#"{"serverContent": {"turnComplete": true}}"#).unwrap();
        assert!(done.server_content.unwrap().turn_complete);

        let away = parse(r#"{"goAway": {"timeLeft": "10s"}, "usageMetadata": {}}"#).unwrap();
        assert_eq!(away.go_away.unwrap().time_left.as_deref(), Some("10s"));
    }

    #[test]
    fn test_bad_payloads_are_protocol_errors() {
        assert!(matches!(parse("not json"), Err(RelayError::Protocol(_))));

        let text = json!({
            "serverContent": { "modelTurn": { "parts": [
                { "inlineData": { "mimeType": "audio/pcm", "data": "***" } }
            ] } }
        })
        .to_string();
        let err = parse(&text).unwrap().audio_chunks().unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }
}
