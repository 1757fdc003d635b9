//! Wire messages of the live bidirectional websocket protocol.
//!
//! Outbound: one `setup` frame, then `realtimeInput` frames carrying base64 PCM.
//! Inbound: JSON objects (in text or binary frames) demultiplexed into
//! [`ServerEvent`]s.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::audio::pcm::{self, EncodedChunk};
use crate::config::Config;
use crate::error::SessionError;
use crate::transcript::Speaker;

/// Inbound audio is 24 kHz unless the MIME tag says otherwise.
pub const DEFAULT_OUTPUT_RATE: u32 = 24000;

// ======================== Session configuration ========================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
}

/// Configuration negotiated when the connection opens. Opaque to the core.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub model: String,
    pub response_modality: Modality,
    pub input_transcription: bool,
    pub output_transcription: bool,
    pub system_prompt: String,
    pub voice_name: String,
}

impl SessionSetup {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.model.clone(),
            response_modality: Modality::Audio,
            input_transcription: config.input_transcription,
            output_transcription: config.output_transcription,
            system_prompt: config.system_prompt.to_string(),
            voice_name: config.voice_name.to_string(),
        }
    }

    pub fn to_message(&self) -> SetupMessage {
        let system_instruction = (!self.system_prompt.is_empty()).then(|| Content {
            parts: vec![TextPart { text: self.system_prompt.clone() }],
        });
        SetupMessage {
            setup: Setup {
                model: self.model.clone(),
                generation_config: GenerationConfig {
                    response_modalities: vec![self.response_modality],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: self.voice_name.clone(),
                            },
                        },
                    },
                },
                system_instruction,
                input_audio_transcription: self.input_transcription.then_some(Empty {}),
                output_audio_transcription: self.output_transcription.then_some(Empty {}),
            },
        }
    }
}

// ======================== Client → server ========================

#[derive(Serialize, Debug)]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Empty>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    pub speech_config: SpeechConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Serialize, Debug)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Serialize, Debug)]
pub struct TextPart {
    pub text: String,
}

/// Serialises as `{}`: presence alone switches the feature on.
#[derive(Serialize, Debug)]
pub struct Empty {}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Serialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

pub fn audio_input(chunk: &EncodedChunk) -> RealtimeInputMessage {
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            audio: Some(Blob {
                mime_type: chunk.mime_type.clone(),
                data: BASE64.encode(&chunk.data),
            }),
            ..Default::default()
        },
    }
}

pub fn audio_stream_end() -> RealtimeInputMessage {
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            audio_stream_end: Some(true),
            ..Default::default()
        },
    }
}

// ======================== Server → client ========================

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<GoAway>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Deserialize, Debug, Default)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub text: Option<String>,
    pub inline_data: Option<InlineData>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: Option<String>,
    pub data: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct Transcription {
    pub text: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    pub time_left: Option<String>,
}

/// One demultiplexed inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    AudioDelta(EncodedChunk),
    TranscriptDelta { speaker: Speaker, text: String },
    Interrupted,
    TurnComplete,
}

/// Everything one inbound frame carried.
#[derive(Debug, Default, PartialEq)]
pub struct Inbound {
    pub setup_complete: bool,
    pub go_away: Option<String>,
    pub events: Vec<ServerEvent>,
    /// Payloads that were present but unusable; already skipped.
    pub malformed: Vec<SessionError>,
}

pub fn decode_server_message(raw: &[u8]) -> Result<Inbound, SessionError> {
    let msg: ServerMessage = serde_json::from_slice(raw)
        .map_err(|e| SessionError::MalformedInbound(format!("not a server message: {}", e)))?;
    Ok(msg.into_inbound())
}

impl ServerMessage {
    /// Interruption first, then audio, then transcripts, then turn completion,
    /// so an interruption never cancels audio that arrived with it.
    pub fn into_inbound(self) -> Inbound {
        let mut inbound = Inbound {
            setup_complete: self.setup_complete.is_some(),
            go_away: self
                .go_away
                .map(|g| g.time_left.unwrap_or_else(|| "unknown".to_string())),
            ..Default::default()
        };

        let Some(content) = self.server_content else {
            return inbound;
        };

        if content.interrupted {
            inbound.events.push(ServerEvent::Interrupted);
        }

        for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
            let Some(inline) = part.inline_data else {
                continue;
            };
            match audio_delta(inline) {
                Ok(chunk) => inbound.events.push(ServerEvent::AudioDelta(chunk)),
                Err(e) => inbound.malformed.push(e),
            }
        }

        let transcripts = [
            (Speaker::User, content.input_transcription),
            (Speaker::Model, content.output_transcription),
        ];
        for (speaker, transcription) in transcripts {
            if let Some(text) = transcription.and_then(|t| t.text) {
                if !text.trim().is_empty() {
                    inbound.events.push(ServerEvent::TranscriptDelta { speaker, text });
                }
            }
        }

        if content.turn_complete {
            inbound.events.push(ServerEvent::TurnComplete);
        }
        inbound
    }
}

fn audio_delta(inline: InlineData) -> Result<EncodedChunk, SessionError> {
    let mime_type = inline
        .mime_type
        .unwrap_or_else(|| pcm::pcm_mime(DEFAULT_OUTPUT_RATE));
    if !mime_type.starts_with("audio/") {
        return Err(SessionError::MalformedInbound(format!(
            "inline data is not audio: {}",
            mime_type
        )));
    }
    let data = inline
        .data
        .filter(|d| !d.is_empty())
        .ok_or_else(|| SessionError::MalformedInbound("audio delta without payload".to_string()))?;
    let bytes = BASE64
        .decode(data.as_bytes())
        .map_err(|e| SessionError::MalformedInbound(format!("audio delta is not base64: {}", e)))?;
    Ok(EncodedChunk {
        data: bytes.into(),
        mime_type,
    })
}
