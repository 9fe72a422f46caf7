use serde::Serialize;
use tokio::sync::mpsc;

/// Type alias for the channel that delivers parsed server events from a live connection.
/// The channel closing means the remote side closed the session.
pub type InboundRx = mpsc::Receiver<Result<ServerEvent, AiError>>;

pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Kore";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are EcoSnap's friendly AI Eco-Coach. Help the user with sustainable living tips, recycling advice, and motivation. Keep answers concise and encouraging.";

/// Fixed parameters of a live coaching session
#[derive(Debug, Clone, PartialEq)]
pub struct LiveConfig {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    /// Rate declared for outbound microphone audio
    pub input_sample_rate: u32,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_LIVE_MODEL.into(),
            voice: DEFAULT_VOICE.into(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.into(),
            input_sample_rate: crate::audio::CAPTURE_SAMPLE_RATE,
        }
    }
}

/// One piece of realtime media sent to the session.
/// Serializes to the wire shape `{"mimeType", "data"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    /// Base64-encoded payload
    pub data: String,
}

impl MediaChunk {
    /// Realtime microphone audio: base64 PCM16 at `sample_rate`.
    pub fn pcm(data: String, sample_rate: u32) -> Self {
        Self {
            mime_type: format!("audio/pcm;rate={sample_rate}"),
            data,
        }
    }
}

/// Events the core cares about from the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    /// Base64 PCM16 speech at 24 kHz
    Audio { data: String },
    TurnComplete,
    Interrupted,
}

/// Error type for AI operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum AiError {
    #[error("Connection failed: {0}")]
    ConnectionError(String),
    #[error("Authentication failed: {0}")]
    AuthError(String),
    #[error("Model error: {0}")]
    ModelError(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}
