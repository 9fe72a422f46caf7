use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message,
};
use url::Url;

use super::{AiError, InboundRx, LiveConfig, LiveConnection, LiveProvider, MediaChunk, ServerEvent};

/// Gemini Live bidirectional streaming endpoint
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Gemini Live API client (WebSocket).
pub struct GeminiLiveClient {
    pub endpoint: String,
    pub api_key: String,
    pub connect_timeout: Duration,
}

impl GeminiLiveClient {
    pub fn new(api_key: &str) -> Self {
        Self {
            endpoint: LIVE_API_URL.to_string(),
            api_key: api_key.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Live WebSocket session for bidirectional audio.
pub struct GeminiLiveConnection {
    sender: mpsc::Sender<Message>,
    close_sender: Option<mpsc::Sender<()>>,
}

// ── helpers (also used by tests) ────────────────────────────────────

/// Build the endpoint URL with the API key attached.
fn build_ws_url(endpoint: &str, api_key: &str) -> Result<Url, AiError> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| AiError::ConnectionError(format!("bad endpoint URL: {e}")))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(AiError::ConnectionError(format!(
            "endpoint must be ws:// or wss://, got {}",
            url.scheme()
        )));
    }
    url.query_pairs_mut().append_pair("key", api_key);
    Ok(url)
}

/// Build the first frame: model, audio modality, voice and system instruction.
fn build_setup_message(config: &LiveConfig) -> Value {
    json!({
        "setup": {
            "model": format!("models/{}", config.model),
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": config.voice }
                    }
                }
            },
            "systemInstruction": {
                "parts": [{ "text": config.system_instruction }]
            }
        }
    })
}

/// Build a `realtimeInput` message carrying one audio chunk.
fn build_realtime_input(media: &MediaChunk) -> Value {
    json!({ "realtimeInput": { "audio": media } })
}

/// Parse one server message into the events this crate acts on.
/// Unknown content yields an empty list.
fn parse_event(text: &str) -> Result<Vec<ServerEvent>, AiError> {
    let v: Value = serde_json::from_str(text)
        .map_err(|e| AiError::InvalidResponse(format!("bad JSON: {e}")))?;

    if let Some(err) = v.get("error") {
        let msg = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        let code = err.get("code").map(|c| c.to_string()).unwrap_or_default();
        return Err(AiError::ModelError(format!("[{code}] {msg}")));
    }

    let mut events = Vec::new();

    if v.get("setupComplete").is_some() {
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(content) = v.get("serverContent") {
        if let Some(parts) = content.pointer("/modelTurn/parts").and_then(|p| p.as_array()) {
            for part in parts {
                if let Some(data) = part.pointer("/inlineData/data").and_then(|d| d.as_str()) {
                    events.push(ServerEvent::Audio {
                        data: data.to_string(),
                    });
                }
            }
        }
        if content.get("interrupted").and_then(|b| b.as_bool()) == Some(true) {
            events.push(ServerEvent::Interrupted);
        }
        if content.get("turnComplete").and_then(|b| b.as_bool()) == Some(true) {
            events.push(ServerEvent::TurnComplete);
        }
    }

    Ok(events)
}

enum Frame {
    Events(Vec<ServerEvent>),
    /// Server closed; carries an error unless the close was clean.
    Closed(Option<AiError>),
    Skip,
}

/// Gemini sends JSON in both text and binary frames.
fn classify(msg: Message) -> Result<Frame, AiError> {
    match msg {
        Message::Text(text) => parse_event(&text).map(Frame::Events),
        Message::Binary(bytes) => {
            let text = std::str::from_utf8(&bytes)
                .map_err(|e| AiError::InvalidResponse(format!("binary frame is not UTF-8: {e}")))?;
            parse_event(text).map(Frame::Events)
        }
        Message::Close(frame) => Ok(Frame::Closed(close_error(frame))),
        _ => Ok(Frame::Skip),
    }
}

fn close_error(frame: Option<CloseFrame>) -> Option<AiError> {
    let frame = frame?;
    match frame.code {
        CloseCode::Normal | CloseCode::Away => None,
        CloseCode::Policy => Some(AiError::AuthError(frame.reason.as_str().to_string())),
        code => Some(AiError::ConnectionError(format!(
            "closed by server ({}): {}",
            u16::from(code),
            frame.reason.as_str()
        ))),
    }
}

/// Read frames until the server acknowledges the setup message.
async fn await_setup<S>(source: &mut S) -> Result<(), AiError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = source.next().await {
        let msg = msg.map_err(|e| AiError::ConnectionError(format!("WebSocket read: {e}")))?;
        match classify(msg)? {
            Frame::Events(events) if events.contains(&ServerEvent::SetupComplete) => return Ok(()),
            Frame::Events(_) | Frame::Skip => {}
            Frame::Closed(err) => {
                return Err(err.unwrap_or_else(|| {
                    AiError::ConnectionError("server closed before setup completed".into())
                }))
            }
        }
    }
    Err(AiError::ConnectionError(
        "stream ended before setup completed".into(),
    ))
}

// ── LiveProvider impl ───────────────────────────────────────────────

#[async_trait]
impl LiveProvider for GeminiLiveClient {
    async fn connect(
        &self,
        config: &LiveConfig,
    ) -> Result<(Box<dyn LiveConnection>, InboundRx), AiError> {
        if self.api_key.is_empty() {
            return Err(AiError::AuthError("API key missing".into()));
        }
        let url = build_ws_url(&self.endpoint, &self.api_key)?;

        let request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AiError::ConnectionError(format!("request build: {e}")))?;

        let (ws_stream, _response) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| AiError::ConnectionError("WebSocket connect timed out".into()))?
        .map_err(|e| AiError::ConnectionError(format!("WebSocket connect: {e}")))?;

        let (mut ws_sink, mut ws_source) = ws_stream.split();

        // Send session setup
        let setup = build_setup_message(config);
        ws_sink
            .send(Message::Text(setup.to_string().into()))
            .await
            .map_err(|e| AiError::ConnectionError(format!("send setup: {e}")))?;

        tokio::time::timeout(self.connect_timeout, await_setup(&mut ws_source))
            .await
            .map_err(|_| AiError::ConnectionError("timed out waiting for setupComplete".into()))??;

        log::info!(
            "Gemini Live: session open (model={}, voice={})",
            config.model,
            config.voice
        );

        // Channel: caller → WebSocket sink
        let (send_tx, mut send_rx) = mpsc::channel::<Message>(64);
        // Channel: parsed events → caller
        let (event_tx, event_rx) = mpsc::channel::<Result<ServerEvent, AiError>>(64);
        // Channel: close signal
        let (close_tx, mut close_rx) = mpsc::channel::<()>(1);

        // Writer task
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(msg) = send_rx.recv() => {
                        if let Err(e) = ws_sink.send(msg).await {
                            log::warn!("Gemini Live: write failed: {e}");
                            break;
                        }
                    }
                    _ = close_rx.recv() => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // Reader task
        tokio::spawn(async move {
            while let Some(msg) = ws_source.next().await {
                let frame = msg
                    .map_err(|e| AiError::ConnectionError(format!("WebSocket read: {e}")))
                    .and_then(classify);
                match frame {
                    Ok(Frame::Events(events)) => {
                        for event in events {
                            if event_tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Frame::Skip) => {}
                    Ok(Frame::Closed(None)) => {
                        log::info!("Gemini Live: server closed the session");
                        return;
                    }
                    Ok(Frame::Closed(Some(e))) | Err(e) => {
                        let _ = event_tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        });

        Ok((
            Box::new(GeminiLiveConnection {
                sender: send_tx,
                close_sender: Some(close_tx),
            }),
            event_rx,
        ))
    }

    fn name(&self) -> &str {
        "gemini-live"
    }
}

// ── LiveConnection impl ─────────────────────────────────────────────

#[async_trait]
impl LiveConnection for GeminiLiveConnection {
    async fn send_media(&mut self, media: MediaChunk) -> Result<(), AiError> {
        if self.close_sender.is_none() {
            return Err(AiError::ConnectionError("session closed".into()));
        }
        let payload = build_realtime_input(&media);
        self.sender
            .send(Message::Text(payload.to_string().into()))
            .await
            .map_err(|e| AiError::ConnectionError(format!("send audio: {e}")))
    }

    async fn close(&mut self) -> Result<(), AiError> {
        if let Some(tx) = self.close_sender.take() {
            let _ = tx.send(()).await;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
