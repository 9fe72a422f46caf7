use async_trait::async_trait;

pub mod gemini_live;
pub mod types;
pub use types::*;

/// Trait for remote duplex voice providers (Gemini Live, test doubles, ...).
#[async_trait]
pub trait LiveProvider: Send + Sync {
    /// Open a live session. Resolves once the remote side accepted the setup.
    /// Returns the outbound handle plus a receiver for inbound events.
    async fn connect(
        &self,
        config: &LiveConfig,
    ) -> Result<(Box<dyn LiveConnection>, InboundRx), AiError>;

    /// Provider name for logging/display
    fn name(&self) -> &str;
}

/// Outbound half of an open live session
#[async_trait]
pub trait LiveConnection: Send {
    /// Send one realtime media chunk
    async fn send_media(&mut self, media: MediaChunk) -> Result<(), AiError>;

    /// Close the session. Safe to call more than once.
    async fn close(&mut self) -> Result<(), AiError>;
}
