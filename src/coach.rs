// coach.rs: the "Live Eco Coach" control surface.
//
// Maps one button onto the session lifecycle and renders its status line.

use std::sync::Arc;

use tokio::sync::watch;

use crate::live_session::{LiveSession, SessionError, SessionState};

pub struct CoachController {
    session: Arc<LiveSession>,
}

impl CoachController {
    pub fn new(session: Arc<LiveSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<LiveSession> {
        &self.session
    }

    /// Start the coach when idle, stop it when running. Returns the state
    /// after the action.
    pub async fn toggle(&self) -> Result<SessionState, SessionError> {
        if self.session.state().is_active() {
            log::info!("Coach toggled off");
            self.session.stop().await;
        } else {
            log::info!("Coach toggled on");
            self.session.start().await?;
        }
        Ok(self.session.state())
    }

    pub fn status(&self) -> String {
        status_text(&self.session.state())
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }
}

/// Status line for the coach panel.
pub fn status_text(state: &SessionState) -> String {
    match state {
        SessionState::Idle => "Tap to talk with your Eco-Coach".into(),
        SessionState::Connecting => "Connecting...".into(),
        SessionState::Listening => "Listening...".into(),
        SessionState::Speaking => "Eco-Coach is speaking".into(),
        SessionState::Closed => "Session ended".into(),
        SessionState::Error(msg) => format!("Error: {msg}"),
    }
}

/// Label for the toggle button.
pub fn button_label(state: &SessionState) -> &'static str {
    if state.is_active() {
        "End session"
    } else {
        "Start Live Coach"
    }
}
