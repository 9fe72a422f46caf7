pub mod ai;
pub mod audio;
pub mod coach;
pub mod live_session;
pub mod settings;

use std::sync::Arc;

use ai::gemini_live::GeminiLiveClient;
use audio::capture::CpalMicrophone;
use audio::output::CpalSpeaker;
use coach::{status_text, CoachController};
use live_session::LiveSession;
use settings::Settings;

/// Run the terminal Eco-Coach: start a session, print status changes,
/// stop on Ctrl-C or when the session ends.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let path = settings::default_path();
    let mut settings = Settings::load(&path)?;
    settings.apply_env();

    let client = GeminiLiveClient::new(&settings.api_key)
        .with_endpoint(&settings.endpoint)
        .with_connect_timeout(settings.connect_timeout());

    let session = LiveSession::new(
        Arc::new(client),
        Arc::new(CpalMicrophone),
        Arc::new(CpalSpeaker),
        settings.live_config(),
    )
    .with_outbound_queue(settings.outbound_queue);
    let controller = CoachController::new(Arc::new(session));

    let mut status = controller.watch();
    let printer = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let state = status.borrow_and_update().clone();
            println!("{}", status_text(&state));
            if !state.is_active() {
                break;
            }
        }
    });

    controller.toggle().await?;
    println!("Press Ctrl-C to end the session.");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            log::info!("Ctrl-C received");
        }
        _ = printer => {}
    }

    controller.session().stop().await;
    println!("{}", controller.status());
    Ok(())
}
