//! E2E test: opens a real Gemini Live session, streams silence and a short
//! tone, and checks the connection stays healthy.
//!
//! Requires environment variables:
//!   GEMINI_API_KEY - API key with Live API access
//!
//! Run: cargo test --test live_e2e -- --ignored

use std::time::Duration;

use ecosnap_lib::ai::gemini_live::GeminiLiveClient;
use ecosnap_lib::ai::{LiveConfig, LiveProvider, MediaChunk, ServerEvent};
use ecosnap_lib::audio::{pcm, CAPTURE_FRAME_SIZE, CAPTURE_SAMPLE_RATE};

fn get_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| panic!("Set {} env var to run this test", key))
}

#[tokio::test]
#[ignore] // Only run manually with --ignored flag
async fn live_session_accepts_audio() {
    let _ = env_logger::builder().is_test(true).try_init();
    let api_key = get_env("GEMINI_API_KEY");

    let client = GeminiLiveClient::new(&api_key).with_connect_timeout(Duration::from_secs(20));
    let (mut connection, mut inbound) = client
        .connect(&LiveConfig::default())
        .await
        .expect("connect failed");
    println!("Connected to {}", client.name());

    // ~1.5 s of a quiet 220 Hz tone followed by silence.
    let tone: Vec<f32> = (0..CAPTURE_SAMPLE_RATE as usize * 3 / 2)
        .map(|i| {
            let t = i as f32 / CAPTURE_SAMPLE_RATE as f32;
            0.1 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()
        })
        .collect();
    let silence = vec![0.0f32; CAPTURE_SAMPLE_RATE as usize];

    for frame in tone.chunks(CAPTURE_FRAME_SIZE).chain(silence.chunks(CAPTURE_FRAME_SIZE)) {
        connection
            .send_media(MediaChunk::pcm(pcm::encode(frame), CAPTURE_SAMPLE_RATE))
            .await
            .expect("send failed");
    }
    println!("Audio sent");

    // Drain whatever arrives for a few seconds; any error frame fails the test.
    let mut audio_chunks = 0usize;
    let deadline = tokio::time::sleep(Duration::from_secs(8));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = inbound.recv() => match event {
                Some(Ok(ServerEvent::Audio { data })) => {
                    let samples = pcm::decode(&data).expect("server sent malformed PCM");
                    audio_chunks += 1;
                    println!("Audio chunk: {} samples", samples.len());
                }
                Some(Ok(other)) => println!("Event: {other:?}"),
                Some(Err(e)) => panic!("Transport error: {e}"),
                None => panic!("Server closed the session early"),
            },
        }
    }
    println!("Received {audio_chunks} audio chunks");

    connection.close().await.expect("close failed");
}
