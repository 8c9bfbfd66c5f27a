//! CartTalk call client
//!
//! Starts a call against the configured server, then talks hands-free through the
//! default microphone and speakers until Ctrl-C or the server hangs up.
//!
//! ```text
//! carttalk-client                 # place a call
//! carttalk-client --list-devices  # show capture devices
//! ```

use anyhow::Context;
use carttalk_voice::{
    CallBootstrap, CallConfig, CallSession, MicrophoneSource, RodioPlayback, SessionEvent,
    WsTransport,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[carttalk-client] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if std::env::args().skip(1).any(|arg| arg == "--list-devices") {
        for name in MicrophoneSource::list_input_devices()? {
            println!("🎤 {}", name);
        }
        return Ok(());
    }

    let config = CallConfig::load().context("load call config")?;
    let bootstrap = CallBootstrap::new(&config.server_url)?;
    tracing::info!(server = %bootstrap.base_url(), "📞 Starting call");
    let ticket = bootstrap.start_call().await.context("start call")?;
    let stream_url = bootstrap.stream_url(&ticket.call_id)?;

    tracing::info!(call_id = %ticket.call_id, url = %stream_url, "Opening stream channel");
    let transport = WsTransport::connect(stream_url.as_str()).await?;

    let (mut session, handle) = CallSession::new(
        ticket.call_id.clone(),
        config.session(),
        Box::new(MicrophoneSource::new(config.microphone())),
        Box::new(transport),
        Box::new(RodioPlayback::new()),
    );
    let mut events = session
        .take_event_receiver()
        .context("session event stream already taken")?;

    println!("{}", session.state().label());

    let run = session.run();
    tokio::pin!(run);
    let mut hung_up = false;

    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            Some(event) = events.recv() => print_event(event),
            _ = tokio::signal::ctrl_c(), if !hung_up => {
                tracing::info!("CTRL-C received; hanging up");
                hung_up = handle.hangup();
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        print_event(event);
    }

    let summary = result?;
    tracing::info!(
        call_id = %summary.call_id,
        reason = ?summary.end_reason,
        utterances = summary.utterances_sent,
        turns = summary.turns.len(),
        duration_secs = (summary.ended_at - summary.started_at).num_seconds(),
        "Call finished"
    );
    Ok(())
}

fn print_event(event: SessionEvent) {
    match event {
        SessionEvent::StateChanged { to, .. } => println!("{}", to.label()),
        SessionEvent::Turn(turn) => println!("{}", turn),
        SessionEvent::UtteranceSent { bytes } => tracing::debug!(bytes, "utterance sent"),
        SessionEvent::Ended { reason } => tracing::debug!(?reason, "session ended"),
    }
}
