use std::sync::Arc;

use live_voice_rs::audio::{AlsaBackend, AudioConfig};
use live_voice_rs::net_link::LiveLink;
use live_voice_rs::{Config, SessionUpdate, VoiceSession};
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置，密钥可由环境变量覆盖
    let config = Config::new()
        .map_err(|e| anyhow::anyhow!(e))?
        .with_env_overrides();
    if config.api_key.is_empty() {
        anyhow::bail!("No API key: set LIVE_VOICE_API_KEY or GEMINI_API_KEY");
    }

    let backend = Arc::new(AlsaBackend::new(AudioConfig::from(&config)));
    let transport = Box::new(LiveLink::new(&config));
    let mut session = VoiceSession::new(config, backend, transport);
    let Some(mut updates) = session.take_updates() else {
        anyhow::bail!("Session update stream unavailable");
    };

    println!("{} {} starting. Press Ctrl+C to stop.", env!("APP_NAME"), env!("APP_VERSION"));

    let started = tokio::select! {
        res = session.start() => res,
        _ = signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down...");
            session.stop().await;
            return Ok(());
        }
    };
    if let Err(e) = started {
        session.stop().await;
        return Err(e.into());
    }
    println!("Session {} open. Start talking.", session.id());

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down...");
                break;
            }
            update = updates.recv() => match update {
                Some(SessionUpdate::State(state)) => {
                    log::info!("Session state: {:?}", state);
                    if state.is_terminal() {
                        break;
                    }
                }
                Some(SessionUpdate::Speaking(true)) => println!("[model speaking]"),
                Some(SessionUpdate::Speaking(false)) => println!("[model quiet]"),
                Some(SessionUpdate::Transcript { index, entry }) => {
                    println!("#{} {}: {}", index, entry.speaker, entry.text);
                }
                Some(SessionUpdate::TranscriptCleared) => println!("[transcript cleared]"),
                Some(SessionUpdate::Failed(e)) => eprintln!("Session failed: {}", e),
                None => break,
            },
        }
    }

    session.stop().await;
    while let Ok(update) = updates.try_recv() {
        if let SessionUpdate::Failed(e) = update {
            eprintln!("Session failed: {}", e);
        }
    }
    println!("--- Transcript ---\n{}", session.render_transcript());
    Ok(())
}
