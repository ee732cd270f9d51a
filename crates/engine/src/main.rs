//! Taleweaver Engine - CLI wrapper
//!
//! Opens one session directory as a tab and drives it from stdin, printing
//! the event stream. Exit codes: 0 normal, 2 configuration error,
//! 3 persistence error, 4 unrecoverable pipeline error.

use std::path::PathBuf;
use std::process::ExitCode;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taleweaver_domain::TabId;
use taleweaver_engine::{AppConfig, Engine, EngineError, EngineEvent};

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taleweaver_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "engine exited with error");
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run() -> Result<(), EngineError> {
    let mut args = std::env::args().skip(1);
    let session_dir = PathBuf::from(args.next().unwrap_or_else(|| "session".to_string()));
    let config_path = PathBuf::from(args.next().unwrap_or_else(|| "config.json".to_string()));

    let config = if config_path.exists() {
        AppConfig::load(&config_path)?
    } else {
        tracing::warn!(path = %config_path.display(), "no config file, using defaults");
        let mut config = AppConfig::default();
        config.normalize();
        config
    };
    tracing::info!(service = %config.current_service, "starting Taleweaver Engine");

    let engine = Engine::new(config)?;
    let tab = TabId::new("main");
    engine.open_tab(tab.clone(), &session_dir);

    // Print events as they stream.
    let mut events = engine.subscribe(&tab)?;
    tokio::spawn(async move {
        while let Ok(envelope) = events.recv().await {
            match envelope.event {
                EngineEvent::MessageAppended { role, content, .. } => {
                    println!("[{role:?}] {content}");
                }
                EngineEvent::TimerFired { rule } => println!("(timer: {rule})"),
                EngineEvent::InferenceError { kind } => println!("(inference error: {kind})"),
                _ => {}
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Ready. Type your action; /save, /reset, or /quit.");
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        match line.as_str() {
            "" => continue,
            "/quit" => {
                engine.cancel(&tab).await?;
                break;
            }
            "/save" => engine.save(&tab).await?,
            "/reset" => engine.reset(&tab).await?,
            _ => match engine.submit_input(&tab, &line).await {
                Ok(()) => {}
                Err(EngineError::InputDisabled) => println!("(a turn is still in progress)"),
                Err(EngineError::EmptyInput) => {}
                Err(e) => return Err(e),
            },
        }
    }
    Ok(())
}
