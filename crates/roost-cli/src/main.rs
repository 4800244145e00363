mod script;

use std::io::Read;

use anyhow::Context;
use tracing::info;

use roost_gateway::{Dispatcher, MemoryBackend};
use roost_session::SessionConfig;

use script::Replay;

/// Replays a JSON-lines script (path argument, or stdin) against an
/// in-memory server and prints every user's final session view.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roost=debug".into()),
        )
        .init();

    // Config
    let config = SessionConfig::from_env()?;
    let source = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?,
        None => {
            let mut source = String::new();
            std::io::stdin()
                .read_to_string(&mut source)
                .context("reading script from stdin")?;
            source
        }
    };
    let steps = script::parse(&source)?;
    info!("Replaying {} steps (page size {})", steps.len(), config.page_size);

    let backend = MemoryBackend::new(Dispatcher::new());
    let mut replay = Replay::new(backend, config);
    replay.run(steps).await?;

    // let trailing pushes land before the snapshot
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let views = replay.views();
    replay.close().await;

    println!("{}", serde_json::to_string_pretty(&views)?);
    Ok(())
}
