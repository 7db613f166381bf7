use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use reply_engine::channels::CliChannel;
use reply_engine::config::EngineConfig;
use reply_engine::llm::ProviderSet;
use reply_engine::pipeline::{EngineDeps, ReplyEngine, spawn_tick_task};
use reply_engine::store::{InMemoryMessageStore, LibSqlMessageStore, MessageStore};

/// Logs go to stderr (stdout carries replies), plus a daily file when
/// `REPLY_ENGINE_LOG_DIR` is set.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("REPLY_ENGINE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "reply-engine.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = EngineConfig::from_env()?;
    let providers = ProviderSet::from_env()?;

    eprintln!("🤖 Reply Engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Bot: {}", config.bot.name);
    eprintln!("   Standard model: {}", providers.standard.model_name());
    if let Some(enhanced) = &providers.enhanced {
        eprintln!("   Enhanced model: {}", enhanced.model_name());
    }
    for slot in &config.slots {
        eprintln!("   Slot {}: {}", slot.name, slot.channels.join(", "));
    }

    // ── Message store ────────────────────────────────────────────────────
    let store: Arc<dyn MessageStore> = match std::env::var("REPLY_ENGINE_DB_PATH") {
        Ok(db_path) => {
            let store = LibSqlMessageStore::new_local(Path::new(&db_path)).await?;
            eprintln!("   Database: {}", db_path);
            Arc::new(store)
        }
        Err(_) => {
            eprintln!("   Database: in-memory");
            Arc::new(InMemoryMessageStore::new())
        }
    };

    eprintln!("   Type `<channel> <message>` and press Enter. Ctrl-D to exit.\n");

    let cli = Arc::new(CliChannel::new(config.bot.name.clone(), "cli"));
    let tick_interval = config.tick_interval;
    let engine = Arc::new(ReplyEngine::new(
        config,
        EngineDeps {
            store,
            providers,
            sink: cli.clone(),
        },
    )?);

    let ticker = spawn_tick_task(Arc::clone(&engine), tick_interval);

    // Ingest in arrival order; turns run concurrently.
    let mut messages = Arc::clone(&cli).start();
    while let Some(message) = messages.next().await {
        match engine.ingest(&message).await {
            Ok(fired) if !fired.is_empty() => {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    for outcome in engine.run_fired(fired).await {
                        tracing::debug!(slot = %outcome.slot(), outcome = ?outcome, "Turn finished");
                    }
                });
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Failed to ingest message"),
        }
    }

    ticker.abort();
    Ok(())
}
