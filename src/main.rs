use std::sync::Arc;
use tracing::info;

use murmur::config::Config;
use murmur::interface::terminal::Terminal;
use murmur::manager::ChatManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they don't interleave with the chat on stdout
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env()?;
    info!("murmur starting...");

    let manager = Arc::new(ChatManager::connect(&config).await?);
    manager.start().await;

    let terminal = Terminal::new(manager.clone());
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = terminal.run() => {
            res?;
        }
    }

    Ok(())
}
