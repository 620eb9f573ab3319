use farmstead_core::Engine;
use std::path::PathBuf;

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config_dir = env_path("FARMSTEAD_CONFIG_DIR", "config");
    let data_dir = env_path("FARMSTEAD_DATA_DIR", "data");

    tracing::info!(config_dir = %config_dir.display(), data_dir = %data_dir.display(), "starting farmstead_core");

    let engine = Engine::build(&config_dir, &data_dir)?;
    let mut config_changes = engine.config.subscribe();
    let _watcher = engine.config.watch()?;

    engine.start();
    tracing::info!("background workers started");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            changed = config_changes.recv() => {
                if changed.is_ok() {
                    tracing::info!("config reloaded");
                }
            }
        }
    }

    engine.stop();
    Ok(())
}
