use access_sync_service::{config::AccessSyncConfig, Application};
use service_core::observability::{init_metrics, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AccessSyncConfig::load()?;

    init_tracing(
        "access-sync-service",
        &config.common.log_level,
        config.otlp_endpoint.as_deref(),
    );
    init_metrics();

    tracing::info!(
        store = ?config.store.backend,
        github = config.publish.github.is_some(),
        debounce_ms = config.publish.debounce.as_millis() as u64,
        "Starting access-sync-service"
    );

    let application = Application::build(config).await?;
    application.run_until_stopped().await?;

    Ok(())
}
