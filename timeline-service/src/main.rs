use service_core::observability::init_tracing;
use timeline_service::config::TimelineConfig;
use timeline_service::services::init_metrics;
use timeline_service::startup::Application;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = TimelineConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    );

    // Recorder must be installed before anything records
    init_metrics()?;

    let application = Application::build(config).await.map_err(|e| {
        tracing::error!("Failed to start timeline-service: {}", e);
        e
    })?;
    application.run_until_stopped().await?;

    Ok(())
}
