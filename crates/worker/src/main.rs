use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    riskbatch_observability::init();

    let config = riskbatch_infra::EngineConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        worker = %config.orchestrator.worker_id,
        persistent = config.database_url.is_some(),
        "starting riskbatch worker"
    );

    let orchestrator = riskbatch_worker::build(&config).await?;
    let handle = orchestrator.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received; draining");
    handle.shutdown().await;
    Ok(())
}
