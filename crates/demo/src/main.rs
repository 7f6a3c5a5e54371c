use strand_demo::DemoConfig;
use strand_observability::ObservabilityConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DemoConfig::from_env();
    strand_observability::init_with(&ObservabilityConfig::default().with_json(config.log_json));

    tracing::info!(?config, "starting demo");
    let summary = strand_demo::run(config).await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
