// Start the controller
use kube::Client;
use tracing::info;
use tracing_subscriber::fmt::format::FmtSpan;

use opnsense_controller::OpnsenseClient;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "tracing=info,opnsense_controller=debug".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let opnsense = OpnsenseClient::from_env()?;
    let client = Client::try_default().await?;
    let config = opnsense_controller::config::load(client.clone()).await?;

    tokio::select! {
        result = opnsense_controller::run(client, opnsense, config) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
