use clap::Parser;
use eyre::Result;

use rbf_monitor::MonitorArgs;

#[tokio::main]
async fn main() -> Result<()> {
    // Set up tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = MonitorArgs::parse();
    args.run().await
}
