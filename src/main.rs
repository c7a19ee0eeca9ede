//! Voxcache - TTS prefetch proxy binary

use clap::Parser;
use voxcache::config::Config;

#[derive(Parser)]
#[command(name = "voxcache", version, about = "Latency-hiding TTS prefetch proxy")]
struct Cli {
    /// Listen host (overrides HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Print the effective configuration (secrets redacted) and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // INFO by default; RUST_LOG overrides.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    voxcache::server::start(config).await
}
