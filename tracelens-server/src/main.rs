use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use tracelens_core::{ChatClient, ChatConfig, TracelensConfig};
use tracelens_server::http;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "tracelens.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Init logging
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    // Load config
    let config = match TracelensConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    if args.health {
        let probe = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()?;
        match probe.get(&config.upstream.base_url).send().await {
            Ok(r) => println!(
                "✅ Upstream reachable: {} ({})",
                config.upstream.base_url,
                r.status()
            ),
            Err(e) => {
                println!("❌ Upstream unreachable: {}", e);
                std::process::exit(1);
            }
        }

        match ChatClient::new(ChatConfig::from(&config.llm)) {
            Ok(c) => println!("✅ LLM configured: model {}", c.model()),
            Err(e) => {
                println!("❌ LLM configuration incomplete: {}", e);
                std::process::exit(1);
            }
        }

        println!("✅ Tracelens health check passed");
        return Ok(());
    }

    // Shutdown signal
    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    http::start_http_server(config, tx.subscribe()).await?;

    Ok(())
}
