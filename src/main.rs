use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use prox::server;

#[derive(Parser, Debug)]
#[command(name = "prox")]
#[command(about = "A dynamically reconfigurable HTTP/HTTPS reverse proxy")]
struct Args {
    /// Path to the static config file
    #[arg(long, default_value = "static.yaml")]
    static_config: String,

    /// Path to the routes config file
    #[arg(long, default_value = "routes.yaml")]
    routes_config: String,

    /// Path to the TLS config file
    #[arg(long, default_value = "tls.yaml")]
    tls_config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    loglevel: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&args.loglevel).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting prox");

    if let Err(e) = server::run(&args.static_config, &args.routes_config, &args.tls_config).await {
        error!("prox exited with error: {e:#}");
        std::process::exit(1);
    }

    info!("prox shutdown complete");
}
