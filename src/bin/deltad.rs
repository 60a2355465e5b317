use clap::{Parser, Subcommand};

use delta_server::config::ServeConfig;
use delta_server::context::AppContext;
use delta_server::reference::resolve_key;
use delta_server::server;

#[derive(Parser)]
#[command(name = "deltad", version, about = "Container image delta build server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the delta API
    Serve(ServeConfig),
    /// Print the delta key and path for a source/destination pair
    Resolve {
        /// Source image reference
        src: String,
        /// Destination image reference
        dest: String,
    },
    /// Print the version
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve(config) => {
            let ctx = AppContext::from_config(&config).await?;
            server::serve(config.listen, ctx).await?;
        }
        Command::Resolve { src, dest } => {
            let delta = resolve_key(&src, &dest)?;
            println!("key: {}", delta.key);
            println!("path: {}", delta.path);
        }
        Command::Version => println!("deltad {}", env!("CARGO_PKG_VERSION")),
    }

    Ok(())
}
