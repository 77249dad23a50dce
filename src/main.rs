use std::sync::Arc;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio_util::codec::Framed;

use acserver::cli::{Cli, Commands, ConfigAction};
use acserver::clock::SystemClock;
use acserver::config::Config;
use acserver::logging;
use acserver::protocol::{ClientFrame, ClientSideCodec, ServerFrame};
use acserver::server_actor::CacheServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging_safe();

    let cli = Cli::parse();
    let mut config = Config::load_or_default(cli.config.clone())?;
    if let Some(cache_dir) = cli.cache_dir.clone() {
        config.storage.folder = cache_dir;
    }

    match cli.command {
        Commands::Serve => {
            let server = CacheServer::new(config, Arc::new(SystemClock));
            server.run().await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigAction::Init { path } => {
                config.save(&path)?;
                println!("wrote default configuration to {:?}", path);
            }
        },
        Commands::Stats { address } => {
            print_stats(&address).await?;
        }
    }

    Ok(())
}

/// Connect briefly to a running instance, ask for its status, print it, and
/// disconnect. Not part of the core protocol endpoint -- a thin one-shot
/// client used only by the `stats` subcommand.
async fn print_stats(address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let socket = tokio::net::TcpStream::connect(address).await?;
    let mut framed = Framed::new(socket, ClientSideCodec::new());
    framed.send(ClientFrame::StatusRequest).await?;

    match framed.next().await {
        Some(Ok(ServerFrame::Status { occupied_size, max_size, item_count })) => {
            println!("occupied: {} / {} bytes, {} items", occupied_size, max_size, item_count);
        }
        Some(Ok(other)) => eprintln!("unexpected reply: {:?}", other),
        Some(Err(e)) => eprintln!("framing error: {}", e),
        None => eprintln!("connection closed before a reply arrived"),
    }
    Ok(())
}
