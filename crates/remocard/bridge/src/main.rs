//! `remocard` command line entry point

use clap::Parser;
use remocard_apdu_core::encode_hex;
use remocard_apdu_transport_pcsc::PcscService;
use remocard_bridge::config::{SettingsStore, default_config_path};
use remocard_bridge::server;
use tracing::info;

use crate::cli::{Cli, Command};

mod cli;
mod logging;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    let path = match cli.config.clone() {
        Some(path) => path,
        None => default_config_path()?,
    };

    match cli.into_command() {
        Command::Serve(args) => {
            let settings = SettingsStore::load(&path, args.overrides())?;
            info!(path = %path.display(), settings = ?settings.snapshot(), "Settings loaded");
            server::run(settings).await
        }
        Command::Readers => {
            let service = PcscService::establish()?;
            let readers = service.list_readers()?;
            if readers.is_empty() {
                println!("No readers found");
            }
            for reader in readers {
                match reader.atr() {
                    Some(atr) if reader.has_card() => {
                        println!("{}  card present  ATR {}", reader.name(), encode_hex(atr));
                    }
                    _ => println!("{}  no card", reader.name()),
                }
            }
            Ok(())
        }
    }
}
