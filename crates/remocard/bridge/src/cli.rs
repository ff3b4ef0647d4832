use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use remocard_bridge::config::Overrides;

#[derive(Parser, Debug)]
#[command(version, about = "Expose local secure elements to remote clients over HTTP")]
pub(crate) struct Cli {
    /// Settings file [default: ~/.remocard/remocard.toml]
    #[arg(short, long, global = true, value_name = "FILE")]
    pub(crate) config: Option<PathBuf>,

    /// Debug output
    #[arg(short, long, global = true)]
    pub(crate) verbose: bool,

    #[command(subcommand)]
    pub(crate) command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Run the bridge (default)
    Serve(ServeArgs),

    /// List readers and exit
    Readers,
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Address to listen on
    #[arg(long, value_name = "ADDR")]
    pub(crate) host: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long)]
    pub(crate) port: Option<u16>,
}

impl ServeArgs {
    pub(crate) const fn overrides(&self) -> Overrides {
        Overrides {
            host: self.host,
            port: self.port,
        }
    }
}

impl Cli {
    pub(crate) fn into_command(self) -> Command {
        self.command
            .unwrap_or_else(|| Command::Serve(ServeArgs::default()))
    }
}
