use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay and serve the static asset directory.
    Serve(ServeArgs),
    /// Connect to a relay, sending stdin lines and printing what others send.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, env = "RELAY_LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: SocketAddr,

    /// Overrides the port of `--listen`.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Directory served on every path other than `/ws` and `/status`.
    #[arg(long, env = "RELAY_STATIC_DIR", default_value = "public")]
    pub static_dir: PathBuf,
}

impl ServeArgs {
    pub fn listen_addr(&self) -> SocketAddr {
        let mut addr = self.listen;
        if let Some(port) = self.port {
            addr.set_port(port);
        }
        addr
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// WebSocket URL of the relay endpoint.
    #[arg(long, default_value = "ws://127.0.0.1:3000/ws")]
    pub server: String,
}
