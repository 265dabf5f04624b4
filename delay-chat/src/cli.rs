use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:6835")]
    pub listen: SocketAddr,

    /// JSON file listing the accounts and channels to serve.
    #[arg(long)]
    pub config: Option<PathBuf>,
}
