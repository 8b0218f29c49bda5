use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    config::{DEFAULT_DATA_DIR, DEFAULT_LISTEN, ServerConfig},
    protocol::DEFAULT_MAX_FRAME_LEN,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server.
    Serve(ServeArgs),
    /// Connect to a server as an interactive line client.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = DEFAULT_LISTEN)]
    pub listen: SocketAddr,

    /// Directory holding users.json and messages.json.
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Number of persistence workers.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Pending persistence jobs before new messages are dropped from disk.
    #[arg(long, default_value_t = 1024)]
    pub job_queue_capacity: usize,

    /// Pending outbound frames per client before it is disconnected.
    #[arg(long, default_value_t = 256)]
    pub outbound_capacity: usize,

    /// Seconds a single write may take before the client is disconnected.
    #[arg(long, default_value_t = 10)]
    pub write_timeout_secs: u64,

    /// Seconds without input before a client is disconnected.
    #[arg(long, default_value_t = 300)]
    pub idle_timeout_secs: u64,

    /// Messages returned by `history` when no limit is given.
    #[arg(long, default_value_t = 20)]
    pub history_default: usize,

    /// Longest accepted packet, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,
}

impl From<ServeArgs> for ServerConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            listen: args.listen,
            data_dir: args.data_dir,
            workers: args.workers.max(1),
            job_queue_capacity: args.job_queue_capacity.max(1),
            outbound_capacity: args.outbound_capacity.max(1),
            write_timeout: Duration::from_secs(args.write_timeout_secs.max(1)),
            idle_timeout: Duration::from_secs(args.idle_timeout_secs.max(1)),
            history_default: args.history_default.max(1),
            max_frame_len: args.max_frame_len.max(1),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server to connect to.
    #[arg(long, default_value = DEFAULT_LISTEN)]
    pub server: SocketAddr,
}
