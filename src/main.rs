use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod client;
mod config;
mod daemon;
mod protocol;
mod rendezvous;
mod service;
mod session;
mod signaling;
mod splice;
mod transport;

#[derive(Parser)]
#[command(name = "farlink")]
#[command(about = "P2P remote access over rendezvous-signaled peer sessions")]
struct Cli {
    /// Home directory for the config file (default: ~/.farlink)
    #[arg(long)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the node daemon
    Daemon,

    /// Run the rendezvous server
    Rendezvous {
        #[arg(long, default_value_t = 11095)]
        port: u16,
    },

    /// Open an interactive shell on a peer
    Connect {
        target: String,
        #[arg(long, default_value = "")]
        username: String,
    },

    /// Copy a file through a peer session
    Copy {
        target: String,
        path: String,
        /// Send instead of fetch
        #[arg(long)]
        upload: bool,
    },

    /// Bridge a filesystem mount session to a peer
    Mount {
        target: String,
        mount_point: String,
    },

    /// Start a local proxy front forwarding through a peer
    Proxy { target: String, port: u16 },

    /// View a peer's framebuffer
    Fb { target: String },

    /// Expose the local framebuffer to a peer
    FbServe { target: String },

    /// Open a peer's messaging console
    Message {
        target: String,
        #[arg(long, default_value = "")]
        nickname: String,
    },

    /// Fetch from a peer's transfer endpoint
    Transfer { target: String },

    /// Offer the local transfer endpoint to a peer
    TransferServe { target: String },

    /// Show daemon status
    Status,

    /// Tear down a session by pair id
    Down { pair_id: String },

    /// Attach to an existing session by pair id
    Attach { pair_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("farlink=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let home = cli.home.unwrap_or_else(config::default_home);

    match cli.command {
        Command::Daemon => daemon::run(&home).await?,
        Command::Rendezvous { port } => rendezvous::run(port).await?,
        command => client::send_command(&home, command).await?,
    }

    Ok(())
}
