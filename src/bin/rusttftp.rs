use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use clap_derive::{Args, Parser, Subcommand};
use tracing::{info, Level};

use rusttftp::client::TftpClient;
use rusttftp::config::{TftpConfig, DEFAULT_SERVER_PORT};
use rusttftp::file_store::LocalFileStore;
use rusttftp::proxy::fault_rule::{ErrorCorruption, FaultRule};
use rusttftp::proxy::FaultInjectionProxy;
use rusttftp::server::ServerDispatcher;

#[derive(Parser)]
#[command(name = "rusttftp", about = "TFTP-style file transfer with a fault-injecting proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct CommonArgs {
    /// how long to wait for a reply before re-sending
    #[arg(long, global = true, default_value_t = 5000)]
    timeout_ms: u64,

    /// total number of times a packet is sent before giving up
    #[arg(long, global = true, default_value_t = 5)]
    max_retries: u32,

    /// -v for debug output, -vv for trace output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// serves files from a directory
    Server {
        #[arg(long)]
        root: PathBuf,
        #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_SERVER_PORT)))]
        listen: SocketAddr,
    },
    /// relays between clients and a server, injecting faults
    Proxy {
        /// the server's well-known address
        #[arg(long)]
        server: SocketAddr,
        #[arg(long, default_value_t = TftpConfig::default().proxy_addr)]
        listen: SocketAddr,
        /// e.g. `data:2=lose`, `ack:3=delay:2000`, `wrq=corrupt-field:mode`, `ack:1=wrong-tid`,
        ///  `data:4=duplicate:500@repeat`
        #[arg(long)]
        fault: Vec<FaultRule>,
        /// damage ERROR packets: `opcode`, `error-code` or `terminator`, optionally with `@repeat`
        #[arg(long)]
        corrupt_error: Option<ErrorCorruption>,
    },
    /// uploads a local file
    Put {
        local: String,
        remote: String,
        /// the server (or proxy) to talk to
        #[arg(long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_SERVER_PORT)))]
        server: SocketAddr,
    },
    /// downloads a remote file
    Get {
        remote: String,
        local: String,
        /// the server (or proxy) to talk to
        #[arg(long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_SERVER_PORT)))]
        server: SocketAddr,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let mut config = TftpConfig {
        timeout: Duration::from_millis(cli.common.timeout_ms),
        max_retries: cli.common.max_retries,
        ..TftpConfig::default()
    };

    match cli.command {
        Command::Server { root, listen } => {
            if !root.is_dir() {
                return Err(anyhow!("{:?} is not a directory", root));
            }
            config.server_addr = listen;
            let server = ServerDispatcher::start(Arc::new(config), Arc::new(LocalFileStore::confined(root))).await?;

            tokio::signal::ctrl_c().await?;
            info!("received ctrl-c, shutting down");
            server.shutdown().await
        }
        Command::Proxy { server, listen, fault, corrupt_error } => {
            config.server_addr = server;
            config.proxy_addr = listen;
            let proxy = FaultInjectionProxy::start(Arc::new(config), fault, corrupt_error).await?;

            tokio::signal::ctrl_c().await?;
            info!("received ctrl-c, shutting down");
            proxy.shutdown().await
        }
        Command::Put { local, remote, server } => {
            config.validate()?;
            let client = TftpClient::new(Arc::new(config), server, Arc::new(LocalFileStore::unconfined()));
            run_transfer(&client, client.upload(&local, &remote)).await
        }
        Command::Get { remote, local, server } => {
            config.validate()?;
            let client = TftpClient::new(Arc::new(config), server, Arc::new(LocalFileStore::unconfined()));
            run_transfer(&client, client.download(&remote, &local)).await
        }
    }
}

/// runs a client transfer, aborting it on ctrl-c
async fn run_transfer(client: &TftpClient, transfer: impl std::future::Future<Output = anyhow::Result<()>>) -> anyhow::Result<()> {
    let close = client.close_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, aborting transfer");
            close.close();
        }
    });
    transfer.await
}
