//! Causeway command-line interface.

use anyhow::Result;
use causeway::client::{self, ClientConfig};
use causeway::server::{self, ServerConfig, ServerMode};
use causeway::shutdown;
use causeway_core::TokenSource;
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Causeway - multiplexed TCP tunnelling over a single HTTP upgrade connection.
#[derive(Parser, Debug)]
#[command(name = "causeway")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true, env = "CAUSEWAY_DEBUG")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a tunnel server.
    Server {
        #[command(subcommand)]
        mode: ServerCommand,
    },
    /// Start a tunnel client.
    Client(ClientArgs),
}

#[derive(Subcommand, Debug)]
enum ServerCommand {
    /// Terminate tunnelled streams as an HTTP CONNECT proxy.
    Proxy {
        /// Bind to this address.
        #[arg(short, long, env = "CAUSEWAY_ADDR", default_value = "0.0.0.0:8080")]
        addr: String,
    },
    /// Relay tunnelled streams byte-for-byte to a fixed upstream.
    Forward {
        /// Bind to this address.
        #[arg(short, long, env = "CAUSEWAY_ADDR", default_value = "0.0.0.0:8080")]
        addr: String,

        /// Upstream host:port every stream is relayed to.
        #[arg(short, long, env = "CAUSEWAY_UPSTREAM", default_value = "")]
        upstream: String,
    },
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Bind the local listener to this address.
    #[arg(short, long, env = "CAUSEWAY_ADDR", default_value = "127.0.0.1:8080")]
    addr: String,

    /// Remote tunnel server URL.
    #[arg(short, long, env = "CAUSEWAY_REMOTE", default_value = "http://127.0.0.1:8080")]
    remote: String,

    /// Identity token presented verbatim on the upgrade request.
    #[arg(short, long, env = "CAUSEWAY_ID_TOKEN")]
    id_token: Option<String>,

    /// Service account to mint an identity token for.
    #[arg(short, long, env = "CAUSEWAY_SERVICE_ACCOUNT")]
    service_account: Option<String>,

    /// Explicit token audience; the remote URL is used when absent.
    #[arg(short, long, env = "CAUSEWAY_CLIENT_ID")]
    client_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _ = FmtSubscriber::builder()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .try_init();

    info!("Starting causeway v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = shutdown::shutdown_token();

    match cli.command {
        Command::Server { mode } => {
            let config = match mode {
                ServerCommand::Proxy { addr } => ServerConfig {
                    addr,
                    mode: ServerMode::Proxy,
                },
                ServerCommand::Forward { addr, upstream } => ServerConfig {
                    addr,
                    mode: ServerMode::Forward { upstream },
                },
            };
            server::run(config, shutdown).await?;
        }
        Command::Client(args) => {
            let config = ClientConfig {
                addr: args.addr,
                remote: args.remote,
                tokens: TokenSource {
                    id_token: args.id_token,
                    service_account: args.service_account,
                    client_id: args.client_id,
                },
            };
            client::run(config, shutdown).await?;
        }
    }

    Ok(())
}
