//! Minimal remote shell.
//!
//! ```text
//! cargo run --example shell -- device.local shell /bin/ls -la
//! cargo run --example shell -- -p 5910 device.local pull /etc/hosts ./hosts
//! cargo run --example shell -- device.local pull /etc/hosts > hosts
//! cargo run --example shell -- device.local push ./tool /tmp/tool
//! ```
//!
//! Exits with the remote process's exit code.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use rpcwire_client::protocol::DEFAULT_PORT;
use rpcwire_client::{Client, ProtocolVersion, SpawnOutcome, SpawnRequest, StdinSource};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Talk to a remote process-control agent")]
struct Cli {
    /// Agent host name or address.
    hostname: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Wire generation: legacy, tagged or protobuf.
    #[arg(long, default_value = "tagged")]
    protocol: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a command with a relayed terminal (default: /bin/sh).
    Shell {
        #[arg(trailing_var_arg = true)]
        argv: Vec<String>,
    },
    /// Copy a remote file to a local path, or to stdout without one.
    Pull {
        remote: String,
        local: Option<PathBuf>,
    },
    /// Copy a local file to a remote path.
    Push { local: PathBuf, remote: String },
}

fn parse_protocol(name: &str) -> Option<ProtocolVersion> {
    match name {
        "legacy" => Some(ProtocolVersion::Legacy),
        "tagged" => Some(ProtocolVersion::Tagged),
        "protobuf" => Some(ProtocolVersion::Protobuf),
        _ => None,
    }
}

async fn run(cli: Cli) -> rpcwire_client::Result<i32> {
    let protocol = parse_protocol(&cli.protocol).ok_or_else(|| {
        rpcwire_client::RpcError::Argument(format!("unknown protocol {}", cli.protocol))
    })?;
    let client = Client::builder()
        .tcp(cli.hostname.clone(), cli.port)
        .protocol(protocol)
        .raw_terminal(true)
        .connect()
        .await?;
    tracing::info!(platform = ?client.platform(), "Connected");

    let code = match cli.command {
        Command::Shell { argv } => {
            let argv = if argv.is_empty() {
                vec!["/bin/sh".to_string(), "-i".to_string()]
            } else {
                argv
            };
            let request = SpawnRequest::new(argv)
                .stdin(StdinSource::Reader(Box::new(tokio::io::stdin())));
            let mut stdout = tokio::io::stdout();
            match client.spawn(request, &mut stdout).await? {
                SpawnOutcome::Exited { code, .. } => code,
                SpawnOutcome::Disconnected { pid } => {
                    tracing::warn!(pid, "Agent closed the session");
                    1
                }
                SpawnOutcome::Background { .. } => 0,
            }
        }
        Command::Pull { remote, local } => {
            let data = client.pull(&remote).await?;
            match &local {
                Some(path) => tokio::fs::write(path, &data).await?,
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
            }
            tracing::info!(bytes = data.len(), "Pulled {remote}");
            0
        }
        Command::Push { local, remote } => {
            let data = tokio::fs::read(&local).await?;
            client.push(&remote, &data).await?;
            tracing::info!(bytes = data.len(), "Pushed {remote}");
            0
        }
    };

    client.close().await?;
    Ok(code)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
