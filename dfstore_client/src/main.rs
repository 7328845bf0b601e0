//! dfstore command line client executable.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use dfstore::client::MasterStub;
use dfstore::{logger_init, pf_error, pf_info, set_me, DfsError};
use tokio::fs;
use tokio::runtime::Builder;
use tokio::time::Duration;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct CliArgs {
    /// Master's client-facing address.
    #[arg(short, long)]
    master: SocketAddr,

    /// Connect and per-step I/O timeout in millisecs.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Wait for the master's reply in millisecs. The master replies only
    /// after all chunks are transferred, so keep this well above the master's
    /// per-chunk timeouts times the number of chunks.
    #[arg(long, default_value_t = 300_000)]
    reply_timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

/// Client operations.
#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// List registered storage nodes in ring order.
    List,

    /// Upload a local file.
    Upload {
        /// Local file to read.
        local: PathBuf,

        /// Name to store it under; defaults to the local file name.
        #[arg(long)]
        name: Option<String>,
    },

    /// Download a stored file.
    Download {
        /// Stored file name.
        name: String,

        /// Local path to write; defaults to the stored name.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

impl CliArgs {
    /// Sanitize command line arguments.
    fn sanitize(&self) -> Result<(), DfsError> {
        if self.timeout_ms == 0 {
            return Err(DfsError::msg(format!(
                "invalid timeout duration {} ms",
                self.timeout_ms
            )));
        }
        if self.reply_timeout_ms < self.timeout_ms {
            return Err(DfsError::msg(format!(
                "invalid reply timeout {} ms, less than timeout {} ms",
                self.reply_timeout_ms, self.timeout_ms
            )));
        }
        if let Command::Upload { local, name: None } = &self.command {
            upload_name(local)?;
        }
        Ok(())
    }
}

/// Default stored name of an uploaded local file.
fn upload_name(local: &Path) -> Result<String, DfsError> {
    local
        .file_name()
        .and_then(|n| n.to_str())
        .map(String::from)
        .ok_or_else(|| {
            DfsError::msg(format!("cannot derive a name from {:?}", local))
        })
}

/// Actual main function of dfstore client.
fn client_main() -> Result<(), DfsError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    let timeout = Duration::from_millis(args.timeout_ms);
    let stub = MasterStub::new(args.master, timeout, timeout)
        .with_reply_timeout(Duration::from_millis(args.reply_timeout_ms));

    let runtime = Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(async move {
        match args.command {
            Command::List => {
                let nodes = stub.list_nodes().await?;
                println!("{}", nodes.join("\n"));
            }

            Command::Upload { local, name } => {
                let name = match name {
                    Some(name) => name,
                    None => upload_name(&local)?,
                };
                let data = fs::read(&local).await?;
                stub.upload(&name, &data).await?;
                pf_info!("uploaded {:?} as '{}' ({} bytes)", local, name, data.len());
            }

            Command::Download { name, out } => {
                let data = stub.download(&name).await?;
                let out = out.unwrap_or_else(|| PathBuf::from(&name));
                fs::write(&out, &data).await?;
                pf_info!("downloaded '{}' to {:?} ({} bytes)", name, out, data.len());
            }
        }
        Ok::<(), DfsError>(()) // give type hint for this async closure
    })
}

/// Main function of dfstore client.
fn main() -> ExitCode {
    set_me("c");
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
