//! dfstore storage node executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use dfstore::master::validate_node_id;
use dfstore::node::{NodeConfig, StorageNode};
use dfstore::{logger_init, pf_error, set_me, DfsError};
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct CliArgs {
    /// Unique ID of this node, e.g., "node1".
    #[arg(short, long)]
    id: String,

    /// Local IP to use for binding the chunk server socket.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Port the chunk server listens on.
    /// This port must be available at process launch.
    #[arg(short, long)]
    chunk_port: u16,

    /// Master's node-facing address.
    #[arg(short, long)]
    master: SocketAddr,

    /// Node configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(config)` on success
    /// or `Err(DfsError)` on any error.
    fn sanitize(&self) -> Result<NodeConfig, DfsError> {
        if self.chunk_port <= 1024 {
            Err(DfsError::msg(format!(
                "invalid chunk_port {}",
                self.chunk_port
            )))
        } else if self.threads < 2 {
            Err(DfsError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            validate_node_id(&self.id)?;
            let config_str = self.config.replace('+', "\n");
            NodeConfig::from_config_str(if config_str.is_empty() {
                None
            } else {
                Some(&config_str)
            })
        }
    }
}

/// Actual main function of dfstore storage node.
fn node_main(args: CliArgs) -> Result<(), DfsError> {
    let config = args.sanitize()?;
    let chunk_addr = SocketAddr::from((args.bind_ip, args.chunk_port));

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name(format!("tokio-worker-{}", args.id))
            .build()?;

        // enter tokio runtime, setup the node, and start the main event
        // loop logic
        runtime.block_on(async move {
            let mut node = StorageNode::new_and_setup(
                &args.id,
                chunk_addr,
                args.master,
                config,
            )
            .await?;

            node.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), DfsError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of dfstore storage node.
fn main() -> ExitCode {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    set_me(&args.id);
    logger_init();

    if let Err(ref e) = node_main(args) {
        pf_error!("node_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
