//! dfstore master executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use dfstore::master::{Master, MasterConfig};
use dfstore::{logger_init, pf_error, set_me, DfsError};
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening sockets.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Node-facing registration/heartbeat port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52700)]
    node_port: u16,

    /// Client-facing API port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52701)]
    client_port: u16,

    /// Master configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(config)` on success
    /// or `Err(DfsError)` on any error.
    fn sanitize(&self) -> Result<MasterConfig, DfsError> {
        if self.node_port <= 1024 {
            Err(DfsError::msg(format!("invalid node_port {}", self.node_port)))
        } else if self.client_port <= 1024 {
            Err(DfsError::msg(format!(
                "invalid client_port {}",
                self.client_port
            )))
        } else if self.node_port == self.client_port {
            Err(DfsError::msg(format!(
                "node_port == client_port {}",
                self.node_port
            )))
        } else if self.threads < 2 {
            Err(DfsError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            let config_str = self.config.replace('+', "\n");
            MasterConfig::from_config_str(if config_str.is_empty() {
                None
            } else {
                Some(&config_str)
            })
        }
    }
}

/// Actual main function of dfstore master.
fn master_main() -> Result<(), DfsError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let config = args.sanitize()?;

    let node_addr = SocketAddr::from((args.bind_ip, args.node_port));
    let client_addr = SocketAddr::from((args.bind_ip, args.client_port));

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
            .thread_name("tokio-worker-master")
            .build()?;

        // enter tokio runtime, setup the master, and start the main event
        // loop logic
        runtime.block_on(async move {
            let mut master =
                Master::new_and_setup(config, node_addr, client_addr).await?;

            master.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), DfsError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of dfstore master.
fn main() -> ExitCode {
    set_me("m");
    logger_init();

    if let Err(ref e) = master_main() {
        pf_error!("master_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
