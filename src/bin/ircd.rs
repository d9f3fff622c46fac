use clap::Parser;
use flexi_logger::{Duplicate, Logger};
use log::error;

use ircd::config::Config;
use ircd::server::Server;

#[derive(Parser, Debug)]
#[command(version, about = "A single-threaded, event-driven IRC-like chat server")]
struct Args {
    /// Listen port; overrides the config file's [network] port.
    port: Option<u16>,

    /// Path to an optional TOML configuration file.
    #[arg(long, default_value = "ircd.toml")]
    config: String,
}

fn main() -> std::process::ExitCode {
    Logger::try_with_str("info")
        .and_then(|logger| {
            logger
                .log_to_stderr()
                .duplicate_to_stderr(Duplicate::All)
                .start()
        })
        .ok();

    let args = Args::parse();
    let mut config = Config::load(&args.config).unwrap_or_else(|_| Config::default());
    if let Some(port) = args.port {
        config.network.port = port;
    }

    let result = Server::new(config).and_then(|mut server| server.run());
    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}
