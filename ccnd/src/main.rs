use std::process;

use clap::{Arg, Command};
use log::error;

mod config;
mod content_store;
mod daemon;
mod face;
mod forwarder;
mod interest_table;
mod io;
mod limits;
mod sched;
mod scratch;
mod stats;

use config::Config;
use daemon::Daemon;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let matches = Command::new("ccnd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("ccnd - content-centric networking forwarding daemon")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/ccnd/ccnd.conf"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Datagram port and socket-name selector"),
        )
        .arg(
            Arg::new("sock")
                .long("sock")
                .value_name("PATH")
                .help("Listener socket path"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").unwrap();
    let mut config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ccnd: cannot load {config_path}: {e}");
            process::exit(1);
        }
    };
    if let Some(port) = matches.get_one::<String>("port") {
        config.network.port = port.clone();
    }
    if let Some(sock) = matches.get_one::<String>("sock") {
        config.network.socket_path = Some(sock.clone());
    }

    // CCND_DEBUG forces verbose tracing regardless of the configured
    // level.
    let debug_on = std::env::var("CCND_DEBUG")
        .map(|v| !v.is_empty())
        .unwrap_or(false);
    let filter = if debug_on {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match Daemon::new(config).run().await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("startup failed: {e}");
            process::exit(1);
        }
    }
}
