//! Remoting server host. Binds the listening socket, serves connections
//! until a peer requests shutdown (or the last client disconnects when
//! `--kill-on-disconnect` is set), then exits.

mod config;

use clap::Parser;
use config::HostConfig;
use std::path::PathBuf;
use std::process;
use tether::logging::{self, Logger};
use tether::{RemotingContext, RemotingServer, ServerConfig, DEFAULT_PORT};

const EXIT_SOCKET_FAILURE: i32 = 1;
const EXIT_START_FAILURE: i32 = 2;

#[derive(Parser)]
#[clap(name = "tetherd", about = "Remoting server host")]
struct Opts {
    /// Port to listen on.
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Log at debug level.
    #[clap(short, long)]
    verbose: bool,

    /// Append log output to this file instead of stderr.
    #[clap(long)]
    log_file: Option<PathBuf>,

    /// Shut down as soon as a client disconnects.
    #[clap(long)]
    kill_on_disconnect: bool,

    /// Optional TOML configuration file; flags override it.
    #[clap(short, long)]
    config: Option<PathBuf>,
}

fn build_logger(opts: &Opts, config: &HostConfig) -> Result<Logger, String> {
    if let Some(snippet) = &config.log.config {
        return logging::from_toml(snippet).map_err(|err| format!("{:?}", err));
    }

    match &opts.log_file {
        Some(path) => logging::file(path, opts.verbose).map_err(|err| format!("{:?}", err)),
        None => logging::terminal(opts.verbose).map_err(|err| format!("{:?}", err)),
    }
}

fn main() {
    let opts = Opts::parse();

    let config = match &opts.config {
        Some(path) => match HostConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Error loading configuration: {}", err);
                process::exit(EXIT_START_FAILURE);
            }
        },
        None => HostConfig::default(),
    };

    let log = match build_logger(&opts, &config) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("Error building logger: {}", err);
            process::exit(EXIT_START_FAILURE);
        }
    };

    let address = match &opts.config {
        Some(_) => config
            .server
            .address
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", opts.port)),
        None => format!("0.0.0.0:{}", opts.port),
    };

    let server_config = ServerConfig {
        address,
        kill_on_disconnect: opts.kill_on_disconnect || config.server.kill_on_disconnect,
        ..ServerConfig::default()
    };

    let context = RemotingContext::new(&log);

    let server = match RemotingServer::bind(&context, server_config, &log) {
        Ok(server) => server,
        Err(err) => {
            logging::error!(log, "unable to create listening socket"; "error" => ?err);
            process::exit(EXIT_SOCKET_FAILURE);
        }
    };

    if let Err(err) = server.run() {
        logging::error!(log, "server failed"; "error" => ?err);
        process::exit(EXIT_START_FAILURE);
    }
}
