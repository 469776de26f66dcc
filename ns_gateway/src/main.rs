mod config;
mod listing;
mod repair;
mod serve;
mod server;

use log::{error, info};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{load_gateway_config, DEFAULT_NS_GATEWAY_CONFIG_PATH};
use crate::server::{routes, GatewayState};

fn usage() -> String {
    format!(
        "usage: ns_gateway [--config <path>]\n\
         defaults:\n\
         --config {}",
        DEFAULT_NS_GATEWAY_CONFIG_PATH
    )
}

fn parse_args() -> Result<PathBuf, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    let mut config_path = PathBuf::from(DEFAULT_NS_GATEWAY_CONFIG_PATH);

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Err(usage()),
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = PathBuf::from(value);
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }
    Ok(config_path)
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let config_path = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    let config = match load_gateway_config(&config_path) {
        Ok(v) => v,
        Err(err) => {
            error!("load config {} failed: {}", config_path.display(), err);
            std::process::exit(1);
        }
    };
    let addr: SocketAddr = match config.listen_addr.parse() {
        Ok(v) => v,
        Err(e) => {
            error!("invalid listen_addr {}: {}", config.listen_addr, e);
            std::process::exit(1);
        }
    };
    let state = match GatewayState::from_config(config) {
        Ok(v) => Arc::new(v),
        Err(err) => {
            error!("init ns_gateway failed: {}", err);
            std::process::exit(1);
        }
    };

    info!(
        "ns_gateway listening on {}, redirect_on_read={}, master={}",
        addr, state.config.redirect_on_read, state.config.master_url
    );
    warp::serve(routes(state)).run(addr).await;
}
