mod node_cache;
mod ns_daemon;

use log::error;
use std::env;
use std::path::PathBuf;

use crate::ns_daemon::{run_ns_daemon, NsDaemonRunOptions, DEFAULT_NS_DAEMON_CONFIG_PATH};

fn usage() -> String {
    format!(
        "usage: ns_daemon <mountpoint> [--config <path>]\n\
         defaults:\n\
         --config {}",
        DEFAULT_NS_DAEMON_CONFIG_PATH
    )
}

fn parse_args() -> Result<NsDaemonRunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let mountpoint = PathBuf::from(args[0].clone());
    let mut config_path = PathBuf::from(DEFAULT_NS_DAEMON_CONFIG_PATH);

    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
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

    Ok(NsDaemonRunOptions {
        mountpoint,
        config_path,
    })
}

fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_ns_daemon(options) {
        error!("run ns_daemon failed: {}", err);
        std::process::exit(1);
    }
}
