use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use snapclass::config::Config;
use snapclass::db::Database;
use snapclass::{api, logging};

#[derive(Default)]
struct Args {
    config_path: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("snapclass {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--host" => {
                if i + 1 < args.len() {
                    parsed.host = Some(args[i + 1].clone());
                    i += 1;
                } else {
                    eprintln!("Error: --host requires an address argument");
                    std::process::exit(1);
                }
            }
            "--port" | "-p" => match args.get(i + 1).map(|p| p.parse::<u16>()) {
                Some(Ok(port)) => {
                    parsed.port = Some(port);
                    i += 1;
                }
                _ => {
                    eprintln!("Error: --port requires a numeric argument");
                    std::process::exit(1);
                }
            },
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"snapclass - image labeling, training and prediction server

USAGE:
    snapclass [OPTIONS]

OPTIONS:
    --config, -c PATH   Path to config file
    --host ADDR         Listen address (overrides config)
    --port, -p PORT     Listen port (overrides config, default 8001)
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    SNAPCLASS_CONFIG    Path to config file (overrides default location)
    SNAPCLASS_LOG       Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/snapclass/config.toml

See also: snapclass-train --help"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let mut config = match args.config_path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // Initialize logging (journald on Linux, rolling file fallback otherwise)
    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Warning: logging setup failed: {}", e);
    }

    let db = Database::open(&config.storage.db_path)?;
    db.initialize()?;
    tracing::info!(path = %config.storage.db_path.display(), "Database opened");

    api::serve(&config, Arc::new(db)).await
}
