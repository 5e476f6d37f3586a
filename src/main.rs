mod bridge;
mod config;
mod line;
mod rtp;
mod sip;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use bridge::Bridge;
use config::Config;
use line::{Line, SerialModemPort};
use sip::IpPhone;

/// The handful of command line flags we accept
struct Args {
    validate: bool,
    help: bool,
}

fn parse_args() -> Args {
    let mut result = Args { validate: false, help: false };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--validate" => result.validate = true,
            "--help" | "-h" => result.help = true,
            other => eprintln!("Ignoring unknown argument: {}", other),
        }
    }
    result
}

fn print_help() {
    println!("pstnlink - PSTN to SIP bridge\n");
    println!("USAGE:");
    println!("    pstnlink [OPTIONS]\n");
    println!("OPTIONS:");
    println!("    --validate    Validate configuration and exit");
    println!("    --help, -h    Show this help message\n");
    println!("ENVIRONMENT:");
    println!("    See .env.example for the recognized configuration variables");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = parse_args();
    if args.help {
        print_help();
        return Ok(());
    }

    // Load .env file if present
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pstnlink=info".parse().unwrap()),
        )
        .init();

    info!("pstnlink v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("  Modem port: {}", config.modem_port);
    info!("  SIP identity: {}@{}", config.sip_user, config.sip_domain);
    info!("  Proxy: {}:{}", config.proxy_address, config.proxy_port);
    info!("  Local bind: {}:{}", config.phone_ip, config.phone_port);

    if args.validate {
        info!("Validating configuration...");
        match config.validate() {
            Ok(()) => {
                info!("Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        }
    }
    config.validate()?;

    let config = Arc::new(config);
    let port = SerialModemPort::open(&config.modem_port)
        .context("Could not open the modem serial port")?;
    let phone = IpPhone::new(config.clone());
    let pstn_line = Line::new(Box::new(port), config.clone());
    let mut bridge = Bridge::new(config, phone, pstn_line);

    // Ctrl-C requests a clean teardown: hang up, deregister, on-hook.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    bridge.run(cancel).await
}
