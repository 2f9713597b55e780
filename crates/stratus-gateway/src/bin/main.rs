//! Stratus gateway executable
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 startup dependency
//! unreachable, 3 fatal internal error.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stratus_common::{Config, Error};
use stratus_gateway::{init_gateway, start_server};

#[derive(Parser)]
#[command(name = "stratus-gateway", version, about = "Resilient traffic-management layer")]
struct Args {
    /// Configuration file path (TOML); environment variables override it
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bind address, overriding configuration
    #[arg(short, long, value_name = "ADDRESS")]
    bind: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    let bind_addr = args
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.bind_address, config.server.port));

    info!(
        service = %config.service.name,
        environment = %config.service.environment,
        "starting stratus gateway v{}",
        env!("CARGO_PKG_VERSION")
    );

    let coordinator = match init_gateway(config).await {
        Ok(coordinator) => coordinator,
        Err(Error::StoreUnavailable(message)) => {
            error!("startup dependency unreachable: {message}");
            return ExitCode::from(2);
        }
        Err(e) => {
            error!("failed to initialize gateway: {e}");
            return ExitCode::from(3);
        }
    };

    match start_server(coordinator, &bind_addr).await {
        Ok(()) => {
            info!("gateway stopped cleanly");
            ExitCode::SUCCESS
        }
        Err(Error::Configuration(message)) => {
            error!("configuration error: {message}");
            ExitCode::from(1)
        }
        Err(e) => {
            error!("fatal server error: {e}");
            ExitCode::from(3)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "stratus=debug,info" } else { "stratus=info,warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
