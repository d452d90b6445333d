// Headless daemon wrapping the orchestrator: config file in, tunnels
// out, ctrl-c to stop.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use guava::alloc::IpAllocator;
use guava::backends::{P2pTunnelService, StunDiscovery, WsSignalling};
use guava::orchestrator::Orchestrator;
use guava::Config;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage(&args[0]);
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);
    let mut cfg = Config::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    // Environment overrides, handy when the relay differs per machine.
    if let Ok(url) = env::var("SIGNALLING_URL") {
        cfg.signalling.url = url;
    }
    if let Ok(name) = env::var("LOCAL_NAME") {
        cfg.signalling.name = name;
    }

    let mut orchestrator = Orchestrator::new(
        WsSignalling::new(),
        StunDiscovery::new(),
        P2pTunnelService::new(),
        Arc::new(IpAllocator::new()),
    );
    orchestrator.configure(&cfg);

    let handle = orchestrator.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            handle.stop().await;
        }
    });

    orchestrator.run().await.context("signalling channel failed")?;
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_usage(program: &str) {
    eprintln!("guava - peer-to-peer VPN between trusted friends");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  {} <config.json>", program);
    eprintln!();
    eprintln!("ENVIRONMENT OVERRIDES:");
    eprintln!("  SIGNALLING_URL    wss://relay:8443");
    eprintln!("  LOCAL_NAME        identity announced to the relay");
    eprintln!();
    eprintln!("RUST_LOG controls verbosity (default: info).");
    eprintln!();
    eprintln!("The config file carries the friend table and the backend");
    eprintln!("sections; see README.md for a worked example.");
}
