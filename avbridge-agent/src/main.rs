//! avbridge agent entry point.
//!
//! ```text
//! avbridge-agent                    Run with avbridge-agent.toml (or defaults)
//! avbridge-agent --config <path>    Load a custom config TOML
//! avbridge-agent --listen <addr>    Accept one peer on <addr>
//! avbridge-agent --connect <addr>   Dial <addr>
//! avbridge-agent --gen-config       Write default config to stdout
//! avbridge-agent --registration     Print the registration descriptor as JSON
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use avbridge_agent::config::{AgentConfig, Mode};
use avbridge_agent::service::AgentService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "avbridge-agent", about = "Redirects audio and video to a remote peer")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "avbridge-agent.toml")]
    config: PathBuf,

    /// Accept a single peer on this address.
    #[arg(long, conflicts_with = "connect")]
    listen: Option<SocketAddr>,

    /// Connect to the peer at this address.
    #[arg(long)]
    connect: Option<SocketAddr>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Print the registration descriptor as JSON and exit.
    #[arg(long)]
    registration: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&AgentConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config, then apply command-line overrides.
    let (mut config, source) = AgentConfig::load(&cli.config);
    if let Some(addr) = cli.listen {
        config.set_endpoint(Mode::Listen, addr);
    }
    if let Some(addr) = cli.connect {
        config.set_endpoint(Mode::Connect, addr);
    }

    if cli.registration {
        let session = config.to_session_config()?;
        println!("{}", session.registration.to_json()?);
        return Ok(());
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("avbridge-agent v{}", env!("CARGO_PKG_VERSION"));
    source.log(&cli.config);
    info!("endpoint: {}", config.endpoint()?);
    info!(
        "lanes: audio {} ({:?}), video {} ({:?})",
        config.lanes.audio_capacity,
        config.lanes.audio_policy,
        config.lanes.video_capacity,
        config.lanes.video_policy
    );

    let service = AgentService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    service.run().await?;

    Ok(())
}
