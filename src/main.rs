#![cfg_attr(not(test), deny(clippy::panic))]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use slipstream_server::config;
use slipstream_server::events::TracingEventSink;
use slipstream_server::logging;
use slipstream_server::server::RaceServer;

/// Slipstream -- network core for a real-time multiplayer racing game server
#[derive(Parser, Debug)]
#[command(name = "slipstream-server")]
#[command(about = "Racing game relay: TLS control channel + encrypted UDP replication")]
#[command(version)]
struct Cli {
    /// Validate configuration and exit without starting the server.
    #[arg(long, short = 'c', conflicts_with = "print_config")]
    validate_config: bool,

    /// Print the loaded configuration to stdout (as JSON) and exit.
    #[arg(long, conflicts_with = "validate_config")]
    print_config: bool,

    /// Path to the configuration file.
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_from(&cli.config);

    if cli.print_config {
        println!("{}", cfg.to_pretty_json()?);
        return Ok(());
    }

    let validation_result = config::validate(&cfg);

    if cli.validate_config {
        match validation_result {
            Ok(()) => {
                println!("Configuration validation passed");
                println!();
                println!("Configuration summary:");
                println!("  Port (TCP+UDP): {}", cfg.port);
                println!("  Hostname: {}", cfg.hostname);
                println!("  Max players per room: {}", cfg.server.max_players_per_room);
                println!("  Idle timeout: {}s", cfg.server.idle_timeout_secs);
                println!(
                    "  Datagram rate limit: {}/s (+{} burst)",
                    cfg.security.datagrams_per_second, cfg.security.burst_allowance
                );
                println!(
                    "  Violation kick threshold: {}",
                    cfg.security.violation_threshold
                );
                return Ok(());
            }
            Err(err) => {
                eprintln!("Configuration validation failed:\n{err}");
                std::process::exit(1);
            }
        }
    }

    validation_result?;

    logging::init_with_config(&cfg.logging);

    let server = RaceServer::new(cfg.server_config(), Arc::new(TracingEventSink));

    let mut runner = tokio::spawn(server.clone().run());
    tokio::select! {
        result = &mut runner => {
            return result?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutdown signal received");
            server.stop();
        }
    }
    runner.await??;

    Ok(())
}
