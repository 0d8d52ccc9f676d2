// CLI entry point for the hubnet relay.
//
// Two modes:
// - Authority (default): listen on a port, log every frame addressed to the
//   authority and echo it back to its sender, log joins, leaves and peer
//   broadcasts.
// - Peer (`--connect`): join an authority, broadcast each stdin line, print
//   whatever arrives.
//
// See `engine.rs` for the relay lifecycle and `session.rs` for routing.
//
// Usage:
//   relay [OPTIONS]
//     --port <PORT>        Port to listen on / connect to (default: 7878)
//     --host <HOST>        Interface to listen on (default: all)
//     --connect <HOST>     Run as a peer of the authority at HOST
//     --config <FILE>      JSON RelayConfig
//
// Logging goes through `tracing`; set RUST_LOG to adjust (default: info).

use std::io::BufRead;
use std::thread;
use std::time::Duration;

use hubnet_relay::{Authority, Loopback, RelayConfig, RelayEngine, RelayEvent, Sender};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Args {
    port: u16,
    host: Option<String>,
    connect: Option<String>,
    config: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args();
    let mut config = match args.config.as_deref().map(RelayConfig::load).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if args.host.is_some() {
        config.bind_host = args.host;
    }

    let mut engine = RelayEngine::with_config(config);
    match args.connect {
        Some(host) => {
            let loopback = match engine.connect_to_authority(args.port, &host) {
                Ok(loopback) => loopback,
                Err(e) => {
                    error!("failed to connect: {e}");
                    std::process::exit(1);
                }
            };
            run_peer(&engine, loopback);
        }
        None => {
            let authority = match engine.create_authority(args.port) {
                Ok(authority) => authority,
                Err(e) => {
                    error!("failed to start authority: {e}");
                    std::process::exit(1);
                }
            };
            if let Some(addr) = engine.local_addr() {
                println!("Relay listening on {addr}");
            }
            println!("Press Ctrl+C to stop.");
            match engine.loopback() {
                Some(loopback) => run_authority(&authority, &loopback),
                None => error!("authority has no loopback participant"),
            }
        }
    }
    engine.shutdown();
}

/// Echo loop. Runs until the process is killed.
fn run_authority(authority: &Authority, loopback: &Loopback) {
    loop {
        let mut idle = true;
        while let Some(event) = authority.try_pull_event() {
            idle = false;
            match event {
                RelayEvent::Joined(id) => info!(peer = %id, "joined"),
                RelayEvent::Left(id) => info!(peer = %id, "left"),
            }
        }
        while let Some((sender, packet)) = authority.try_pull_message() {
            idle = false;
            info!(from = %sender.id(), bytes = packet.len(), "{}", String::from_utf8_lossy(packet.as_bytes()));
            match sender {
                Sender::Known(participant) => {
                    if let Err(e) = authority.send_to(&participant, packet.as_bytes()) {
                        warn!("echo failed: {e}");
                    }
                }
                Sender::Unknown(id) => warn!(peer = %id, "sender left before reply"),
            }
        }
        while let Some((from, packet)) = loopback.try_pull_with_sender() {
            idle = false;
            debug!(%from, bytes = packet.len(), "broadcast");
        }
        if idle {
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Broadcast stdin lines, print incoming frames. Ends when the authority
/// goes away.
fn run_peer(engine: &RelayEngine, loopback: Loopback) {
    let sender = loopback.clone();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if let Err(e) = sender.send_broadcast(line.as_bytes()) {
                warn!("not sent: {e}");
            }
        }
    });

    while engine.role().is_peer() {
        let mut idle = true;
        while let Some(packet) = loopback.try_pull_from_authority() {
            idle = false;
            println!("[authority] {}", String::from_utf8_lossy(packet.as_bytes()));
        }
        while let Some((from, packet)) = loopback.try_pull_with_sender() {
            idle = false;
            println!("[{from}] {}", String::from_utf8_lossy(packet.as_bytes()));
        }
        if idle {
            thread::sleep(POLL_INTERVAL);
        }
    }
    info!("authority connection closed");
}

/// Parse command-line arguments. Plain `std::env::args()` matching.
fn parse_args() -> Args {
    let mut parsed = Args {
        port: 7878,
        host: None,
        connect: None,
        config: None,
    };
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                parsed.port = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--port requires a valid port number");
                    std::process::exit(1);
                });
            }
            "--host" => {
                i += 1;
                parsed.host = Some(required_value(&args, i, "--host"));
            }
            "--connect" => {
                i += 1;
                parsed.connect = Some(required_value(&args, i, "--connect"));
            }
            "--config" => {
                i += 1;
                parsed.config = Some(required_value(&args, i, "--config"));
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn required_value(args: &[String], i: usize, flag: &str) -> String {
    args.get(i).cloned().unwrap_or_else(|| {
        eprintln!("{flag} requires a value");
        std::process::exit(1);
    })
}

fn print_usage() {
    println!("Usage: relay [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --port <PORT>        Port to listen on / connect to (default: 7878)");
    println!("  --host <HOST>        Interface to listen on (default: all)");
    println!("  --connect <HOST>     Run as a peer of the authority at HOST");
    println!("  --config <FILE>      JSON relay config");
    println!("  --help, -h           Show this help");
}
