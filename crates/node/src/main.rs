mod app;
mod config;
mod events;

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use netplay::{NetConfig, NetworkSimulation, Session};

use app::NodeApp;
use config::NodeConfig;
use events::NodeEvent;

#[derive(Parser)]
#[command(name = "netplay-node")]
#[command(about = "Hosts or joins a netplay session and exchanges chat and beacons")]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    #[arg(short, long, default_value = "player")]
    name: String,

    #[arg(long, default_value_t = 30, help = "Seconds to run before leaving (0 runs forever)")]
    seconds: u64,

    #[arg(long, default_value_t = 60.0, help = "Packets per second per connection")]
    send_rate: f32,

    #[arg(long, default_value_t = 2000, help = "Milliseconds between chat lines")]
    chat_interval: u64,

    #[arg(long, default_value_t = 0.0, help = "Inbound packet loss chance (0-1)")]
    loss: f32,

    #[arg(long, default_value_t = 0, help = "Minimum inbound latency in ms")]
    min_latency: u64,

    #[arg(long, default_value_t = 0, help = "Maximum inbound latency in ms")]
    max_latency: u64,
}

#[derive(Subcommand)]
enum Mode {
    /// Host a session
    Host {
        #[arg(short, long, default_value_t = netplay::DEFAULT_PORT)]
        port: u16,
    },
    /// Join a session at HOST:PORT
    Join { address: String },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = NodeConfig {
        net: NetConfig {
            send_rate: args.send_rate,
            simulation: NetworkSimulation::new(
                args.loss,
                Duration::from_millis(args.min_latency),
                Duration::from_millis(args.max_latency),
            ),
            ..Default::default()
        },
        display_name: args.name,
        run_time: Duration::from_secs(args.seconds),
        chat_interval: Duration::from_millis(args.chat_interval),
        ..Default::default()
    };

    let mut session = Session::new(config.net.clone());
    session.set_display_name(config.display_name.clone());
    let run_time = config.run_time;
    let mut app = NodeApp::new(config);
    app.install(&mut session)?;

    match &args.mode {
        Mode::Host { port } => session.host(*port)?,
        Mode::Join { address } => session.join(address)?,
    }
    if let Some(addr) = session.local_addr() {
        log::info!("Listening on {}", addr);
    }

    run(&mut session, &mut app, run_time)?;

    app.shutdown(&mut session);
    session.step();
    session.leave();
    log::info!("Node shutting down");
    Ok(())
}

fn run(session: &mut Session, app: &mut NodeApp, run_time: Duration) -> Result<()> {
    let started = Instant::now();
    let mut was_ready = false;
    let mut last_report = started;

    loop {
        session.step();
        let now = Instant::now();
        app.tick(session, now);

        if session.is_ready() && !was_ready {
            log::info!(
                "Session ready as connection {:?} ({})",
                session.my_index(),
                if session.is_host() { "host" } else { "client" }
            );
        }
        was_ready = session.is_ready();

        for event in app.drain_events() {
            match event {
                NodeEvent::PeerJoined { index, name } => {
                    log::info!("{} joined as connection {}", name, index);
                }
                NodeEvent::PeerLeft { index } => {
                    log::info!("Connection {} left", index);
                }
                NodeEvent::Chat { from, line } => {
                    log::info!("[{:?}] {} #{}: {}", from, line.sender, line.sequence, line.text);
                }
                NodeEvent::BadChat { from, reason } => {
                    log::warn!("Unreadable chat from {:?}: {}", from, reason);
                }
            }
        }

        if let Some(error) = session.take_last_error() {
            return Err(error.into());
        }

        if now.saturating_duration_since(last_report) >= Duration::from_secs(5) {
            last_report = now;
            for connection in session.connections().filter(|c| !c.is_local()) {
                let stats = connection.stats();
                log::info!(
                    "Connection {}: rtt {:.1}ms, loss {:.1}%, sent {}, received {}",
                    connection.index(),
                    stats.rtt_ms(),
                    stats.packet_loss_percent,
                    stats.packets_sent,
                    stats.packets_received
                );
            }
            for (id, position) in app.remote_beacons(session) {
                log::debug!("Beacon {} at {:?}", id, position);
            }
        }

        if !run_time.is_zero() && now.saturating_duration_since(started) >= run_time {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}
