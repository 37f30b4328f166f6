//! meshplay - Peer-to-peer real-time multiplayer state synchronization

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use meshplay::network::{
    event_channel, MemoryNetwork, SignalingClient, SignalingMessage, TcpTransport,
    TransportEventReceiver,
};
use meshplay::protocol::{GameMode, PeerId, PlayerState, Vec3};
use meshplay::session::{
    Session, SessionConfig, SessionDriver, SessionEvent, SessionSnapshot, SessionStats,
};

#[derive(Parser)]
#[command(name = "meshplay")]
#[command(about = "Peer-to-peer real-time multiplayer state synchronization")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a session of in-process peers on a simulated network
    Simulate {
        /// Number of peers, host included
        #[arg(short, long, default_value = "3")]
        peers: usize,

        /// Simulated duration in seconds
        #[arg(short, long, default_value = "10")]
        seconds: f64,

        /// Game mode (coop, asymmetric, competitive)
        #[arg(short, long, default_value = "coop")]
        mode: GameMode,

        /// Cut the host off the network after this many seconds
        #[arg(long)]
        drop_host_at: Option<f64>,

        /// First reconnection backoff in milliseconds
        #[arg(long, default_value = "250")]
        reconnect_ms: u64,

        /// Seed for the random walk
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Host a session over TCP
    Host {
        #[command(flatten)]
        net: NetArgs,
    },

    /// Join a session over TCP
    Join {
        /// Peer id of the host
        host_id: String,

        #[command(flatten)]
        net: NetArgs,
    },
}

#[derive(Args)]
struct NetArgs {
    /// Address to listen on for peer links
    #[arg(short, long, default_value = "0.0.0.0:7000")]
    listen: SocketAddr,

    /// Address other peers should dial (default: the bound address)
    #[arg(long)]
    advertise: Option<SocketAddr>,

    /// Signaling server URL
    #[arg(
        short,
        long,
        env = "MESHPLAY_SIGNALING_URL",
        default_value = "ws://127.0.0.1:8080"
    )]
    signaling: String,

    /// Local peer id (default: generated)
    #[arg(long)]
    id: Option<String>,

    /// Game mode (coop, asymmetric, competitive)
    #[arg(short, long)]
    mode: Option<GameMode>,

    /// Session configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "meshplay=debug" } else { "meshplay=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>, mode: Option<GameMode>) -> Result<SessionConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            SessionConfig::from_json(&text)
                .with_context(|| format!("Invalid session config {}", path.display()))?
        }
        None => SessionConfig::default(),
    };
    if let Some(mode) = mode {
        config.mode = mode;
    }
    Ok(config)
}

/// Nudge a player around the arena
fn wander(state: &mut PlayerState, rng: &mut impl Rng, dt: Duration) {
    let dt = dt.as_secs_f32();
    state.velocity.x = (state.velocity.x + rng.gen_range(-2.0f32..2.0) * dt).clamp(-3.0, 3.0);
    state.velocity.z = (state.velocity.z + rng.gen_range(-2.0f32..2.0) * dt).clamp(-3.0, 3.0);
    state.position = state.position + state.velocity * dt;
    state.position.x = state.position.x.clamp(-50.0, 50.0);
    state.position.z = state.position.z.clamp(-50.0, 50.0);
    state.rotation.yaw = state.velocity.z.atan2(state.velocity.x);
}

fn print_stats(stats: &SessionStats) {
    println!(
        "  Snapshots: {} accepted, {} stale, {} peers frozen",
        stats.snapshots_accepted, stats.snapshots_stale, stats.peers_marked_stale
    );
    println!(
        "  Actions:   {} recorded, {} confirmed, {} evicted, {} expired, {} pending",
        stats.actions_recorded,
        stats.actions_confirmed,
        stats.actions_evicted,
        stats.actions_expired,
        stats.pending_actions
    );
    println!(
        "  Remote:    {} applied, {} duplicates, {} malformed, {} unknown",
        stats.actions_applied,
        stats.duplicate_actions,
        stats.malformed_dropped,
        stats.unknown_type_dropped
    );
}

fn print_snapshot(snapshot: &SessionSnapshot) {
    let info = &snapshot.info;
    println!("\n═══════════════════════════════════════════════════════════════");
    println!(
        "  {} [{:?}] host={} peers={}/{}",
        info.local_id,
        info.state,
        info.host_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string()),
        info.peer_count,
        info.max_peers
    );
    let position = snapshot.local.position;
    println!(
        "  Local:     ({:.1}, {:.1}, {:.1})",
        position.x, position.y, position.z
    );
    let mut remote: Vec<_> = snapshot.remote.iter().collect();
    remote.sort_by(|a, b| a.0.cmp(b.0));
    for (peer, state) in remote {
        println!(
            "  {:<10} ({:.1}, {:.1}, {:.1})",
            peer.as_str(),
            state.position.x,
            state.position.y,
            state.position.z
        );
    }
    print_stats(&snapshot.stats);
    println!("═══════════════════════════════════════════════════════════════\n");
}

struct SimPeer {
    id: PeerId,
    session: Session,
    events: TransportEventReceiver,
}

impl SimPeer {
    fn pump(&mut self, now: Instant) {
        while let Ok(event) = self.events.try_recv() {
            self.session.handle_transport_event(event, now);
        }
    }
}

fn run_simulation(
    peers: usize,
    seconds: f64,
    mode: GameMode,
    drop_host_at: Option<f64>,
    reconnect_ms: u64,
    seed: Option<u64>,
) -> Result<()> {
    let config = SessionConfig {
        mode,
        max_peers: Some(peers.max(2)),
        reconnection_timeout_ms: reconnect_ms,
        max_reconnect_attempts: 3,
        ..Default::default()
    };
    let network = MemoryNetwork::new();
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut nodes: Vec<SimPeer> = (1..=peers.max(2))
        .map(|n| {
            let id = PeerId::new(format!("player_{}", n));
            let (tx, rx) = event_channel();
            let transport = network.endpoint(id.clone(), tx);
            let mut session = Session::new(config.clone(), id.clone(), Box::new(transport));
            let me = id.clone();
            session.on_remote_action(move |peer, action_type, data| {
                debug!("[{}] {} performed {} {}", me, peer, action_type, data);
            });
            SimPeer {
                id,
                session,
                events: rx,
            }
        })
        .collect();

    info!(
        "Simulating {} {} peers for {:.1}s",
        nodes.len(),
        mode,
        seconds
    );

    let start = Instant::now();
    let mut now = start;
    let host_id = nodes[0].id.clone();
    nodes[0].session.create(now)?;
    for node in nodes.iter_mut().skip(1) {
        node.session.join(host_id.clone(), now)?;
    }

    let step = Duration::from_millis(16);
    let total_steps = (seconds / step.as_secs_f64()).ceil() as u64;
    let mut host_dropped = false;

    for step_index in 0..total_steps {
        now += step;
        let elapsed = (now - start).as_secs_f64();
        if let Some(at) = drop_host_at {
            if !host_dropped && elapsed >= at {
                warn!("Cutting {} off the network at {:.1}s", host_id, elapsed);
                network.sever(&host_id);
                host_dropped = true;
            }
        }

        for node in nodes.iter_mut() {
            node.pump(now);
            if node.session.state().is_active() {
                wander(node.session.local_state_mut(), &mut rng, step);
                if rng.gen_bool(0.01) {
                    node.session.perform_action(
                        "PING",
                        json!({ "step": step_index }),
                        now,
                        |_| {},
                    )?;
                }
            }
            node.session.tick(now);
            node.session.update_presentation(now);
            for event in node.session.drain_events() {
                info!("[{}] {:?}", node.id, event);
            }
        }
    }

    println!("\n═══════════════════════════════════════════════════════════════");
    println!("                    SIMULATION SUMMARY");
    println!("═══════════════════════════════════════════════════════════════");
    for node in &nodes {
        let info = node.session.info();
        println!(
            "\n{} [{:?}] host={} peers={}",
            node.id,
            info.state,
            info.host_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            info.peer_count
        );
        let local = node.session.local_state().position;
        for (peer, state) in node.session.interpolated_remote_states() {
            let drift = match nodes.iter().find(|n| n.id == peer) {
                Some(owner) => owner.session.local_state().position.distance(state.position),
                None => f32::NAN,
            };
            println!(
                "  sees {:<10} at ({:.1}, {:.1}) drift {:.2}",
                peer.as_str(),
                state.position.x,
                state.position.z,
                drift
            );
        }
        println!("  local at ({:.1}, {:.1})", local.x, local.z);
        print_stats(&node.session.stats());
    }
    println!("\n═══════════════════════════════════════════════════════════════\n");

    Ok(())
}

enum NetRole {
    Host,
    Join(PeerId),
}

async fn run_networked(role: NetRole, net: NetArgs) -> Result<()> {
    let local_id = net.id.map(PeerId::new).unwrap_or_else(PeerId::generate);
    let config = load_config(net.config.as_deref(), net.mode)?;

    let (events_tx, events_rx) = event_channel();
    let transport = TcpTransport::bind(net.listen, local_id.clone(), events_tx).await?;
    let advertise = net.advertise.unwrap_or_else(|| transport.local_addr());

    let mut signaling = SignalingClient::new(&net.signaling)
        .register(&local_id)
        .await
        .with_context(|| format!("Failed to register with {}", net.signaling))?;
    info!("Registered as {} on {}", local_id, net.signaling);

    let mut session = Session::new(config, local_id.clone(), Box::new(transport));
    session.on_remote_action(|peer, action_type, data| {
        info!("{} performed {} {}", peer, action_type, data);
    });
    let (handle, mut events, task) = SessionDriver::spawn(session, events_rx);

    match role {
        NetRole::Host => {
            let meta = handle.create().await?;
            println!("\nHosting {} session {}.", meta.mode, meta.session_id);
            println!("Others join with: meshplay join {}", local_id);
        }
        NetRole::Join(host) => {
            println!("\nJoining {}...", host);
            handle.join(host).await?;
        }
    }
    println!("Press Ctrl+C to leave.\n");

    let mut rng = StdRng::from_entropy();
    let mut status = tokio::time::interval(Duration::from_secs(5));
    let movement_step = Duration::from_millis(100);
    let mut movement = tokio::time::interval(movement_step);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                if let Err(e) = handle.leave().await {
                    debug!("Leave: {}", e);
                }
                break;
            }
            Some(event) = events.recv() => {
                match event {
                    SessionEvent::CandidatesNeeded { peer } => {
                        signaling
                            .send(SignalingMessage::Offer {
                                from: local_id.clone(),
                                to: peer,
                                candidates: vec![advertise],
                            })
                            .await?;
                    }
                    SessionEvent::JoinFailed { error } => {
                        warn!("Could not join: {}", error);
                        break;
                    }
                    other => info!("{:?}", other),
                }
            }
            message = signaling.recv() => {
                match message? {
                    SignalingMessage::Offer { from, candidates, .. } => {
                        handle.add_candidates(from.clone(), candidates)?;
                        signaling
                            .send(SignalingMessage::Answer {
                                from: local_id.clone(),
                                to: from,
                                candidates: vec![advertise],
                            })
                            .await?;
                    }
                    SignalingMessage::Answer { from, candidates, .. } => {
                        handle.add_candidates(from, candidates)?;
                    }
                    SignalingMessage::IceCandidate { from, candidate, .. } => {
                        handle.add_candidates(from, vec![candidate])?;
                    }
                    SignalingMessage::PeerUnavailable { peer_id } => {
                        warn!("{} is not registered with signaling", peer_id);
                    }
                    SignalingMessage::Error { message } => warn!("Signaling: {}", message),
                    other => debug!("Ignoring signaling message {:?}", other),
                }
            }
            _ = status.tick() => {
                print_snapshot(&handle.snapshot().await?);
            }
            _ = movement.tick() => {
                let push = Vec3::new(rng.gen_range(-1.0f32..1.0), 0.0, rng.gen_range(-1.0f32..1.0));
                handle.update_local(move |state| {
                    state.velocity = state.velocity + push * 0.5;
                    state.position = state.position + state.velocity * movement_step.as_secs_f32();
                })?;
            }
        }
    }

    handle.shutdown();
    task.await?;
    if let Err(e) = signaling.close().await {
        debug!("Signaling close: {}", e);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Simulate {
            peers,
            seconds,
            mode,
            drop_host_at,
            reconnect_ms,
            seed,
        } => {
            run_simulation(peers, seconds, mode, drop_host_at, reconnect_ms, seed)?;
        }
        Commands::Host { net } => {
            run_networked(NetRole::Host, net).await?;
        }
        Commands::Join { host_id, net } => {
            run_networked(NetRole::Join(PeerId::new(host_id)), net).await?;
        }
    }

    Ok(())
}
