use anyhow::{Context, Result};
use std::{env, net::IpAddr, net::SocketAddr, sync::Arc};
use steamroll_p2p::p2p::{
    protocol, ConnectionMethod, DiscoveryMessage, LocalIdentity, P2pConfig, PeerConnector,
    StunClient,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        std::process::exit(1);
    }

    match args[1].as_str() {
        "stun" => run_stun()?,
        "connect" => {
            if args.len() < 4 {
                eprintln!("Usage: {} connect <peer_id> <lan_ip:port> [public_ip:port]", args[0]);
                eprintln!();
                eprintln!("Example:");
                eprintln!("  {} connect bob 192.168.1.20:47999", args[0]);
                eprintln!("  {} connect bob 192.168.1.20:47999 203.0.113.9:41000", args[0]);
                std::process::exit(1);
            }
            let peer_id = &args[2];
            let lan = args[3]
                .parse()
                .context("Invalid LAN endpoint. Expected format: ip:port")?;
            let public = match args.get(4) {
                Some(raw) => Some(
                    raw.parse()
                        .context("Invalid public endpoint. Expected format: ip:port")?,
                ),
                None => None,
            };
            run_connect(peer_id, lan, public)?
        }
        "listen" => run_listen()?,
        _ => {
            eprintln!("Error: Invalid mode '{}'", args[1]);
            eprintln!();
            print_usage(&args[0]);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_usage(program_name: &str) {
    eprintln!("steamroll-p2p - P2P connectivity with NAT characterization and hole punching");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  {} stun                                        # Characterize your NAT", program_name);
    eprintln!("  {} connect <peer_id> <lan:port> [public:port]  # Connect to a peer", program_name);
    eprintln!("  {} listen                                      # Answer hole punch requests", program_name);
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("  STUN_SERVER         Primary STUN server (default: stun.l.google.com:19302)");
    eprintln!("  STUN_SERVER_2       Secondary STUN server (default: stun1.l.google.com:19302)");
    eprintln!("  PEER_ID             Your peer identifier (default: random)");
    eprintln!("  HOST_NAME           Your advertised host name (default: PEER_ID)");
    eprintln!("  LAN_IP              Your LAN address (default: 0.0.0.0)");
    eprintln!("  TRANSFER_PORT       Your advertised transfer port (default: 47999)");
    eprintln!();
    eprintln!("  DISCOVERY_PORT      Local UDP port for coordination messages (default: 48000)");
    eprintln!("  DISCOVERY_PEER      Peer's ip:port for coordination messages");
    eprintln!("                      (required for connect/listen; normally a discovery");
    eprintln!("                      service carries these, this binary relays over UDP)");
    eprintln!();
    eprintln!("Example workflow:");
    eprintln!("    # Peer 1 (Bob) waits for the punch");
    eprintln!("    export PEER_ID=bob DISCOVERY_PORT=48000 DISCOVERY_PEER=<alice_ip>:48001");
    eprintln!("    {} listen", program_name);
    eprintln!();
    eprintln!("    # Peer 2 (Alice) initiates");
    eprintln!("    export PEER_ID=alice DISCOVERY_PORT=48001 DISCOVERY_PEER=<bob_ip>:48000");
    eprintln!("    {} connect bob <bob_lan>:47999 <bob_public>:47999", program_name);
}

fn config_from_env() -> P2pConfig {
    let mut config = P2pConfig::default();
    if let Ok(server) = env::var("STUN_SERVER") {
        config.stun_servers[0] = server;
    }
    if let Ok(server) = env::var("STUN_SERVER_2") {
        config.stun_servers[1] = server;
    }
    config
}

fn identity_from_env() -> Result<LocalIdentity> {
    let peer_id = env::var("PEER_ID").unwrap_or_else(|_| {
        let random_id = format!("peer_{}", rand::random::<u32>());
        println!("PEER_ID not set, using random ID: {}", random_id);
        random_id
    });
    let host_name = env::var("HOST_NAME").unwrap_or_else(|_| peer_id.clone());
    let lan_ip: IpAddr = env::var("LAN_IP")
        .unwrap_or_else(|_| "0.0.0.0".to_string())
        .parse()
        .context("Invalid LAN_IP")?;
    let transfer_port: u16 = env::var("TRANSFER_PORT")
        .unwrap_or_else(|_| "47999".to_string())
        .parse()
        .context("Invalid TRANSFER_PORT")?;
    Ok(LocalIdentity {
        peer_id,
        host_name,
        lan_ip,
        transfer_port,
    })
}

/// Characterize the local NAT against the two configured servers.
fn run_stun() -> Result<()> {
    let config = config_from_env();
    println!("steamroll-p2p - NAT Characterization");
    println!();
    println!("Configuration:");
    println!("  Primary STUN   : {}", config.stun_servers[0]);
    println!("  Secondary STUN : {}", config.stun_servers[1]);
    println!();

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async {
        let client = StunClient::new(config.stun_timeout);
        client
            .detect_nat_type(&config.stun_servers[0], &config.stun_servers[1])
            .await
    });

    if result.success {
        println!("NAT type        : {:?}", result.nat_type);
        match result.public_endpoint() {
            Some(endpoint) => println!("Public endpoint : {}", endpoint),
            None => println!("Public endpoint : unknown"),
        }
        println!(
            "Hole punching   : {}",
            if result.nat_type.supports_hole_punching() {
                "supported"
            } else {
                "not supported from this side alone"
            }
        );
    } else {
        println!("NAT type        : {:?}", result.nat_type);
        println!(
            "Characterization failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }

    Ok(())
}

/// Connect to a peer: direct TCP first, hole punch as fallback. The
/// coordination channel is a plain UDP relay to DISCOVERY_PEER, standing
/// in for the discovery service that normally carries these envelopes.
fn run_connect(peer_id: &str, lan: SocketAddr, public: Option<SocketAddr>) -> Result<()> {
    let config = config_from_env();
    let identity = identity_from_env()?;

    if identity.peer_id == peer_id {
        eprintln!("Error: cannot connect to yourself");
        std::process::exit(1);
    }

    println!("steamroll-p2p - Connect");
    println!();
    println!("Configuration:");
    println!("  My peer ID   : {}", identity.peer_id);
    println!("  Target peer  : {}", peer_id);
    println!("  Peer LAN     : {}", lan);
    match public {
        Some(endpoint) => println!("  Peer public  : {}", endpoint),
        None => println!("  Peer public  : unknown (direct only)"),
    }
    println!();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let (connector, _incoming) = PeerConnector::new(config, identity, outbound_tx);
        spawn_discovery_relay(connector.coordinator(), outbound_rx).await?;

        println!("Connecting...");
        let result = connector.connect(peer_id, lan, public).await;

        if result.success {
            println!();
            println!("Connected to {} via {:?}", peer_id, result.method);
            if let Some(remote) = result.remote_endpoint {
                println!("Remote endpoint: {}", remote);
            }
            if result.method == ConnectionMethod::HolePunch {
                println!("NAT hole punch succeeded.");
            }
        } else {
            println!();
            println!(
                "Connection failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            );
            std::process::exit(1);
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

/// Answer hole punch requests until interrupted.
fn run_listen() -> Result<()> {
    let config = config_from_env();
    let identity = identity_from_env()?;

    println!("steamroll-p2p - Listen");
    println!();
    println!("  My peer ID : {}", identity.peer_id);
    println!("  Waiting for hole punch requests (Ctrl+C to exit)...");
    println!();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let (connector, mut incoming) = PeerConnector::new(config, identity, outbound_tx);
        spawn_discovery_relay(connector.coordinator(), outbound_rx).await?;

        while let Some(peer) = incoming.recv().await {
            println!("Peer {} connected from {}", peer.peer_id, peer.remote);
            // The stream is handed to whatever transfer layer sits above;
            // here it is simply dropped after reporting.
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

/// Relay coordination envelopes over a UDP socket: outbound messages go
/// to DISCOVERY_PEER, inbound datagrams feed the coordinator.
async fn spawn_discovery_relay(
    coordinator: Arc<steamroll_p2p::p2p::HolePunchCoordinator>,
    mut outbound: mpsc::Receiver<(String, DiscoveryMessage)>,
) -> Result<()> {
    let port: u16 = env::var("DISCOVERY_PORT")
        .unwrap_or_else(|_| "48000".to_string())
        .parse()
        .context("Invalid DISCOVERY_PORT")?;
    let peer: SocketAddr = env::var("DISCOVERY_PEER")
        .context("DISCOVERY_PEER environment variable not set. Example: 203.0.113.9:48000")?
        .parse()
        .context("Invalid DISCOVERY_PEER. Expected format: ip:port")?;

    let socket = Arc::new(
        UdpSocket::bind(("0.0.0.0", port))
            .await
            .context("Failed to bind discovery port")?,
    );

    let sender = Arc::clone(&socket);
    tokio::spawn(async move {
        while let Some((to, message)) = outbound.recv().await {
            match protocol::encode(&message) {
                Ok(bytes) => {
                    if let Err(err) = sender.send_to(&bytes, peer).await {
                        warn!("failed to relay message for {}: {}", to, err);
                    }
                }
                Err(err) => warn!("failed to encode message for {}: {}", to, err),
            }
        }
    });

    tokio::spawn(async move {
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((len, from)) => match protocol::decode(&buffer[..len]) {
                    Ok(message) => coordinator.handle_message(&message).await,
                    Err(err) => debug!("undecodable datagram from {}: {}", from, err),
                },
                Err(err) => {
                    warn!("discovery socket error: {}", err);
                    break;
                }
            }
        }
    });

    Ok(())
}
