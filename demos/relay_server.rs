use clap::Parser;
use env_logger::Env;
use relaypoint::{ConnectivityEvent, Multiaddr, Node, NodeConfig, Reachability};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Listen port; falls back to RELAY_PORT, then 8080.
    /// The WebSocket listener binds the next port up.
    #[arg(short, long)]
    port: Option<u16>,
    /// Identity key file (created on first start).
    #[arg(short, long, default_value = "peer.key")]
    key: String,
    /// Pin reachability to public instead of probing peers.
    #[arg(long)]
    force_public: bool,
}

#[tokio::main]
pub async fn main() -> relaypoint::Result<()> {
    let Args {
        port,
        key,
        force_public,
    } = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let port = port
        .or_else(|| std::env::var("RELAY_PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(8080);
    let addrs: Vec<Multiaddr> = vec![
        format!("/ip4/0.0.0.0/tcp/{port}").parse()?,
        format!("/ip4/0.0.0.0/tcp/{}/ws", port + 1).parse()?,
    ];

    let mut config = NodeConfig::default()
        .set_listen_addrs(addrs)
        .set_key_file(key.into());
    if force_public {
        config = config.set_force_reachability(Reachability::Public);
    }
    let node = Node::new(config).await?;

    log::info!("relay node is running at:");
    for addr in node.addrs() {
        log::info!("{addr}/p2p/{}", node.peer_id());
    }

    let mut events = node.subscribe();
    let (tx, mut quit) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc2::set_async_handler(async move {
        tx.send(()).await.expect("signal handler");
    })
    .await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ConnectivityEvent::Connected { peer, addr, .. }) => {
                    log::info!("connected: {peer} via {addr}");
                    log::info!("connected peers: {}", node.current_peers().len());
                }
                Some(ConnectivityEvent::Disconnected { peer, .. }) => {
                    log::info!("disconnected: {peer}");
                    log::info!("connected peers: {}", node.current_peers().len());
                }
                None => break,
            },
            _ = quit.recv() => break,
        }
    }

    log::info!("shut down initiated...");
    node.shutdown().await;
    Ok(())
}
