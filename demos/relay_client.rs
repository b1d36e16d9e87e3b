use std::sync::Arc;

use clap::Parser;
use env_logger::Env;
use relaypoint::{Multiaddr, Node, NodeConfig, PeerId, Stream, StreamHandler};

const ECHO_PROTOCOL: &str = "/relaypoint-demo/echo/1.0.0";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Relay address, e.g. /ip4/192.0.2.1/tcp/8080/p2p/<relay-id>
    #[arg(short, long)]
    relay: String,
    /// Peer id to reach through the relay. Without it the client reserves
    /// a slot, prints its relayed addresses and answers echo requests.
    #[arg(short, long)]
    target: Option<String>,
    /// Local listen port (0 picks one).
    #[arg(short, long)]
    port: Option<u16>,
}

struct Echo;

#[async_trait::async_trait]
impl StreamHandler for Echo {
    async fn handle(&self, peer: PeerId, _addr: Multiaddr, mut stream: Stream) {
        log::info!("echo stream from {peer}");
        while let Some(chunk) = stream.read().await {
            if stream.write(&chunk).await.is_err() {
                break;
            }
        }
        _ = stream.shutdown().await;
    }
}

#[tokio::main]
pub async fn main() -> relaypoint::Result<()> {
    let Args {
        relay,
        target,
        port,
    } = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let relay_addr: Multiaddr = relay.parse()?;
    let relay_peer = relay_addr
        .peer_id()
        .expect("relay address must end in /p2p/<relay-id>");

    let config = NodeConfig::default().set_listen_addrs(vec![format!(
        "/ip4/0.0.0.0/tcp/{}",
        port.unwrap_or(0)
    )
    .parse()?]);
    let node = Node::new(config).await?;
    node.register_handler(ECHO_PROTOCOL, Arc::new(Echo))?;
    node.dial(&relay_addr).await?;

    match target {
        None => {
            let info = node.reserve(relay_peer).await?;
            log::info!("reserved for {:?}; reachable at:", info.ttl);
            for addr in &info.addrs {
                log::info!("{addr}");
            }
            let (tx, mut quit) = tokio::sync::mpsc::channel::<()>(1);
            ctrlc2::set_async_handler(async move {
                tx.send(()).await.expect("signal handler");
            })
            .await;
            _ = quit.recv().await;
        }
        Some(target) => {
            let target: PeerId = target.parse().map_err(relaypoint::Error::Io)?;
            let mut stream = node.connect_via(relay_peer, target, ECHO_PROTOCOL).await?;
            stream.write(b"ping through the relay").await?;
            if let Some(reply) = stream.read().await {
                log::info!("echo reply: {}", String::from_utf8_lossy(&reply));
            }
            match node.hole_punch(relay_peer, target).await {
                Ok(conn) => log::info!("upgraded to direct connection via {}", conn.remote_addr()),
                Err(e) => log::info!("staying on the relayed path: {e}"),
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
