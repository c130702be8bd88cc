#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener as StdListener};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::{BufMut, BytesMut};
use clustered_pipeline::command::Command;
use clustered_pipeline::config::ClusterConfig;
use clustered_pipeline::filter::PREAMBLE;
use clustered_pipeline::raft::{NodeId, RaftNode, RaftState};
use clustered_pipeline::server::{Node, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Binds one loopback raft listener per node id.
pub fn bind_raft(ids: &[NodeId]) -> Result<Vec<(NodeId, StdListener)>> {
    ids.iter()
        .map(|&id| Ok((id, StdListener::bind("127.0.0.1:0")?)))
        .collect()
}

/// Fast-ticking config for node `id` with every other listener as a peer.
pub fn config_for(
    id: NodeId,
    listeners: &[(NodeId, StdListener)],
    dir: &Path,
) -> Result<ClusterConfig> {
    let mut config = ClusterConfig::development();
    config.peers.clear();
    for (node_id, listener) in listeners {
        let port = listener.local_addr()?.port();
        let node = RaftNode::new(*node_id, "127.0.0.1", port, RaftState::FOLLOWER);
        if *node_id == id {
            config.node = node;
        } else {
            config.peers.push(node);
        }
    }
    config.raft.tick_millis = 10;
    config.raft.proposal_timeout_ticks = 300;
    config.pipeline.worker_count = 2;
    config.metadata_path = dir.join(format!("node-{id}.bin"));
    config.validate()?;
    Ok(config)
}

pub fn wait_for<F: Fn() -> bool>(what: &str, limit: Duration, check: F) -> Result<()> {
    let start = Instant::now();
    while !check() {
        if start.elapsed() > limit {
            bail!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

pub fn wait_for_leader(node: &Node) -> Result<()> {
    wait_for("leader", Duration::from_secs(5), || {
        node.raft_status().leader_id.is_some()
    })
}

/// Runs `node` behind a loopback client listener until the returned sender
/// fires or is dropped.
pub async fn serve(node: Node) -> Result<(SocketAddr, oneshot::Sender<()>, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = Server::new(listener, node);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = server.run_until(shutdown).await;
    });
    Ok((addr, shutdown_tx, task))
}

/// Framed-protocol client.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&PREAMBLE).await?;
        Ok(Self { stream })
    }

    /// Connects without the preamble, as an MQTT client does.
    pub async fn connect_plain(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self { stream })
    }

    pub async fn send(&mut self, command: &Command) -> Result<()> {
        let mut body = BytesMut::new();
        command.encode(&mut body);
        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32(body.len() as u32);
        frame.extend_from_slice(&body);
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Command> {
        timeout(REPLY_TIMEOUT, async {
            let len = self.stream.read_u32().await? as usize;
            let mut body = vec![0u8; len];
            self.stream.read_exact(&mut body).await?;
            let (command, _) = Command::decode(&body).context("truncated command")?;
            Ok::<_, anyhow::Error>(command)
        })
        .await
        .context("no reply in time")?
    }

    /// Reads exactly `len` bytes off the wire.
    pub async fn recv_raw(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        timeout(REPLY_TIMEOUT, self.stream.read_exact(&mut bytes))
            .await
            .context("no reply in time")??;
        Ok(bytes)
    }

    pub async fn request(&mut self, command: &Command) -> Result<Command> {
        self.send(command).await?;
        self.recv().await
    }

    /// Whether the server closed the connection.
    pub async fn closed_by_server(&mut self) -> Result<bool> {
        let mut byte = [0u8; 1];
        match timeout(REPLY_TIMEOUT, self.stream.read(&mut byte)).await {
            Ok(Ok(0)) | Ok(Err(_)) => Ok(true),
            Ok(Ok(_)) => Ok(false),
            Err(_) => Ok(false),
        }
    }
}
