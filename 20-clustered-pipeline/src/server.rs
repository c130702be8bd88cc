//! Node assembly and the client-facing TCP server.
//!
//! [`Node::start`] wires rings, the consistency service, the raft runtime and
//! the pipeline stages together from one [`ClusterConfig`]. [`Server`] accepts
//! client connections on a tokio listener and feeds their bytes into the
//! node's read ring.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

use crate::command::CommandRegistry;
use crate::config::ClusterConfig;
use crate::consistency::{Consensus, ConsistencyService};
use crate::error::RingError;
use crate::filter::{Cipher, FilterChain, XorCipher};
use crate::logic::{KvLogic, LogicHandler};
use crate::pipeline::{Pipeline, PipelineParts, PipelineRings};
use crate::raft::{
    spawn_node, HardState, Membership, NodeConfig, NodeStatus, RaftHandle, RaftStorage,
};
use crate::session::{Session, SessionRegistry};
use crate::store::{MemoryStorage, Storage};

const READ_BUFFER: usize = 16 * 1024;
/// Attempts to place bytes on a full read ring before the session is dropped.
const INBOUND_RETRIES: u32 = 50;
const INBOUND_BACKOFF: Duration = Duration::from_millis(2);

/// One running cluster node: pipeline stages plus raft runtime.
pub struct Node {
    pipeline: Arc<Pipeline>,
    sessions: Arc<SessionRegistry>,
    raft: Arc<RaftHandle>,
    storage: Arc<MemoryStorage>,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Starts every component. `raft_listener` is the already bound peer
    /// transport socket of this node.
    pub fn start(config: &ClusterConfig, raft_listener: std::net::TcpListener) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let topology = config.topology()?;

        let registry = Arc::new(CommandRegistry::with_builtin());
        let cipher = config
            .server
            .cipher_key
            .as_ref()
            .map(|key| Arc::new(XorCipher::new(key.as_bytes().to_vec())) as Arc<dyn Cipher>);
        let chain = Arc::new(FilterChain::standard(cipher, registry, config.pipeline.max_frame));
        let storage = Arc::new(MemoryStorage::new());
        let logic: Arc<dyn LogicHandler> = Arc::new(KvLogic::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            topology.gateways(),
        ));
        let sessions = Arc::new(SessionRegistry::new());

        let rings = PipelineRings::new(&config.pipeline);
        let consistency = Arc::new(ConsistencyService::new(
            config.node.id,
            Arc::clone(&rings.cluster),
        ));
        let (sink, relay) = consistency.spawn_commit_relay()?;

        let congress = topology.congress();
        let raft_storage = RaftStorage::open(&config.metadata_path, || {
            HardState::bootstrap(Membership::new(congress))
        })?;
        let mut peers = topology.addresses();
        peers.remove(&config.node.id);
        let raft = Arc::new(spawn_node(
            NodeConfig {
                id: config.node.id,
                gate: config.node.role.is_gate(),
                peers,
                settings: config.raft.clone(),
            },
            raft_listener,
            raft_storage,
            Box::new(sink),
        )?);

        let pipeline = Pipeline::start(
            &config.pipeline,
            &config.raft,
            rings,
            PipelineParts {
                chain,
                logic,
                consistency,
                consensus: Arc::clone(&raft) as Arc<dyn Consensus>,
                sessions: Arc::clone(&sessions),
            },
        )?;

        info!(node_id = config.node.id, raft = %raft.local_addr(), "node started");
        Ok(Self {
            pipeline: Arc::new(pipeline),
            sessions,
            raft,
            storage,
            relay: Mutex::new(Some(relay)),
        })
    }

    pub fn raft_status(&self) -> NodeStatus {
        self.raft.status()
    }

    pub fn raft(&self) -> &RaftHandle {
        &self.raft
    }

    /// Applied key-value state.
    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Stops the pipeline, then raft, then the commit relay. Idempotent.
    pub fn shutdown(&self) {
        for session in self.sessions.established() {
            session.close();
        }
        self.pipeline.shutdown();
        self.raft.shutdown();
        if let Some(relay) = self.relay.lock().take() {
            if relay.join().is_err() {
                warn!("commit relay panicked");
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct Server {
    listener: TcpListener,
    node: Node,
}

impl Server {
    pub fn new(listener: TcpListener, node: Node) -> Self {
        Self { listener, node }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, node } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => spawn_connection(stream, peer, &node),
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                }
            }
        }

        tokio::task::spawn_blocking(move || node.shutdown())
            .await
            .context("node shutdown task failed")?;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, node: &Node) {
    let pipeline = Arc::clone(&node.pipeline);
    let sessions = Arc::clone(&node.sessions);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, pipeline, sessions).await {
            debug!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    pipeline: Arc<Pipeline>,
    sessions: Arc<SessionRegistry>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Arc::new(Session::new(sessions.next_id(), Some(peer), tx));
    sessions.insert(Arc::clone(&session));
    debug!(session = session.id(), %peer, "session opened");

    let mut writer_task = tokio::spawn(write_loop(writer, rx));
    let mut buf = vec![0u8; READ_BUFFER];
    let outcome: Result<()> = async {
        loop {
            select! {
                read = reader.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(());
                    }
                    publish_inbound(&pipeline, &session, Bytes::copy_from_slice(&buf[..n])).await?;
                }
                // The writer stops once the pipeline closes the session.
                _ = &mut writer_task => return Ok(()),
            }
        }
    }
    .await;

    session.close();
    sessions.remove(session.id());
    publish_closed(&pipeline, &session).await;
    debug!(session = session.id(), "session closed");
    outcome
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: UnboundedReceiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(err) = writer.write_all(&bytes).await {
            debug!(error = ?err, "socket write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn publish_inbound(pipeline: &Pipeline, session: &Arc<Session>, bytes: Bytes) -> Result<()> {
    for _ in 0..INBOUND_RETRIES {
        match pipeline.try_inbound(session, bytes.clone()) {
            Ok(()) => return Ok(()),
            Err(RingError::Full) => tokio::time::sleep(INBOUND_BACKOFF).await,
            Err(RingError::Halted) => bail!("pipeline halted"),
        }
    }
    warn!(session = session.id(), "read ring stayed full, dropping session");
    bail!("read ring full")
}

async fn publish_closed(pipeline: &Pipeline, session: &Arc<Session>) {
    loop {
        match pipeline.try_closed(session) {
            Ok(()) | Err(RingError::Halted) => return,
            Err(RingError::Full) => tokio::time::sleep(INBOUND_BACKOFF).await,
        }
    }
}
