//! Worker runtime and peer transport for a raft node.
//!
//! - **Worker thread**: owns the [`RaftCore`], multiplexes local requests,
//!   peer messages and the tick timer with `crossbeam_channel::select!`
//! - **Listener thread**: accepts peer connections; one reader thread per
//!   connection forwards decoded envelopes to the worker
//! - **Writer threads**: one per peer, fed through a bounded queue, holding a
//!   connection open and reconnecting after failures. Messages to a slow or
//!   unreachable peer are dropped and resent on a later heartbeat.
//!
//! Frames on the wire are `[u32 length (big-endian)][bincode RaftEnvelope]`.

use std::collections::{BTreeSet, HashMap};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::engine::{HardState, LogWrite, Proposed, RaftCore};
use super::log::{EntryKind, LogEntry, RaftLog};
use super::message::RaftEnvelope;
use super::role::RaftState;
use super::topology::Membership;
use super::NodeId;
use crate::config::RaftSettings;
use crate::error::RaftError;
use crate::metadata::{MetadataStore, RecordJournal};

/// Upper bound on a single peer frame.
pub const MAX_PEER_FRAME: usize = 16 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Messages buffered per peer writer before new ones are dropped.
const PEER_QUEUE: usize = 256;

/// Receives committed proposals on the worker thread, in log order.
pub trait CommitSink: Send + 'static {
    fn committed(&mut self, index: u64, data: Vec<u8>);
}

/// Snapshot of a node's raft state, refreshed after every worker iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: RaftState,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub membership: Membership,
}

impl NodeStatus {
    fn of(core: &RaftCore) -> Self {
        Self {
            node_id: core.id(),
            role: core.role(),
            term: core.term(),
            leader_id: core.leader_id(),
            commit_index: core.commit_index(),
            membership: core.membership().clone(),
        }
    }
}

pub struct NodeConfig {
    pub id: NodeId,
    /// Carry the GATE flag in every role this node takes.
    pub gate: bool,
    /// Raft transport address of every other node.
    pub peers: HashMap<NodeId, String>,
    pub settings: RaftSettings,
}

/// Durable state of one node: the hard state record next to a journal of
/// log entries.
pub struct RaftStorage {
    pub metadata: MetadataStore<HardState>,
    pub journal: RecordJournal<LogEntry>,
    /// Entries read back from the journal when it was opened.
    pub restored: Vec<LogEntry>,
}

impl RaftStorage {
    /// Opens the hard state at `path` and the journal beside it, with the
    /// `log` extension.
    pub fn open(path: &Path, initial: impl FnOnce() -> HardState) -> Result<Self> {
        let metadata = MetadataStore::open(path, initial)
            .with_context(|| format!("failed to open raft metadata {}", path.display()))?;
        let journal_path = path.with_extension("log");
        let (journal, restored) = RecordJournal::open(&journal_path)
            .with_context(|| format!("failed to open raft journal {}", journal_path.display()))?;
        Ok(Self {
            metadata,
            journal,
            restored,
        })
    }
}

enum Request {
    Propose {
        data: Vec<u8>,
        respond_to: Sender<Result<Proposed, RaftError>>,
    },
    ChangeMembership {
        voters: BTreeSet<NodeId>,
        respond_to: Sender<Result<u64, RaftError>>,
    },
    Campaign,
    Shutdown,
}

/// Handle to a running node. Dropping it stops the worker.
pub struct RaftHandle {
    id: NodeId,
    local_addr: SocketAddr,
    request_tx: Sender<Request>,
    status: Arc<RwLock<NodeStatus>>,
    stopping: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RaftHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Address the peer listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn status(&self) -> NodeStatus {
        self.status.read().clone()
    }

    /// Hands `data` to the core. Returns once it is appended or forwarded,
    /// not once it commits; commits arrive through the [`CommitSink`].
    pub fn propose(&self, data: Vec<u8>) -> Result<Proposed> {
        let (respond_to, response) = bounded(1);
        self.request_tx
            .send(Request::Propose { data, respond_to })
            .context("raft worker stopped")?;
        Ok(response.recv().context("propose response channel closed")??)
    }

    /// Starts a joint-consensus change to `voters` (leader only).
    pub fn change_membership(&self, voters: BTreeSet<NodeId>) -> Result<u64> {
        let (respond_to, response) = bounded(1);
        self.request_tx
            .send(Request::ChangeMembership { voters, respond_to })
            .context("raft worker stopped")?;
        Ok(response.recv().context("membership response channel closed")??)
    }

    pub fn campaign(&self) -> Result<()> {
        self.request_tx
            .send(Request::Campaign)
            .context("raft worker stopped")
    }

    /// Stops the worker and waits for it to exit. Idempotent.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.request_tx.send(Request::Shutdown);
        // Wake the listener so it observes the flag.
        let _ = TcpStream::connect_timeout(&self.local_addr, CONNECT_TIMEOUT);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!(node_id = self.id, "raft worker panicked");
            }
        }
    }
}

impl Drop for RaftHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawns the worker, listener and peer writer threads for one node.
///
/// The hard state and log are restored from `storage`, and every change to
/// them is written there before messages carrying it leave the node.
/// Committed entries are handed to `sink` again from index 1.
pub fn spawn_node(
    config: NodeConfig,
    listener: TcpListener,
    storage: RaftStorage,
    sink: Box<dyn CommitSink>,
) -> Result<RaftHandle> {
    if config.peers.contains_key(&config.id) {
        bail!("node {} lists itself as a peer", config.id);
    }
    let local_addr = listener
        .local_addr()
        .context("raft listener has no local address")?;
    let RaftStorage {
        metadata,
        journal,
        restored,
    } = storage;
    let log = RaftLog::restore(restored).context("raft journal is not a contiguous log")?;
    let core = RaftCore::new(
        config.id,
        config.settings.clone(),
        metadata.get().clone(),
        log,
        config.gate,
    );
    let status = Arc::new(RwLock::new(NodeStatus::of(&core)));
    let stopping = Arc::new(AtomicBool::new(false));
    let (request_tx, request_rx) = unbounded();
    let (network_tx, network_rx) = unbounded();

    spawn_listener(config.id, listener, network_tx, Arc::clone(&stopping))?;

    let mut outbound = HashMap::with_capacity(config.peers.len());
    for (peer, addr) in config.peers {
        let (tx, rx) = bounded(PEER_QUEUE);
        spawn_peer_writer(config.id, peer, addr, rx)?;
        outbound.insert(peer, tx);
    }

    let worker = Worker {
        core,
        metadata,
        journal,
        sink,
        outbound,
        status: Arc::clone(&status),
        request_rx,
        network_rx,
        tick: config.settings.tick_interval(),
        last_role: RaftState::CLIENT,
    };
    let id = config.id;
    let worker = thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || worker.run())
        .context("failed to spawn raft worker")?;
    info!(node_id = id, addr = %local_addr, "raft node started");

    Ok(RaftHandle {
        id,
        local_addr,
        request_tx,
        status,
        stopping,
        worker: Mutex::new(Some(worker)),
    })
}

struct Worker {
    core: RaftCore,
    metadata: MetadataStore<HardState>,
    journal: RecordJournal<LogEntry>,
    sink: Box<dyn CommitSink>,
    outbound: HashMap<NodeId, Sender<RaftEnvelope>>,
    status: Arc<RwLock<NodeStatus>>,
    request_rx: Receiver<Request>,
    network_rx: Receiver<RaftEnvelope>,
    tick: Duration,
    last_role: RaftState,
}

impl Worker {
    fn run(mut self) {
        let mut last_tick = Instant::now();
        loop {
            let timeout = self.tick.saturating_sub(last_tick.elapsed());
            crossbeam_channel::select! {
                recv(self.request_rx) -> request => match request {
                    Ok(request) => {
                        if !self.handle_request(request) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(self.network_rx) -> envelope => match envelope {
                    Ok(envelope) => self.core.step(envelope),
                    Err(_) => break,
                },
                default(timeout) => {}
            }

            if last_tick.elapsed() >= self.tick {
                self.core.tick();
                last_tick = Instant::now();
            }
            self.process_ready();
        }
        debug!(node_id = self.core.id(), "raft worker stopped");
    }

    fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::Propose { data, respond_to } => {
                let _ = respond_to.send(self.core.propose(data));
            }
            Request::ChangeMembership { voters, respond_to } => {
                let _ = respond_to.send(self.core.propose_membership(voters));
            }
            Request::Campaign => self.core.campaign(),
            Request::Shutdown => return false,
        }
        true
    }

    fn process_ready(&mut self) {
        while self.core.has_ready() {
            let ready = self.core.ready();
            if let Some(write) = ready.log {
                self.persist(write);
            }
            if let Some(hard) = ready.hard_state {
                self.metadata.store(hard);
            }
            for envelope in ready.messages {
                match self.outbound.get(&envelope.to) {
                    Some(tx) => {
                        enqueue(self.core.id(), tx, envelope);
                    }
                    None => warn!(
                        node_id = self.core.id(),
                        to = envelope.to,
                        "no address for peer, dropping message"
                    ),
                }
            }
            for entry in ready.committed {
                if let EntryKind::Normal(data) = entry.kind {
                    self.sink.committed(entry.index, data);
                }
            }
        }

        let status = NodeStatus::of(&self.core);
        if status.role != self.last_role {
            info!(
                node_id = status.node_id,
                term = status.term,
                role = %status.role,
                leader = ?status.leader_id,
                "raft role"
            );
            self.last_role = status.role;
        }
        let mut current = self.status.write();
        if *current != status {
            *current = status;
        }
    }

    fn persist(&mut self, write: LogWrite) {
        let keep = write.from.saturating_sub(1) as usize;
        let written = self
            .journal
            .truncate(keep)
            .and_then(|()| self.journal.append(&write.entries));
        if let Err(err) = written {
            warn!(
                node_id = self.core.id(),
                from = write.from,
                entries = write.entries.len(),
                error = %err,
                "raft journal write failed"
            );
        }
    }
}

/// Queues `envelope` for a peer writer without blocking the worker.
fn enqueue(id: NodeId, tx: &Sender<RaftEnvelope>, envelope: RaftEnvelope) -> bool {
    match tx.try_send(envelope) {
        Ok(()) => true,
        Err(TrySendError::Full(envelope)) => {
            debug!(node_id = id, to = envelope.to, "peer queue full, dropping message");
            false
        }
        Err(TrySendError::Disconnected(envelope)) => {
            debug!(node_id = id, to = envelope.to, "peer writer gone, dropping message");
            false
        }
    }
}

fn spawn_listener(
    id: NodeId,
    listener: TcpListener,
    tx: Sender<RaftEnvelope>,
    stopping: Arc<AtomicBool>,
) -> Result<()> {
    thread::Builder::new()
        .name(format!("raft-listener-{id}"))
        .spawn(move || {
            for stream in listener.incoming() {
                if stopping.load(Ordering::Acquire) {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        let spawned = thread::Builder::new()
                            .name(format!("raft-reader-{id}"))
                            .spawn(move || {
                                if let Err(err) = handle_connection(id, stream, tx) {
                                    debug!(node_id = id, error = %err, "peer connection closed");
                                }
                            });
                        if let Err(err) = spawned {
                            warn!(node_id = id, error = %err, "failed to spawn peer reader");
                        }
                    }
                    Err(err) => warn!(node_id = id, error = %err, "accept failed"),
                }
            }
        })
        .map(|_| ())
        .context("failed to spawn raft listener")
}

fn handle_connection(id: NodeId, mut stream: TcpStream, tx: Sender<RaftEnvelope>) -> Result<()> {
    while let Some(envelope) = read_frame(&mut stream)? {
        if envelope.to != id {
            warn!(node_id = id, to = envelope.to, "misaddressed raft message");
            continue;
        }
        if tx.send(envelope).is_err() {
            break;
        }
    }
    Ok(())
}

fn spawn_peer_writer(
    id: NodeId,
    peer: NodeId,
    addr: String,
    rx: Receiver<RaftEnvelope>,
) -> Result<()> {
    thread::Builder::new()
        .name(format!("raft-writer-{id}-{peer}"))
        .spawn(move || {
            let mut stream: Option<TcpStream> = None;
            for envelope in rx.iter() {
                if stream.is_none() {
                    match connect(&addr) {
                        Ok(connected) => stream = Some(connected),
                        Err(err) => {
                            debug!(node_id = id, peer, %addr, error = %err, "peer unreachable");
                            // Stale by the time the peer is back.
                            let dropped = rx.try_iter().count();
                            if dropped > 0 {
                                debug!(node_id = id, peer, dropped, "discarded peer backlog");
                            }
                            continue;
                        }
                    }
                }
                if let Some(connected) = stream.as_mut() {
                    if let Err(err) = write_frame(connected, &envelope) {
                        debug!(node_id = id, peer, error = %err, "peer write failed");
                        stream = None;
                    }
                }
            }
        })
        .map(|_| ())
        .context("failed to spawn peer writer")
}

fn connect(addr: &str) -> io::Result<TcpStream> {
    let mut last_err = io::Error::new(io::ErrorKind::NotFound, format!("{addr} did not resolve"));
    for resolved in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&resolved, CONNECT_TIMEOUT) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

/// Writes one length-prefixed envelope.
pub fn write_frame(stream: &mut impl Write, envelope: &RaftEnvelope) -> Result<()> {
    let body = bincode::serialize(envelope).context("failed to encode raft envelope")?;
    stream.write_all(&(body.len() as u32).to_be_bytes())?;
    stream.write_all(&body)?;
    stream.flush()?;
    Ok(())
}

/// Reads one length-prefixed envelope; `None` on a clean end of stream.
pub fn read_frame(stream: &mut impl Read) -> Result<Option<RaftEnvelope>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_PEER_FRAME {
        bail!("peer frame of {len} bytes exceeds {MAX_PEER_FRAME}");
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    let envelope = bincode::deserialize(&body).context("failed to decode raft envelope")?;
    Ok(Some(envelope))
}
