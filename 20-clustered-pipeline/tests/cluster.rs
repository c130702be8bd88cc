//! Three-node clusters on loopback: raft agreement through the peer
//! transport, then a full pipeline round trip through a follower.

mod common;

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use anyhow::{Context, Result};
use clustered_pipeline::command::{serial, RaftNotify};
use clustered_pipeline::config::RaftSettings;
use clustered_pipeline::logic::PutRequest;
use clustered_pipeline::raft::{
    spawn_node, CommitSink, HardState, Membership, NodeConfig, NodeId, Proposed, RaftHandle,
    RaftStorage,
};
use clustered_pipeline::server::Node;
use clustered_pipeline::store::Storage;
use crossbeam_channel::{unbounded, Receiver, Sender};

use common::{bind_raft, config_for, serve, wait_for, Client};

const IDS: [NodeId; 3] = [1, 2, 3];

struct ChannelSink(Sender<(u64, Vec<u8>)>);

impl CommitSink for ChannelSink {
    fn committed(&mut self, index: u64, data: Vec<u8>) {
        let _ = self.0.send((index, data));
    }
}

fn fast_settings() -> RaftSettings {
    RaftSettings {
        tick_millis: 10,
        ..RaftSettings::default()
    }
}

/// Id of the leader every status agrees on, if any.
fn agreed_leader(statuses: impl IntoIterator<Item = Option<NodeId>>) -> Option<NodeId> {
    let mut agreed = None;
    for leader in statuses {
        let leader = leader?;
        match agreed {
            None => agreed = Some(leader),
            Some(seen) if seen != leader => return None,
            Some(_) => {}
        }
    }
    agreed
}

type Commits = Receiver<(u64, Vec<u8>)>;

fn spawn_raft_node(
    dir: &std::path::Path,
    id: NodeId,
    voters: &[NodeId],
    listener: std::net::TcpListener,
    peers: HashMap<NodeId, String>,
) -> Result<(RaftHandle, Commits)> {
    let storage = RaftStorage::open(&dir.join(format!("raft-{id}.bin")), || {
        HardState::bootstrap(Membership::new(voters.iter().copied()))
    })?;
    let (tx, rx) = unbounded();
    let handle = spawn_node(
        NodeConfig {
            id,
            gate: false,
            peers,
            settings: fast_settings(),
        },
        listener,
        storage,
        Box::new(ChannelSink(tx)),
    )?;
    Ok((handle, rx))
}

fn spawn_raft_cluster(dir: &std::path::Path) -> Result<Vec<(RaftHandle, Commits)>> {
    let listeners = bind_raft(&IDS)?;
    let addresses: HashMap<NodeId, String> = listeners
        .iter()
        .map(|(id, listener)| Ok((*id, listener.local_addr()?.to_string())))
        .collect::<Result<_>>()?;

    let mut nodes = Vec::new();
    for (id, listener) in listeners {
        let mut peers = addresses.clone();
        peers.remove(&id);
        nodes.push(spawn_raft_node(dir, id, &IDS, listener, peers)?);
    }
    Ok(nodes)
}

#[test]
fn three_nodes_elect_and_agree_on_forwarded_proposals() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let nodes = spawn_raft_cluster(dir.path())?;

    wait_for("agreed leader", Duration::from_secs(10), || {
        agreed_leader(nodes.iter().map(|(handle, _)| handle.status().leader_id)).is_some()
    })?;
    let leader = agreed_leader(nodes.iter().map(|(handle, _)| handle.status().leader_id))
        .context("leader lost")?;
    let leaders = nodes
        .iter()
        .filter(|(handle, _)| handle.status().role.is_leader())
        .count();
    assert_eq!(leaders, 1);

    let (follower, _) = nodes
        .iter()
        .find(|(handle, _)| handle.id() != leader)
        .context("no follower")?;
    assert_eq!(
        follower.propose(b"from-follower".to_vec())?,
        Proposed::Forwarded { leader }
    );
    let (leader_handle, _) = nodes
        .iter()
        .find(|(handle, _)| handle.id() == leader)
        .context("no leader handle")?;
    assert!(matches!(
        leader_handle.propose(b"from-leader".to_vec())?,
        Proposed::Appended { .. }
    ));

    let mut logs = Vec::new();
    for (handle, commits) in &nodes {
        let mut seen = Vec::new();
        while seen.len() < 2 {
            let (index, data) = commits
                .recv_timeout(Duration::from_secs(5))
                .with_context(|| format!("node {} missed a commit", handle.id()))?;
            seen.push((index, data));
        }
        logs.push(seen);
    }
    assert!(logs.windows(2).all(|pair| pair[0] == pair[1]));
    let payloads: Vec<&[u8]> = logs[0].iter().map(|(_, data)| data.as_slice()).collect();
    assert!(payloads.contains(&b"from-follower".as_slice()));
    assert!(payloads.contains(&b"from-leader".as_slice()));
    assert!(logs[0][0].0 < logs[0][1].0);

    for (handle, _) in &nodes {
        handle.shutdown();
    }
    Ok(())
}

#[test]
fn leader_removes_a_voter_through_joint_consensus() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let nodes = spawn_raft_cluster(dir.path())?;
    wait_for("agreed leader", Duration::from_secs(10), || {
        agreed_leader(nodes.iter().map(|(handle, _)| handle.status().leader_id)).is_some()
    })?;
    let leader = agreed_leader(nodes.iter().map(|(handle, _)| handle.status().leader_id))
        .context("leader lost")?;
    let (leader_handle, _) = nodes
        .iter()
        .find(|(handle, _)| handle.id() == leader)
        .context("no leader handle")?;
    let removed = IDS
        .into_iter()
        .find(|&id| id != leader)
        .context("no follower")?;
    let remaining: BTreeSet<NodeId> = IDS.into_iter().filter(|&id| id != removed).collect();

    leader_handle.change_membership(remaining.clone())?;
    let target = Membership::new(remaining.iter().copied());
    wait_for("final configuration", Duration::from_secs(10), || {
        nodes
            .iter()
            .filter(|(handle, _)| remaining.contains(&handle.id()))
            .all(|(handle, _)| {
                let status = handle.status();
                status.membership == target && !status.role.is_joint()
            })
    })?;

    for (handle, _) in &nodes {
        handle.shutdown();
    }
    Ok(())
}

#[test]
fn restarted_node_replays_its_committed_log() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let spawn = || -> Result<(RaftHandle, Commits)> {
        let (_, listener) = bind_raft(&[1])?.pop().context("no listener")?;
        spawn_raft_node(dir.path(), 1, &[1], listener, HashMap::new())
    };

    let (handle, commits) = spawn()?;
    wait_for("self election", Duration::from_secs(10), || {
        handle.status().role.is_leader()
    })?;
    handle.propose(b"durable".to_vec())?;
    let (index, data) = commits.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(data, b"durable");
    handle.shutdown();
    drop(handle);

    let (handle, commits) = spawn()?;
    let replayed = commits.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(replayed, (index, b"durable".to_vec()));
    handle.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn put_through_follower_replicates_to_every_node() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut listeners = bind_raft(&IDS)?;
    let configs = IDS
        .iter()
        .map(|&id| config_for(id, &listeners, dir.path()))
        .collect::<Result<Vec<_>>>()?;

    let mut nodes = Vec::new();
    for config in &configs {
        let index = listeners
            .iter()
            .position(|(id, _)| *id == config.node.id)
            .context("listener missing")?;
        let (_, listener) = listeners.remove(index);
        nodes.push(Node::start(config, listener)?);
    }

    wait_for("agreed leader", Duration::from_secs(10), || {
        agreed_leader(nodes.iter().map(|node| node.raft_status().leader_id)).is_some()
    })?;
    let leader = agreed_leader(nodes.iter().map(|node| node.raft_status().leader_id))
        .context("leader lost")?;
    let follower = nodes
        .iter()
        .position(|node| node.raft().id() != leader)
        .context("no follower")?;
    let entry = nodes.remove(follower);
    let (addr, shutdown, server) = serve(entry).await?;

    let mut client = Client::connect(addr).await?;
    let put = PutRequest {
        key: "region".into(),
        value: "north".into(),
    }
    .to_command()?;
    let ack = client.request(&put).await?;
    assert_eq!(ack.serial(), serial::RAFT_NOTIFY);
    let notify = RaftNotify::from_command(&ack)?;
    assert_eq!(notify.payload_serial, serial::PUT);

    wait_for("replicated value", Duration::from_secs(5), || {
        nodes
            .iter()
            .all(|node| node.storage().query("region").as_deref() == Some("north"))
    })?;

    let _ = shutdown.send(());
    server.await?;
    for node in &nodes {
        node.shutdown();
    }
    Ok(())
}
