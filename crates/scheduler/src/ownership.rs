//! Which job ids this node is responsible for triggering.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use {
    cadence_common::{JobId, NodeId},
    cadence_config::{OwnershipConfig, OwnershipMode},
    sha2::{Digest, Sha256},
    tokio::sync::watch,
    tracing::debug,
};

/// Virtual nodes placed on the hash ring for every physical node.
pub const VIRTUAL_NODES: usize = 100;

/// A partition of the job id space.
pub trait Ownership: Send + Sync + fmt::Debug {
    fn owns(&self, job_id: &str) -> bool;

    fn owned_job_ids(&self, candidates: &[JobId]) -> Vec<JobId> {
        candidates
            .iter()
            .filter(|id| self.owns(id))
            .cloned()
            .collect()
    }
}

/// Owns every job. Used by single-node deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnAll;

impl Ownership for OwnAll {
    fn owns(&self, _job_id: &str) -> bool {
        true
    }
}

/// Owns an explicit set of job ids.
#[derive(Debug, Clone, Default)]
pub struct ExplicitOwnership {
    ids: HashSet<JobId>,
}

impl ExplicitOwnership {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<JobId>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl Ownership for ExplicitOwnership {
    fn owns(&self, job_id: &str) -> bool {
        self.ids.contains(job_id)
    }
}

fn hash64(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Consistent hash ring over the nodes holding one shard.
#[derive(Debug, Clone, Default)]
struct HashRing {
    ring: BTreeMap<u64, NodeId>,
}

impl HashRing {
    fn new(nodes: &[NodeId]) -> Self {
        let mut ring = BTreeMap::new();
        for node in nodes {
            for i in 0..VIRTUAL_NODES {
                ring.insert(hash64(&format!("{node}-{i}")), node.clone());
            }
        }
        Self { ring }
    }

    fn node_for(&self, key: &str) -> Option<&NodeId> {
        let h = hash64(key);
        self.ring
            .range(h..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node)
    }
}

/// Ownership derived from shard routing: a job belongs to the shard its id
/// hashes to, and within that shard to the node the consistent hash ring
/// picks among the nodes holding a copy.
#[derive(Debug, Clone)]
pub struct ShardOwnership {
    local: NodeId,
    shard_count: u32,
    rings: HashMap<u32, HashRing>,
}

impl ShardOwnership {
    pub fn new(local: NodeId, shard_count: u32, routing: &[(u32, Vec<NodeId>)]) -> Self {
        let rings = routing
            .iter()
            .filter(|(_, nodes)| nodes.contains(&local))
            .map(|(shard, nodes)| (*shard, HashRing::new(nodes)))
            .collect();
        Self {
            local,
            shard_count: shard_count.max(1),
            rings,
        }
    }

    pub fn shard_for(&self, job_id: &str) -> u32 {
        let shard = hash64(job_id) % u64::from(self.shard_count);
        u32::try_from(shard).unwrap_or_default()
    }

    /// Shards with a local copy.
    pub fn local_shards(&self) -> Vec<u32> {
        let mut shards: Vec<u32> = self.rings.keys().copied().collect();
        shards.sort_unstable();
        shards
    }
}

impl Ownership for ShardOwnership {
    fn owns(&self, job_id: &str) -> bool {
        self.rings
            .get(&self.shard_for(job_id))
            .and_then(|ring| ring.node_for(job_id))
            .is_some_and(|node| *node == self.local)
    }
}

/// Build the ownership model described by the configuration.
pub fn ownership_from_config(local: &NodeId, config: &OwnershipConfig) -> Arc<dyn Ownership> {
    match config.mode {
        OwnershipMode::All => Arc::new(OwnAll),
        OwnershipMode::Shards => {
            let routing: Vec<(u32, Vec<NodeId>)> = config
                .routing
                .iter()
                .map(|r| (r.shard, r.nodes.iter().map(|n| NodeId::new(n.as_str())).collect()))
                .collect();
            let ownership = ShardOwnership::new(local.clone(), config.shard_count, &routing);
            debug!(node = %local, shards = ?ownership.local_shards(), "shard ownership built");
            Arc::new(ownership)
        },
    }
}

/// Point-in-time ownership plus a generation that increases on every change.
#[derive(Clone)]
pub struct OwnershipSnapshot {
    pub generation: u64,
    pub ownership: Arc<dyn Ownership>,
}

impl fmt::Debug for OwnershipSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnershipSnapshot")
            .field("generation", &self.generation)
            .field("ownership", &self.ownership)
            .finish()
    }
}

/// Publishes ownership changes (for example a routing update) to the sweeper.
#[derive(Clone)]
pub struct OwnershipHandle {
    tx: watch::Sender<OwnershipSnapshot>,
}

impl OwnershipHandle {
    pub fn new(ownership: Arc<dyn Ownership>) -> Self {
        let (tx, _rx) = watch::channel(OwnershipSnapshot {
            generation: 0,
            ownership,
        });
        Self { tx }
    }

    pub fn current(&self) -> OwnershipSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<OwnershipSnapshot> {
        self.tx.subscribe()
    }

    /// Install a new ownership model and return its generation.
    pub fn replace(&self, ownership: Arc<dyn Ownership>) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|snapshot| {
            snapshot.generation += 1;
            snapshot.ownership = ownership;
            generation = snapshot.generation;
        });
        generation
    }
}

impl Default for OwnershipHandle {
    fn default() -> Self {
        Self::new(Arc::new(OwnAll))
    }
}
