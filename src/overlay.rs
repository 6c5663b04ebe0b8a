//! Overlay (DHT) collaborator (§4.10): who else is responsible for a key.
//!
//! Everything in this core that needs "the K nodes closest to X" — fanning
//! out a `StorePrep`, finding a chunk's `chunk_info_holders` for an
//! amendment quorum, deciding whether a request came from a legitimate
//! close-group member — goes through this trait rather than hard-coding a
//! routing table, mirroring how `freenet/traits.rs` abstracts the mesh
//! client behind `FreenetClient` so the core stays testable without a live
//! network. Keys are raw 64-byte digests (a chunk name or an account name)
//! rather than `Id64<K>` directly, so the trait stays object-safe and can
//! be held as `Arc<dyn Overlay>`.

use crate::id::{ID_LEN, Pmid};
use async_trait::async_trait;

#[async_trait]
pub trait Overlay: Send + Sync {
    /// The `k` PMIDs closest to `key` by XOR distance, nearest first.
    async fn closest_group(&self, key: &[u8; ID_LEN], k: usize) -> Vec<Pmid>;

    /// This vault's own PMID.
    fn local_pmid(&self) -> Pmid;

    /// Whether `candidate` is among the `k` nodes closest to `key`.
    async fn is_in_closest_group(&self, key: &[u8; ID_LEN], candidate: &Pmid, k: usize) -> bool {
        self.closest_group(key, k).await.iter().any(|p| p == candidate)
    }
}

/// Deterministic in-memory implementation backed by a fixed membership
/// list, XOR-sorted per lookup. Used for single-process testing and as the
/// bootstrap overlay before a real routing table is wired in; a production
/// deployment replaces this with a Kademlia client without touching any
/// caller of [`Overlay`].
pub struct StaticOverlay {
    local: Pmid,
    members: Vec<Pmid>,
}

impl StaticOverlay {
    pub fn new(local: Pmid, mut members: Vec<Pmid>) -> Self {
        if !members.contains(&local) {
            members.push(local);
        }
        Self { local, members }
    }
}

fn xor_distance(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> [u8; ID_LEN] {
    let mut out = [0u8; ID_LEN];
    for i in 0..ID_LEN {
        out[i] = a[i] ^ b[i];
    }
    out
}

#[async_trait]
impl Overlay for StaticOverlay {
    async fn closest_group(&self, key: &[u8; ID_LEN], k: usize) -> Vec<Pmid> {
        let mut ranked: Vec<(Pmid, [u8; ID_LEN])> = self
            .members
            .iter()
            .map(|pmid| (*pmid, xor_distance(pmid.as_bytes(), key)))
            .collect();
        ranked.sort_by(|a, b| a.1.cmp(&b.1));
        ranked.into_iter().take(k).map(|(pmid, _)| pmid).collect()
    }

    fn local_pmid(&self) -> Pmid {
        self.local
    }
}
