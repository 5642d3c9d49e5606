//! Proposal fork management over the finalized root-hash buffer.
//!
//! Consensus proposes root hashes for unconfirmed blocks, possibly several
//! per version while forks race, and later finalizes exactly one branch.
//! The finalized buffer holds one hash per version; proposals are kept to
//! the side until their branch wins, then promoted in order.

use std::borrow::Cow;

use tracing::debug;

/// Identifies a proposed block, independent of its root hash.
pub type BlockId = [u8; 32];

/// A root hash per finalized version, dense from `start`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootHashBuffer {
    hashes: Vec<[u8; 32]>,
}

impl RootHashBuffer {
    /// Number of finalized versions.
    pub fn n(&self) -> u64 {
        self.hashes.len() as u64
    }

    pub fn get(&self, version: u64) -> [u8; 32] {
        self.hashes[version as usize]
    }

    /// Seeds or overwrites the hash at `version`; versions must arrive
    /// densely.
    pub fn set(&mut self, version: u64, hash: [u8; 32]) {
        let idx = version as usize;
        assert!(idx <= self.hashes.len(), "finalized buffer must stay dense");
        if idx == self.hashes.len() {
            self.hashes.push(hash);
        } else {
            self.hashes[idx] = hash;
        }
    }
}

#[derive(Debug, Clone)]
struct Proposal {
    hash: [u8; 32],
    version: u64,
    block_id: BlockId,
    parent_id: BlockId,
}

/// Unfinalized proposals layered over a finalized buffer.
pub struct ProposalChain<'b> {
    finalized: &'b mut RootHashBuffer,
    /// The block id of the finalized tip; proposals chain back to it.
    tip_id: BlockId,
    proposals: Vec<Proposal>,
}

impl<'b> ProposalChain<'b> {
    pub fn new(finalized: &'b mut RootHashBuffer) -> Self {
        Self { finalized, tip_id: BlockId::default(), proposals: Vec::new() }
    }

    /// Records a proposed root hash. Competing proposals for one version are
    /// fine; they stay until finalization picks a branch.
    pub fn propose(&mut self, hash: [u8; 32], version: u64, block_id: BlockId, parent_id: BlockId) {
        debug_assert!(version >= self.finalized.n(), "proposal below the finalized tip");
        debug!(target: "proposal", version, "proposal recorded");
        self.proposals.push(Proposal { hash, version, block_id, parent_id });
    }

    fn proposal(&self, id: &BlockId) -> Option<&Proposal> {
        self.proposals.iter().find(|p| p.block_id == *id)
    }

    /// Materializes the chain ending at `block_id`: the finalized prefix
    /// plus the proposal branch. An unknown id yields the finalized buffer
    /// itself.
    pub fn find_chain(&self, block_id: BlockId) -> Cow<'_, RootHashBuffer> {
        let Some(tip) = self.proposal(&block_id) else {
            return Cow::Borrowed(&*self.finalized);
        };
        let mut branch = vec![tip];
        let mut parent = tip.parent_id;
        while let Some(p) = self.proposal(&parent) {
            branch.push(p);
            parent = p.parent_id;
        }
        let mut buf = self.finalized.clone();
        for p in branch.into_iter().rev() {
            buf.set(p.version, p.hash);
        }
        Cow::Owned(buf)
    }

    /// Promotes the branch ending at `block_id` into the finalized buffer
    /// and discards proposals that can no longer win.
    pub fn finalize(&mut self, block_id: BlockId) {
        let Some(tip) = self.proposal(&block_id).cloned() else { return };
        let mut branch = vec![tip.clone()];
        let mut parent = tip.parent_id;
        while let Some(p) = self.proposal(&parent).cloned() {
            branch.push(p.clone());
            parent = p.parent_id;
        }
        for p in branch.into_iter().rev() {
            self.finalized.set(p.version, p.hash);
        }
        self.tip_id = tip.block_id;
        let cutoff = tip.version;
        self.proposals.retain(|p| p.version > cutoff);
        debug!(target: "proposal", version = cutoff, "branch finalized");
    }
}
