//! A versioned Merkle-Patricia trie persisted on chunked storage pools.
//!
//! The trie lives on raw block devices with no filesystem help: nodes are
//! appended through segregated hot/cold write streams, every upsert produces
//! a new version whose root offset is recorded in a fixed-capacity ring, and
//! a sliding window of historical versions stays queryable until it expires.
//! Reads are asynchronous and coalesced; a crashed writer rewinds to the
//! last durable root on reopen.

pub mod aux;
pub mod compute;
pub mod copy;
pub mod db;
pub mod find;
pub mod meta;
pub mod nibbles;
pub mod node;
pub mod pages;
pub mod proposal;
pub mod traverse;
pub mod update;
pub mod writer;

pub use aux::{DirtyBitObserver, FailOnDirty, Stream, UpdateAux};
pub use compute::{Compute, Keccak256Compute};
pub use db::{Db, DbConfig, DbReader};
pub use find::{FindCursorResult, FindResult, NodeCursor, ReadContext};
pub use meta::{DbMetadata, RootOffsetRing};
pub use nibbles::{Nibbles, NibblesView};
pub use node::{Child, Node};
pub use pages::NodeDiskPagesSpare15;
pub use proposal::{BlockId, ProposalChain, RootHashBuffer};
pub use update::{Update, UpdateList};
pub use writer::NodeWriter;
