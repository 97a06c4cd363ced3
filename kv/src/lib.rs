#![allow(non_camel_case_types)]
#![feature(is_terminal)]
#![feature(const_trait_impl)]
#![feature(exact_size_is_empty)]
// just for cursor.is_empty()
#![feature(cursor_remaining)]

//! `kvcore` is the state-machine core of an etcd v3-compatible key-value
//! store: a key index with create/mod revision and version bookkeeping, a
//! transaction evaluator, a lease manager with cascading revocation, a watch
//! fan-out, and the single-threaded apply loop that linearizes all three
//! against a pluggable storage engine. Raft itself lives behind the
//! `RaftHandle` trait and is out of scope here; `SingleNodeRaft` is the
//! reference implementation used for standalone testing.
//!
//! ## Getting started
//!
//! ```rust
//! use std::sync::Arc;
//! use kvcore::apply::Node;
//! use kvcore::apply::codec::RaftOp;
//! use kvcore::raft::{RaftHandle, SingleNodeRaft};
//! use kvcore::storage::engine::Engine;
//! use kvcore::storage::memory::ShardedMemory;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let engine: Box<dyn Engine> = Box::new(ShardedMemory::new());
//! let raft: Arc<dyn RaftHandle> = Arc::new(SingleNodeRaft::new());
//! let node = Arc::new(Node::new(engine, raft, 0));
//!
//! tokio::spawn(node.clone().spawn_apply_loop());
//!
//! node.propose(RaftOp::Put { key: b"a".to_vec(), value: vec![0x01], lease: 0 })
//!     .await
//!     .unwrap();
//! # }
//! ```

pub mod alarm;
pub mod apply;
pub mod error;
pub mod kvstore;
pub mod lease;
pub mod leaseread;
pub mod raft;
pub mod revision;
pub mod storage;
pub mod txn;
pub mod watch;
