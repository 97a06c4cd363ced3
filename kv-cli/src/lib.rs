//! `kvserverd`: an etcd v3-compatible gRPC server over `kvcore`, plus a
//! debug REPL that talks to the local node directly.
//!
//! ## Getting started
//!
//! ```doc
//! ❯ kvserverd
//! kvserverd listening on 0.0.0.0:2379
//! ```
//!
//! Or, for the debug REPL against an in-process node:
//!
//! ```doc
//! ❯ kvserverd --repl
//!
//! kvserverd > SET order_key xxx
//! OK ~
//!
//! kvserverd > keys
//! order_key
//!
//! kvserverd > ksize
//! 1
//!
//! kvserverd > GET order_key
//! xxx
//!
//! kvserverd > DEL order_key
//! OK ~
//!
//! kvserverd > GET order_key
//! N/A ~
//! ```

pub mod pb;
pub mod repl;
pub mod rusty;
pub mod server;
pub mod trace;
