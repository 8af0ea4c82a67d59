//! Typed wrappers over the shell tools zsilo drives.
//!
//! Each adapter renders argument structs into a shell command string, hands
//! it to an [`crate::exec::Executor`], and parses stdout into typed results.
//! Adapters are stateless and safe to share; they borrow the executor they
//! run against, so the same adapter type works against the producer or any
//! consumer.

pub mod fsops;
pub mod iscsi;
pub mod literal;
pub mod mount;
pub mod zfs;
