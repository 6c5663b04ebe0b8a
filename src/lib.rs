//! vaultd - vault-side core of a peer-to-peer content-addressed storage network.
//!
//! Clients encrypt files into fixed-hash chunks and ask the network to
//! persist them; a group of vaults collectively enforces accounting (who
//! owes whom how much storage), reference counting (which vaults actually
//! hold a given chunk), and eventual consistency of both under churn.

pub mod account;
pub mod amendment;
pub mod chunkinfo;
pub mod chunkstore;
pub mod config;
pub mod expectation;
pub mod id;
pub mod identity;
pub mod overlay;
pub mod serialization;
pub mod service;
