// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! The core of a Bitcoin-Cash full-node Hub: an append-only, memory-mapped
//! UTXO storage engine (`utxo`) and a binary RPC-style API network layer
//! (`wire`, `net`, `dispatcher`, `parser`, `subscriptions`). Consensus
//! validation, the script interpreter, the wallet, P2P gossip, mining, and
//! chain-parameter tables are external collaborators, modeled as the
//! `BlockIndex` and `Validator` traits and injected via `CoreContext`.

pub mod blockindex;
pub mod codec;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod net;
pub mod parser;
pub mod subscriptions;
pub mod utxo;
pub mod validator;
pub mod wire;

#[cfg(feature = "server")]
pub mod opts;
pub mod runtime;

pub use config::Config;
pub use context::CoreContext;
pub use error::{DaemonError, LaunchError};
#[cfg(feature = "server")]
pub use opts::Opts;
