// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! Top-level daemon errors: everything a
//! subsystem can fail with either surfaces as a `CommandFailed` reply to the
//! peer that asked for it, or — for storage errors — is fatal to the engine.

use amplify::{Display, Error, From};

use crate::utxo::UtxoError;
use crate::wire::WireError;

/// Failures that can occur while launching the daemon, before any connection
/// has been accepted.
#[derive(Clone, Eq, PartialEq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum LaunchError {
    /// failed to open the UTXO engine.
    ///
    /// {0}
    #[from]
    Utxo(UtxoError),

    /// configuration is invalid: {0}
    Config(String),

    /// unable to bind API listener on {0}: {1}
    Bind(std::net::SocketAddr, String),
}

/// Failures surfaced while the daemon is running. Protocol and parser errors
/// are reported to the offending connection as `CommandFailed`; storage
/// errors are fatal.
#[derive(Clone, Eq, PartialEq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum DaemonError {
    /// malformed wire frame.
    ///
    /// {0}
    #[from]
    Wire(WireError),

    /// UTXO engine failure.
    ///
    /// {0}
    ///
    /// This is fatal: the engine refuses further requests once it occurs.
    #[from]
    Utxo(UtxoError),

    /// referenced block was not found.
    BlockNotFound,

    /// request is missing a required field.
    MissingField(&'static str),

    /// unable to join {0} thread.
    Thread(&'static str),
}
