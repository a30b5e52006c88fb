// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! Global mutable state — chain parameters, the block index, the validator
//! — is passed to every subsystem as a `CoreContext` rather than reached for
//! globally. Tests inject an in-memory
//! `BlockIndex` and `Validator` through this same seam.

use std::sync::Arc;

use crate::blockindex::BlockIndex;
use crate::validator::Validator;
use crate::Config;

/// Bundles the two external-collaborator interfaces a subsystem needs, plus the resolved configuration. Cheaply
/// cloneable: every field is an `Arc`.
#[derive(Clone)]
pub struct CoreContext {
    pub config: Arc<Config>,
    pub block_index: Arc<dyn BlockIndex>,
    pub validator: Arc<dyn Validator>,
}

impl CoreContext {
    pub fn new(config: Config, block_index: Arc<dyn BlockIndex>, validator: Arc<dyn Validator>) -> Self {
        Self { config: Arc::new(config), block_index, validator }
    }
}
