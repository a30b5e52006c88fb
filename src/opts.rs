// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! Command-line arguments for the `hubd` daemon binary.

use std::path::PathBuf;

use clap::{Parser, ValueHint};

#[cfg(any(target_os = "linux", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
pub const DEFAULT_DATA_DIR: &str = "~/.cash-hub";
#[cfg(target_os = "macos")]
pub const DEFAULT_DATA_DIR: &str = "~/Library/Application Support/Cash Hub";
#[cfg(target_os = "windows")]
pub const DEFAULT_DATA_DIR: &str = "~\\AppData\\Local\\Cash Hub";

pub const DEFAULT_CONFIG: &str = "{data_dir}/hubd.yaml";

/// Command-line arguments. Values also accepted via a YAML
/// config file or environment variables; CLI flags take precedence.
#[derive(Parser, Clone, Debug)]
#[clap(author, version, name = "hubd", about = "Bitcoin-Cash full-node Hub")]
pub struct Opts {
    /// Path to the configuration file.
    #[clap(short, long, global = true, default_value = DEFAULT_CONFIG, env = "HUB_CONFIG", value_hint = ValueHint::FilePath)]
    pub config: String,

    /// Verbosity level; can be repeated to increase verbosity.
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Base directory UTXO files live under.
    #[clap(short, long, global = true, default_value = DEFAULT_DATA_DIR, env = "HUB_DATA_DIR", value_hint = ValueHint::DirPath)]
    pub data_dir: PathBuf,

    /// Additional read-only search path for block files; repeatable.
    #[clap(long = "block-data-dir", value_hint = ValueHint::DirPath)]
    pub block_data_dir: Vec<PathBuf>,

    /// API bind address(es); repeatable.
    #[clap(long = "api-listen", env = "HUB_API_LISTEN")]
    pub api_listen: Vec<String>,

    /// Upper bound on script-hashes per connection's filter/subscription;
    /// `-1` means unlimited.
    #[clap(long, default_value_t = -1)]
    pub api_max_addresses: i64,

    /// Disable the API server entirely.
    #[clap(long)]
    pub no_api: bool,
}

impl Opts {
    /// Expands a leading `~` in `data_dir`, the way clap can't on its own.
    pub fn process(&mut self) { self.data_dir = PathBuf::from(shellexpand::tilde(&self.data_dir.display().to_string()).to_string()); }
}
