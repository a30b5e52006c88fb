// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! Main executable for the Cash Hub daemon.

#[macro_use]
extern crate log;

use std::process::ExitCode;
use std::sync::Arc;

use cashhub::blockindex::MemoryBlockIndex;
use cashhub::validator::MemoryValidator;
use cashhub::{Config, CoreContext, LaunchError, Opts};
use clap::Parser;

fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let mut opts = Opts::parse();
    opts.process();

    let level = match opts.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();
    trace!("command-line arguments: {opts:?}");

    match run(opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("hubd: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(opts: Opts) -> Result<(), LaunchError> {
    let config = Config::try_from(opts).map_err(|e| LaunchError::Config(e.to_string()))?;
    debug!("resolved configuration: {config:?}");

    // No real consensus/chain-indexing collaborator is wired in yet; these
    // placeholders keep the daemon runnable until one is (see DESIGN.md).
    let block_index = MemoryBlockIndex::new();
    let validator: Arc<dyn cashhub::validator::Validator> = Arc::new(MemoryValidator::default());
    let ctx = CoreContext::new(config, block_index, validator);

    info!("starting runtime...");
    let _runtime = cashhub::runtime::Runtime::start(ctx)?;
    info!("cash hub running, listening for API connections");

    loop {
        std::thread::park();
    }
}
