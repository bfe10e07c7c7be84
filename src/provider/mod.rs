//! Provider implementations
//!
//! Only the simulated account ships today; it stands in for the remote
//! identity API behind the same [`declarative::Provider`] contract.

mod iam;

pub use iam::SimulatedIam;

use crate::config::StratumConfig;
use anyhow::Result;

/// Open the provider a configuration points at
pub fn open(config: &StratumConfig) -> Result<SimulatedIam> {
    let path = config.account_path()?;
    log::info!("Using simulated account {}", path.display());
    SimulatedIam::open(path, config.settings.account_id.clone())
}
