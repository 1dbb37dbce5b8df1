//! Subcommand bodies for the `recon` binary. Each module exposes a `*Config` and `run`.
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::ReconConfig;
use crate::store::{self, Store};

pub mod audit;
pub mod check_env;
pub mod csv_audit;
pub mod inventory;
pub mod profiles;
pub mod repair;

/// Load configuration and open the configured backend.
pub async fn open_store() -> Result<(ReconConfig, Arc<dyn Store>)> {
    let cfg = ReconConfig::from_env().context("loading recon configuration")?;
    let store = store::connect(&cfg)
        .await
        .context("connecting to the backing store")?;
    Ok((cfg, store))
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
