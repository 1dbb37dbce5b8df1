use anyhow::{Context, Result};

use crate::config::{BackendConfig, ReconConfig, REQUIRED_HINT};
use crate::schema::Table;
use crate::store::{self, Store};
use crate::util::env as env_util;

#[derive(Debug, Clone, Default)]
pub struct CheckEnvConfig {
    /// Also open the backend and count `profiles`.
    pub connect: bool,
}

pub async fn run(cfg: CheckEnvConfig) -> Result<()> {
    let snapshot = env_util::preflight_check("recon", &[], REQUIRED_HINT)?;
    println!("ENVIRONMENT:");
    for (key, value) in &snapshot {
        let shown = if value.is_empty() { "<unset>" } else { value.as_str() };
        println!("{key}={shown}");
    }

    let recon_cfg = ReconConfig::from_env().context("configuration is incomplete")?;
    let backend = match &recon_cfg.backend {
        BackendConfig::Rest { .. } => "rest",
        BackendConfig::Postgres { .. } => "postgres",
    };
    println!("backend: {backend} (tier {})", recon_cfg.tier);
    println!("page size: {}", recon_cfg.page_size);

    if cfg.connect {
        let store = store::connect(&recon_cfg).await?;
        let profiles = store
            .count(Table::Profiles, &[])
            .await
            .context("counting profiles")?;
        println!("connected; profiles: {profiles}");
    }
    Ok(())
}
