use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::Result;
use tracing::info;

use crate::schema::Table;
use crate::store::Store;

#[derive(Debug, Clone, Default)]
pub struct InventoryConfig {
    pub json: bool,
}

/// Exact row counts for every table the workflow touches, staging included.
pub async fn collect(store: &dyn Store) -> Result<BTreeMap<&'static str, u64>> {
    let mut counts = BTreeMap::new();
    for table in Table::ALL {
        let n = store.count(table, &[]).await?;
        info!(%table, rows = n, "counted");
        counts.insert(table.name(), n);
    }
    Ok(counts)
}

pub fn render(counts: &BTreeMap<&'static str, u64>) -> String {
    let mut out = String::new();
    writeln!(out, "DATA INVENTORY:").ok();
    for (table, n) in counts {
        writeln!(out, "{table}: {n}").ok();
    }
    out
}

pub async fn run(cfg: InventoryConfig) -> Result<()> {
    let (_, store) = super::open_store().await?;
    let counts = collect(store.as_ref()).await?;
    if cfg.json {
        super::print_json(&counts)
    } else {
        print!("{}", render(&counts));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn counts_include_staging_tables() {
        let store = MemoryStore::new();
        store.seed(Table::UserAnalysesStaging, [json!({"id": "a"}), json!({"id": "b"})]);
        let counts = collect(&store).await.unwrap();
        assert_eq!(counts.len(), Table::ALL.len());
        assert_eq!(counts["user_analyses_staging"], 2);
        assert_eq!(counts["profiles"], 0);
        assert!(render(&counts).contains("user_analyses_staging: 2"));
    }
}
