//! Human lookup and provisioning of `profiles` rows.
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::schema::{decode_row, encode_row, Profile, Table};
use crate::store::{Filter, Query, Store};

#[derive(Debug, Clone)]
pub struct FindProfileConfig {
    /// Email pattern; `%`/`_` wildcards allowed, bare text matches as a substring.
    pub email: String,
    pub limit: u64,
}

#[derive(Debug, Clone)]
pub struct EnsureProfileConfig {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum EnsureOutcome {
    Created { profile: Profile },
    Existing { profile: Profile },
}

fn like_pattern(raw: &str) -> String {
    let raw = raw.trim();
    if raw.contains('%') || raw.contains('_') {
        raw.to_string()
    } else {
        format!("%{raw}%")
    }
}

pub async fn find(store: &dyn Store, email: &str, limit: u64) -> Result<Vec<Profile>> {
    let query = Query::new()
        .filter(Filter::ilike("email", &like_pattern(email)))
        .order_by("email")
        .range(0, limit.max(1));
    store
        .get(Table::Profiles, &query)
        .await?
        .into_iter()
        .map(|row| decode_row(row).context("decoding profile row"))
        .collect()
}

/// Insert the profile unless a row with that id already exists.
pub async fn ensure(store: &dyn Store, cfg: &EnsureProfileConfig) -> Result<EnsureOutcome> {
    let by_id = Query::new().filter(Filter::eq("id", cfg.id.to_string()));
    if let Some(row) = store.get(Table::Profiles, &by_id).await?.into_iter().next() {
        let profile: Profile = decode_row(row)?;
        info!(id = %profile.id, "profile already exists; left unchanged");
        return Ok(EnsureOutcome::Existing { profile });
    }
    let now = Utc::now();
    let profile = Profile {
        id: cfg.id,
        email: cfg.email.trim().to_string(),
        display_name: cfg.display_name.clone(),
        created_at: Some(now),
        updated_at: Some(now),
    };
    let row = store
        .insert(Table::Profiles, encode_row(&profile)?)
        .await
        .with_context(|| format!("inserting profile {}", cfg.id))?;
    let profile: Profile = decode_row(row)?;
    info!(id = %profile.id, email = %profile.email, "profile created");
    Ok(EnsureOutcome::Created { profile })
}

pub async fn run_find(cfg: FindProfileConfig) -> Result<()> {
    let (_, store) = super::open_store().await?;
    let profiles = find(store.as_ref(), &cfg.email, cfg.limit).await?;
    super::print_json(&profiles)
}

pub async fn run_ensure(cfg: EnsureProfileConfig) -> Result<()> {
    let (_, store) = super::open_store().await?;
    let outcome = ensure(store.as_ref(), &cfg).await?;
    super::print_json(&outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryStore, Op};
    use serde_json::json;

    #[tokio::test]
    async fn email_lookup_is_case_insensitive_substring() {
        let store = MemoryStore::new();
        store.seed(
            Table::Profiles,
            [
                json!({"id": Uuid::new_v4().to_string(), "email": "Cedric.M@example.com"}),
                json!({"id": Uuid::new_v4().to_string(), "email": "ana@example.com"}),
            ],
        );
        let found = find(&store, "cedric", 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].email, "Cedric.M@example.com");
        assert_eq!(find(&store, "%@example.com", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn ensure_never_overwrites_an_existing_profile() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.seed(Table::Profiles, [json!({"id": id.to_string(), "email": "old@example.com"})]);
        let cfg = EnsureProfileConfig {
            id,
            email: "new@example.com".into(),
            display_name: None,
        };
        match ensure(&store, &cfg).await.unwrap() {
            EnsureOutcome::Existing { profile } => assert_eq!(profile.email, "old@example.com"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.calls(Op::Insert, Table::Profiles), 0);
    }

    #[tokio::test]
    async fn ensure_creates_missing_profile() {
        let store = MemoryStore::new();
        let cfg = EnsureProfileConfig {
            id: Uuid::new_v4(),
            email: " p1@example.com ".into(),
            display_name: Some("P1".into()),
        };
        let outcome = ensure(&store, &cfg).await.unwrap();
        assert!(matches!(outcome, EnsureOutcome::Created { ref profile } if profile.email == "p1@example.com"));
        assert!(store.row_by_id(Table::Profiles, cfg.id).is_some());
    }
}
