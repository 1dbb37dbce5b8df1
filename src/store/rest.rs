//! Supabase PostgREST backend (`/rest/v1/<table>`).
//!
//! The API key decides the credential tier: the anon key is subject to
//! row-level security, the service-role key bypasses it. PostgREST answers an
//! RLS-filtered write with an empty result instead of an error, so writes under
//! the read-only tier are refused here.
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::{debug, instrument};

use super::{ensure_ident, ensure_scoped, value_text, Filter, Query, Store};
use crate::config::CredentialTier;
use crate::error::StoreError;
use crate::schema::{Row, Table};

#[derive(Clone)]
pub struct RestStore {
    http: Client,
    base_url: String,
    tier: CredentialTier,
}

impl RestStore {
    pub fn new(
        base_url: &str,
        api_key: &str,
        tier: CredentialTier,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let mut key = HeaderValue::from_str(api_key).context("api key is not a valid header value")?;
        key.set_sensitive(true);
        headers.insert("apikey", key);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .context("api key is not a valid header value")?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let http = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tier,
        })
    }

    fn ensure_writable(&self, op: &str, table: Table) -> Result<(), StoreError> {
        match self.tier {
            CredentialTier::Service => Ok(()),
            CredentialTier::ReadOnly => Err(StoreError::Authorization(format!(
                "{op} on {table} needs the service-role credential"
            ))),
        }
    }

    fn endpoint(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.name())
    }

    fn request(&self, method: Method, table: Table) -> RequestBuilder {
        self.http.request(method, self.endpoint(table))
    }

    async fn send_rows(&self, req: RequestBuilder) -> Result<Vec<Row>, StoreError> {
        let resp = req.send().await.map_err(transport)?;
        let status = resp.status();
        let body = resp.text().await.map_err(transport)?;
        if !status.is_success() {
            return Err(classify_response(status, &body));
        }
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str::<Vec<Row>>(&body)
            .map_err(|e| StoreError::Backend(format!("unexpected response body: {e}")))
    }
}

/// Encode filters into PostgREST query parameters.
pub(crate) fn filter_pairs(filters: &[Filter]) -> Result<Vec<(String, String)>, StoreError> {
    let mut out = Vec::with_capacity(filters.len());
    for f in filters {
        let col = ensure_ident(f.column())?.to_string();
        let expr = match f {
            Filter::Eq(_, Value::Null) => "is.null".to_string(),
            Filter::Eq(_, v) => format!("eq.{}", value_text(v)),
            Filter::In(_, vs) => {
                let items = vs
                    .iter()
                    .map(|v| {
                        let s = value_text(v).replace('\\', "\\\\").replace('"', "\\\"");
                        format!("\"{s}\"")
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                format!("in.({items})")
            }
            Filter::ILike(_, p) => format!("ilike.{p}"),
        };
        out.push((col, expr));
    }
    Ok(out)
}

pub(crate) fn query_pairs(query: &Query) -> Result<Vec<(String, String)>, StoreError> {
    let mut out = Vec::new();
    let select = match &query.columns {
        Some(cols) => cols
            .iter()
            .map(|c| ensure_ident(c).map(str::to_string))
            .collect::<Result<Vec<_>, _>>()?
            .join(","),
        None => "*".to_string(),
    };
    out.push(("select".to_string(), select));
    out.extend(filter_pairs(&query.filters)?);
    if let Some(col) = &query.order_by {
        out.push(("order".to_string(), format!("{}.asc", ensure_ident(col)?)));
    }
    if let Some(offset) = query.offset {
        out.push(("offset".to_string(), offset.to_string()));
    }
    if let Some(limit) = query.limit {
        out.push(("limit".to_string(), limit.to_string()));
    }
    Ok(out)
}

/// Total from a `Content-Range` header such as `0-499/1200` or `*/0`.
pub(crate) fn parse_content_range_total(raw: &str) -> Option<u64> {
    raw.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok())
}

fn transport(e: reqwest::Error) -> StoreError {
    if e.is_decode() {
        StoreError::Backend(e.to_string())
    } else {
        StoreError::Connection(e.to_string())
    }
}

/// Map a non-success PostgREST response onto the store taxonomy.
pub(crate) fn classify_response(status: StatusCode, body: &str) -> StoreError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|v| v.get("code"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.get(..200).unwrap_or(body).to_string());
    let detail = format!("http {}: {message}", status.as_u16());

    if code == "42501"
        || code == "25006"
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
    {
        StoreError::Authorization(detail)
    } else if code.starts_with("23") || status == StatusCode::CONFLICT {
        StoreError::Constraint(detail)
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        StoreError::Connection(detail)
    } else {
        StoreError::Backend(detail)
    }
}

#[async_trait]
impl Store for RestStore {
    #[instrument(skip(self, query), fields(table = %table))]
    async fn get(&self, table: Table, query: &Query) -> Result<Vec<Row>, StoreError> {
        let pairs = query_pairs(query)?;
        debug!(params = ?pairs, "rest get");
        self.send_rows(self.request(Method::GET, table).query(&pairs))
            .await
    }

    #[instrument(skip(self, filters), fields(table = %table))]
    async fn count(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError> {
        let mut pairs = filter_pairs(filters)?;
        pairs.push(("select".into(), "id".into()));
        let resp = self
            .request(Method::HEAD, table)
            .query(&pairs)
            .header("Prefer", "count=exact")
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(classify_response(status, ""));
        }
        resp.headers()
            .get(CONTENT_RANGE)
            .and_then(|h| h.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| StoreError::Backend("count response without Content-Range total".into()))
    }

    #[instrument(skip(self, row), fields(table = %table))]
    async fn insert(&self, table: Table, row: Row) -> Result<Row, StoreError> {
        self.ensure_writable("insert", table)?;
        let req = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(&row);
        self.send_rows(req)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Backend(format!("insert into {table} returned no row")))
    }

    #[instrument(skip(self, row), fields(table = %table))]
    async fn upsert(&self, table: Table, row: Row) -> Result<Row, StoreError> {
        self.ensure_writable("upsert", table)?;
        if !row.contains_key("id") {
            return Err(StoreError::Backend(format!("upsert into {table} without id")));
        }
        let req = self
            .request(Method::POST, table)
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&row);
        self.send_rows(req)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Backend(format!("upsert into {table} returned no row")))
    }

    #[instrument(skip(self, filters, patch), fields(table = %table))]
    async fn update(&self, table: Table, filters: &[Filter], patch: Row) -> Result<u64, StoreError> {
        self.ensure_writable("update", table)?;
        ensure_scoped("update", table, filters)?;
        let mut pairs = filter_pairs(filters)?;
        pairs.push(("select".into(), "id".into()));
        let req = self
            .request(Method::PATCH, table)
            .query(&pairs)
            .header("Prefer", "return=representation")
            .json(&patch);
        Ok(self.send_rows(req).await?.len() as u64)
    }

    #[instrument(skip(self, filters), fields(table = %table))]
    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError> {
        self.ensure_writable("delete", table)?;
        ensure_scoped("delete", table, filters)?;
        let mut pairs = filter_pairs(filters)?;
        pairs.push(("select".into(), "id".into()));
        let req = self
            .request(Method::DELETE, table)
            .query(&pairs)
            .header("Prefer", "return=representation");
        Ok(self.send_rows(req).await?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_encodes_postgrest_operators() {
        let q = Query::new()
            .filter(Filter::eq("user_id", "abc"))
            .filter(Filter::Eq("brand".into(), Value::Null))
            .filter(Filter::is_in("id", ["a", "b\"c"]))
            .filter(Filter::ilike("email", "%cedric%"))
            .select(&["id", "user_id"])
            .order_by("id")
            .range(1000, 500);
        let pairs = query_pairs(&q).unwrap();
        let get = |k: &str| {
            pairs
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("select"), Some("id,user_id"));
        assert_eq!(get("user_id"), Some("eq.abc"));
        assert_eq!(get("brand"), Some("is.null"));
        assert_eq!(get("id"), Some("in.(\"a\",\"b\\\"c\")"));
        assert_eq!(get("email"), Some("ilike.%cedric%"));
        assert_eq!(get("order"), Some("id.asc"));
        assert_eq!(get("offset"), Some("1000"));
        assert_eq!(get("limit"), Some("500"));
    }

    #[test]
    fn default_projection_is_star() {
        let pairs = query_pairs(&Query::new()).unwrap();
        assert_eq!(pairs, vec![("select".to_string(), "*".to_string())]);
    }

    #[test]
    fn content_range_totals() {
        assert_eq!(parse_content_range_total("0-499/1200"), Some(1200));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-9/*"), None);
    }

    #[test]
    fn responses_classify_into_taxonomy() {
        let rls = r#"{"code":"42501","message":"new row violates row-level security policy"}"#;
        assert!(matches!(
            classify_response(StatusCode::BAD_REQUEST, rls),
            StoreError::Authorization(_)
        ));
        let dup = r#"{"code":"23505","message":"duplicate key value"}"#;
        assert!(matches!(
            classify_response(StatusCode::CONFLICT, dup),
            StoreError::Constraint(_)
        ));
        assert!(matches!(
            classify_response(StatusCode::SERVICE_UNAVAILABLE, "upstream down"),
            StoreError::Connection(_)
        ));
        assert!(matches!(
            classify_response(StatusCode::UNAUTHORIZED, ""),
            StoreError::Authorization(_)
        ));
        assert!(matches!(
            classify_response(StatusCode::BAD_REQUEST, r#"{"code":"PGRST100","message":"parse"}"#),
            StoreError::Backend(_)
        ));
    }

    #[test]
    fn client_rejects_unprintable_keys() {
        let t = Duration::from_secs(1);
        assert!(RestStore::new("https://x.supabase.co", "bad\nkey", CredentialTier::Service, t).is_err());
        let ok = RestStore::new("https://x.supabase.co/", "key", CredentialTier::Service, t).unwrap();
        assert_eq!(ok.endpoint(Table::Profiles), "https://x.supabase.co/rest/v1/profiles");
    }

    #[tokio::test]
    async fn read_only_tier_refuses_writes_before_sending() {
        // Unroutable host: any request that got sent would fail as a connection error.
        let store = RestStore::new(
            "http://127.0.0.1:9",
            "anon",
            CredentialTier::ReadOnly,
            Duration::from_millis(200),
        )
        .unwrap();
        let by_id = [Filter::eq("id", "a")];
        let mut patch = Row::new();
        patch.insert("user_id".into(), Value::String("b".into()));

        let err = store.update(Table::UserAnalyses, &by_id, patch.clone()).await.unwrap_err();
        assert!(err.is_authorization(), "{err:?}");
        let err = store.delete(Table::UserAnalysesStaging, &by_id).await.unwrap_err();
        assert!(err.is_authorization(), "{err:?}");
        let mut row = patch;
        row.insert("id".into(), Value::String("a".into()));
        assert!(store.upsert(Table::UserAnalyses, row.clone()).await.unwrap_err().is_authorization());
        assert!(store.insert(Table::Profiles, row).await.unwrap_err().is_authorization());
    }
}
