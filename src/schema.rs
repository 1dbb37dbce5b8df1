//! Tables and row models of the skincare backend.
//!
//! Rows travel through the store as JSON objects; the typed models here are
//! decoded on demand with serde.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;

pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Profiles,
    UserAnalyses,
    UserAnalysesStaging,
    Routines,
    RoutinesStaging,
    UserRoles,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Profiles,
        Table::UserAnalyses,
        Table::UserAnalysesStaging,
        Table::Routines,
        Table::RoutinesStaging,
        Table::UserRoles,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Profiles => "profiles",
            Table::UserAnalyses => "user_analyses",
            Table::UserAnalysesStaging => "user_analyses_staging",
            Table::Routines => "routines",
            Table::RoutinesStaging => "routines_staging",
            Table::UserRoles => "user_roles",
        }
    }

    pub fn is_staging(self) -> bool {
        matches!(self, Table::UserAnalysesStaging | Table::RoutinesStaging)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A table whose rows carry a `user_id` reference into `profiles`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordTable {
    Analyses,
    Routines,
    UserRoles,
}

impl RecordTable {
    pub fn table(self) -> Table {
        match self {
            RecordTable::Analyses => Table::UserAnalyses,
            RecordTable::Routines => Table::Routines,
            RecordTable::UserRoles => Table::UserRoles,
        }
    }

    pub fn staging(self) -> Option<Table> {
        match self {
            RecordTable::Analyses => Some(Table::UserAnalysesStaging),
            RecordTable::Routines => Some(Table::RoutinesStaging),
            RecordTable::UserRoles => None,
        }
    }

    /// Human-readable column used for advisory similarity hints.
    pub fn label_column(self) -> &'static str {
        match self {
            RecordTable::Analyses => "product_name",
            RecordTable::Routines => "name",
            RecordTable::UserRoles => "role",
        }
    }
}

impl RecordTable {
    pub const ALL: [RecordTable; 3] = [
        RecordTable::Analyses,
        RecordTable::Routines,
        RecordTable::UserRoles,
    ];
}

impl FromStr for RecordTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "analyses" | "user-analyses" => Ok(RecordTable::Analyses),
            "routines" => Ok(RecordTable::Routines),
            "user-roles" | "roles" => Ok(RecordTable::UserRoles),
            other => Err(format!(
                "unknown record table {other:?} (expected analyses, routines or user-roles)"
            )),
        }
    }
}

impl fmt::Display for RecordTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table().name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub ingredients_list: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub recommendations: Option<Value>,
    #[serde(default)]
    pub analyzed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutineRecord {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRole {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub role: String,
}

/// Audit projection of any user-owned row.
///
/// `user_id` is `None` when the column is NULL or does not hold a UUID; such a
/// row can never resolve to a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub label: Option<String>,
}

impl RecordRef {
    pub fn from_row(row: &Row, label_column: &str) -> Result<Self, StoreError> {
        let id = row
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| StoreError::Backend(format!("row without a uuid id: {:?}", row.get("id"))))?;
        let user_id = row
            .get("user_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s.trim()).ok());
        let label = row
            .get(label_column)
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self { id, user_id, label })
    }
}

pub fn decode_row<T: DeserializeOwned>(row: Row) -> Result<T, StoreError> {
    serde_json::from_value(Value::Object(row))
        .map_err(|e| StoreError::Backend(format!("row decode failed: {e}")))
}

pub fn encode_row<T: Serialize>(value: &T) -> Result<Row, StoreError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::Backend(format!("expected an object row, got {other}"))),
        Err(e) => Err(StoreError::Backend(format!("row encode failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_tables_parse_from_cli_names() {
        assert_eq!("analyses".parse(), Ok(RecordTable::Analyses));
        assert_eq!("user_analyses".parse(), Ok(RecordTable::Analyses));
        assert_eq!("User-Roles".parse(), Ok(RecordTable::UserRoles));
        assert!("profiles".parse::<RecordTable>().is_err());
    }

    #[test]
    fn record_ref_treats_malformed_user_id_as_missing() {
        let row = json!({"id": "11111111-1111-1111-1111-111111111111", "user_id": "cedric", "product_name": "Serum"});
        let r = RecordRef::from_row(row.as_object().unwrap(), "product_name").unwrap();
        assert_eq!(r.user_id, None);
        assert_eq!(r.label.as_deref(), Some("Serum"));
    }

    #[test]
    fn record_ref_requires_uuid_id() {
        let row = json!({"id": 7, "user_id": null});
        assert!(RecordRef::from_row(row.as_object().unwrap(), "name").is_err());
    }

    #[test]
    fn profile_round_trips_through_rows() {
        let p = Profile {
            id: Uuid::nil(),
            email: "a@b.c".into(),
            display_name: None,
            created_at: None,
            updated_at: None,
        };
        let row = encode_row(&p).unwrap();
        assert_eq!(row.get("email"), Some(&json!("a@b.c")));
        let back: Profile = decode_row(row).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn staging_tables_pair_with_record_tables() {
        assert_eq!(RecordTable::Analyses.staging(), Some(Table::UserAnalysesStaging));
        assert_eq!(RecordTable::UserRoles.staging(), None);
        assert!(Table::RoutinesStaging.is_staging());
        assert_eq!(Table::UserAnalyses.to_string(), "user_analyses");
    }
}
