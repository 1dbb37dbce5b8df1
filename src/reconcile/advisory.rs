//! Name-similarity hints for flagged records.
//!
//! Hints are shown to the operator only. They never become actions: a similar
//! product name is weak evidence of ownership.
use serde::Serialize;
use uuid::Uuid;

use super::index::IdentityIndex;
use super::planner::{PlannedAction, ReconciliationAction};

pub const DEFAULT_THRESHOLD: f64 = 0.92;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisoryHint {
    pub record_id: Uuid,
    pub suggested_user_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub score: f64,
    pub label: String,
    pub matched_label: String,
}

fn normalize(label: &str) -> String {
    label
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Best-scoring profile for each record whose label resembles one of that profile's labels.
pub fn suggest(index: &IdentityIndex, record_ids: &[Uuid], threshold: f64) -> Vec<AdvisoryHint> {
    let mut hints = Vec::new();
    for id in record_ids {
        let Some(label) = index.orphan_labels.get(id) else {
            continue;
        };
        let needle = normalize(label);
        if needle.is_empty() {
            continue;
        }
        let mut best: Option<(f64, Uuid, &str)> = None;
        for (user, labels) in &index.labels_by_user {
            for candidate in labels {
                let score = strsim::jaro_winkler(&needle, &normalize(candidate));
                if best.map_or(true, |(b, _, _)| score > b) {
                    best = Some((score, *user, candidate.as_str()));
                }
            }
        }
        if let Some((score, user, matched)) = best.filter(|(s, _, _)| *s >= threshold) {
            hints.push(AdvisoryHint {
                record_id: *id,
                suggested_user_id: user,
                email: index.profile_emails.get(&user).cloned(),
                score,
                label: label.clone(),
                matched_label: matched.to_string(),
            });
        }
    }
    hints
}

/// Attach hints to every flagged action in `plan`.
pub fn annotate(plan: &mut [PlannedAction], index: &IdentityIndex, threshold: f64) {
    for item in plan.iter_mut() {
        if item.action == ReconciliationAction::FlagForDeletion {
            item.advisory = suggest(index, &item.record_ids, threshold);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::index::assemble;
    use crate::schema::{RecordRef, RecordTable};
    use std::collections::BTreeMap;

    fn uid(n: u32) -> Uuid {
        Uuid::parse_str(&format!("{n:08x}-0000-4000-8000-000000000000")).unwrap()
    }

    fn rec(id: u32, user: u32, label: &str) -> RecordRef {
        RecordRef {
            id: uid(id),
            user_id: Some(uid(user)),
            label: Some(label.to_string()),
        }
    }

    fn index() -> IdentityIndex {
        let emails = BTreeMap::from([
            (uid(1), "cedric@example.com".to_string()),
            (uid(3), "ana@example.com".to_string()),
        ]);
        assemble(
            RecordTable::Analyses,
            vec![
                rec(10, 1, "CeraVe Hydrating Cleanser"),
                rec(11, 3, "The Ordinary Niacinamide 10%"),
                rec(20, 2, "Cerave hydrating-cleanser"),
                rec(21, 2, "Sunscreen SPF 50"),
            ],
            emails,
        )
    }

    #[test]
    fn similar_labels_produce_hints() {
        let idx = index();
        let hints = suggest(&idx, &[uid(20), uid(21)], DEFAULT_THRESHOLD);
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].record_id, uid(20));
        assert_eq!(hints[0].suggested_user_id, uid(1));
        assert_eq!(hints[0].email.as_deref(), Some("cedric@example.com"));
        assert!(hints[0].score >= DEFAULT_THRESHOLD);
    }

    #[test]
    fn hints_never_change_the_action() {
        let idx = index();
        let mut plan = vec![PlannedAction {
            table: RecordTable::Analyses,
            user_id: Some(uid(2)),
            record_ids: vec![uid(20), uid(21)],
            action: ReconciliationAction::FlagForDeletion,
            note: None,
            advisory: Vec::new(),
        }];
        annotate(&mut plan, &idx, DEFAULT_THRESHOLD);
        assert_eq!(plan[0].action, ReconciliationAction::FlagForDeletion);
        assert_eq!(plan[0].advisory.len(), 1);
    }

    #[test]
    fn normalization_ignores_case_and_punctuation() {
        assert_eq!(normalize("  CeraVe   Hydrating-Cleanser!"), "cerave hydrating cleanser");
    }
}
