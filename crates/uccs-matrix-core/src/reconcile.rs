//! Submission reconciliation: insert a decision for a new key, update the
//! existing record otherwise.
//!
//! The lookup and the write are two separate backend calls. Two submissions
//! for the same key racing between them can both take the insert branch and
//! leave two records for one key. Callers are expected to have a single
//! writer per key; closing the window needs an atomic conditional upsert in
//! the backend contract. `uccs decisions check` reports keys that were hit.

use serde::{Deserialize, Serialize};

use crate::{DecisionError, DecisionGateway, DecisionKey, DecisionPayload, SessionConfig};

pub const NO_OFFENSE_SELECTED: &str = "no offense selected";

/// A decision key as captured from the operator, before an offense is
/// guaranteed to be selected.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Submission {
    pub matrix_id: String,
    pub collaborator_email: String,
    pub uccs_code: Option<i64>,
}

impl Submission {
    #[must_use]
    pub fn for_session(config: &SessionConfig, uccs_code: Option<i64>) -> Self {
        Self {
            matrix_id: config.matrix_id().to_string(),
            collaborator_email: config.collaborator_email().to_string(),
            uccs_code,
        }
    }

    /// Resolves the full decision key.
    ///
    /// # Errors
    /// Returns [`DecisionError::Validation`] with [`NO_OFFENSE_SELECTED`] when
    /// no offense code is set.
    pub fn key(&self) -> Result<DecisionKey, DecisionError> {
        let Some(uccs_code) = self.uccs_code else {
            return Err(DecisionError::Validation(NO_OFFENSE_SELECTED.to_string()));
        };

        Ok(DecisionKey {
            matrix_id: self.matrix_id.clone(),
            collaborator_email: self.collaborator_email.clone(),
            uccs_code,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    Created,
    Updated,
}

/// Reconciles one submission against the backend.
///
/// Looks the key up, then updates the match by id or inserts a new record.
/// The local live view is not touched; it learns about the write from the
/// change feed. Failures are not retried.
///
/// # Errors
/// Returns [`DecisionError::Validation`] before any backend call when no
/// offense is selected, and [`DecisionError::Backend`] when the lookup,
/// insert or update fails.
pub fn submit<G>(
    gateway: &mut G,
    submission: &Submission,
    payload: &DecisionPayload,
) -> Result<SubmitOutcome, DecisionError>
where
    G: DecisionGateway + ?Sized,
{
    let key = submission.key()?;

    let existing = gateway.find_decision(&key).map_err(as_backend)?;
    if let Some(existing) = existing {
        let updated = gateway
            .update_decision(existing.id, payload)
            .map_err(as_backend)?;
        tracing::info!(
            decision_id = %updated.id,
            key = %key,
            level = updated.decision_level.as_str(),
            "decision updated"
        );
        return Ok(SubmitOutcome::Updated);
    }

    let created = gateway.insert_decision(&key, payload).map_err(as_backend)?;
    tracing::info!(
        decision_id = %created.id,
        key = %key,
        level = created.decision_level.as_str(),
        "decision created"
    );
    Ok(SubmitOutcome::Created)
}

fn as_backend(err: DecisionError) -> DecisionError {
    match err {
        DecisionError::Backend(_) => err,
        other => DecisionError::Backend(other.message().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{must, MemoryGateway};
    use crate::DecisionLevel;

    fn alice_m1(uccs_code: Option<i64>) -> Submission {
        Submission {
            matrix_id: "M1".to_string(),
            collaborator_email: "alice@x.com".to_string(),
            uccs_code,
        }
    }

    fn payload(level: DecisionLevel, look_back_period: Option<u32>) -> DecisionPayload {
        DecisionPayload {
            decision_level: level,
            look_back_period,
        }
    }

    #[test]
    fn missing_offense_fails_before_any_backend_call() {
        let mut gateway = MemoryGateway::default();
        let result = submit(
            &mut gateway,
            &alice_m1(None),
            &payload(DecisionLevel::Green, None),
        );

        assert_eq!(
            result,
            Err(DecisionError::Validation(NO_OFFENSE_SELECTED.to_string()))
        );
        assert!(gateway.calls().is_empty());
    }

    #[test]
    fn first_submission_inserts_and_second_updates_same_record() {
        let mut gateway = MemoryGateway::default();
        let submission = alice_m1(Some(101));

        let first = must(submit(
            &mut gateway,
            &submission,
            &payload(DecisionLevel::Yellow, Some(2)),
        ));
        assert_eq!(first, SubmitOutcome::Created);
        let created_id = gateway.records[0].id;

        let second = must(submit(
            &mut gateway,
            &submission,
            &payload(DecisionLevel::Red, Some(5)),
        ));
        assert_eq!(second, SubmitOutcome::Updated);

        let key = must(submission.key());
        let stored = gateway.records_for(&key);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, created_id);
        assert_eq!(stored[0].decision_level, DecisionLevel::Red);
        assert_eq!(stored[0].look_back_period, Some(5));
        assert_eq!(
            gateway.calls(),
            vec![
                "find_decision",
                "insert_decision",
                "find_decision",
                "update_decision"
            ]
        );
    }

    #[test]
    fn distinct_offenses_and_collaborators_get_separate_records() {
        let mut gateway = MemoryGateway::default();
        let level = payload(DecisionLevel::Green, None);

        must(submit(&mut gateway, &alice_m1(Some(101)), &level));
        must(submit(&mut gateway, &alice_m1(Some(102)), &level));
        let mut bob = alice_m1(Some(101));
        bob.collaborator_email = "bob@x.com".to_string();
        assert_eq!(must(submit(&mut gateway, &bob, &level)), SubmitOutcome::Created);

        assert_eq!(gateway.records.len(), 3);
    }

    #[test]
    fn lookup_failure_is_reported_without_writing() {
        let mut gateway = MemoryGateway {
            fail_on: Some("find_decision"),
            ..MemoryGateway::default()
        };

        let result = submit(
            &mut gateway,
            &alice_m1(Some(101)),
            &payload(DecisionLevel::Red, None),
        );

        assert_eq!(
            result,
            Err(DecisionError::Backend("find_decision unavailable".to_string()))
        );
        assert_eq!(gateway.calls(), vec!["find_decision"]);
        assert!(gateway.records.is_empty());
    }

    #[test]
    fn insert_and_update_failures_surface_as_backend_errors() {
        let mut gateway = MemoryGateway {
            fail_on: Some("insert_decision"),
            ..MemoryGateway::default()
        };
        let result = submit(
            &mut gateway,
            &alice_m1(Some(101)),
            &payload(DecisionLevel::Red, None),
        );
        assert!(matches!(result, Err(DecisionError::Backend(_))));

        gateway.fail_on = None;
        must(submit(
            &mut gateway,
            &alice_m1(Some(101)),
            &payload(DecisionLevel::Red, None),
        ));
        gateway.fail_on = Some("update_decision");
        let result = submit(
            &mut gateway,
            &alice_m1(Some(101)),
            &payload(DecisionLevel::Green, None),
        );
        assert_eq!(
            result,
            Err(DecisionError::Backend("update_decision unavailable".to_string()))
        );
        assert_eq!(gateway.records[0].decision_level, DecisionLevel::Red);
    }

    #[test]
    fn submission_for_session_copies_identity() {
        let config = must(SessionConfig::new("M1", "alice@x.com"));
        let submission = Submission::for_session(&config, Some(7));
        assert_eq!(submission, alice_m1(Some(7)));
    }
}
