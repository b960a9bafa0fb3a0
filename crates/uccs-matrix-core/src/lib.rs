//! Core model for the UCCS decision matrix.
//!
//! Operators classify offenses (UCCS codes) into a three-tier
//! [`DecisionLevel`]. Decisions are keyed by matrix, collaborator and offense
//! code; [`reconcile::submit`] keeps that key unique through a
//! lookup-then-insert-or-update protocol and [`live_view::LiveDecisionView`]
//! folds the backend's change feed into an ordered local collection.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod config;
pub mod feed;
pub mod form;
pub mod gateway;
pub mod live_view;
pub mod reconcile;

#[cfg(test)]
mod testing;

pub use config::SessionConfig;
pub use feed::{ChangeFeed, ChangeSource, Subscription};
pub use form::{
    parse_look_back, DecisionForm, MSG_DECISION_SUBMITTED, MSG_DECISION_UPDATED,
    MSG_SELECT_OFFENSE,
};
pub use gateway::{DecisionGateway, OffenseCatalog};
pub use live_view::{LiveDecisionView, MergeOutcome};
pub use reconcile::{submit, Submission, SubmitOutcome, NO_OFFENSE_SELECTED};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DecisionError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl DecisionError {
    /// The bare message without the category prefix, as shown to operators.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Validation(message) | Self::Backend(message) | Self::Configuration(message) => {
                message
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionLevel {
    Green,
    Yellow,
    Red,
}

impl DecisionLevel {
    pub const ALL: [Self; 3] = [Self::Green, Self::Yellow, Self::Red];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Red => "red",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "green" => Some(Self::Green),
            "yellow" => Some(Self::Yellow),
            "red" => Some(Self::Red),
            _ => None,
        }
    }

    /// Tier label used when rendering the decision list.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Green => "Green",
            Self::Yellow => "Yellow",
            Self::Red => "Red",
        }
    }
}

impl Display for DecisionLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Backend-assigned decision identity. Never minted by clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct DecisionId(pub Ulid);

impl DecisionId {
    /// Parses a decision id from its ULID text form.
    ///
    /// # Errors
    /// Returns [`DecisionError::Validation`] when `raw` is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, DecisionError> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| DecisionError::Validation(format!("invalid decision id {raw}: {err}")))
    }
}

impl Display for DecisionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Offense {
    pub uccs_code: i64,
    pub uccs_desc: String,
}

impl Offense {
    /// Decodes a catalog document: a JSON array of `{uccs_code, uccs_desc}`.
    /// The result is sorted by code and rejects duplicate codes.
    ///
    /// # Errors
    /// Returns [`DecisionError::Validation`] when the payload is not a list of
    /// offenses, a description is blank, or a code appears twice.
    pub fn catalog_from_json(value: &Value) -> Result<Vec<Self>, DecisionError> {
        let mut offenses: Vec<Self> = serde_json::from_value(value.clone()).map_err(|err| {
            DecisionError::Validation(format!("invalid offense catalog payload: {err}"))
        })?;

        offenses.sort_by_key(|offense| offense.uccs_code);
        for pair in offenses.windows(2) {
            if pair[0].uccs_code == pair[1].uccs_code {
                return Err(DecisionError::Validation(format!(
                    "duplicate uccs_code {} in offense catalog",
                    pair[0].uccs_code
                )));
            }
        }

        if let Some(blank) = offenses
            .iter()
            .find(|offense| offense.uccs_desc.trim().is_empty())
        {
            return Err(DecisionError::Validation(format!(
                "uccs_desc MUST be provided for uccs_code {}",
                blank.uccs_code
            )));
        }

        Ok(offenses)
    }
}

/// The uniqueness key of a decision.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DecisionKey {
    pub matrix_id: String,
    pub collaborator_email: String,
    pub uccs_code: i64,
}

impl Display for DecisionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.matrix_id, self.collaborator_email, self.uccs_code
        )
    }
}

/// The mutable part of a decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct DecisionPayload {
    pub decision_level: DecisionLevel,
    pub look_back_period: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Decision {
    pub id: DecisionId,
    pub matrix_id: String,
    pub collaborator_email: String,
    pub uccs_code: i64,
    pub decision_level: DecisionLevel,
    pub look_back_period: Option<u32>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Decision {
    #[must_use]
    pub fn key(&self) -> DecisionKey {
        DecisionKey {
            matrix_id: self.matrix_id.clone(),
            collaborator_email: self.collaborator_email.clone(),
            uccs_code: self.uccs_code,
        }
    }

    #[must_use]
    pub fn payload(&self) -> DecisionPayload {
        DecisionPayload {
            decision_level: self.decision_level,
            look_back_period: self.look_back_period,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One notification from the change feed. For deletes `record` is the row as
/// it was before removal.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub record: Decision,
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`DecisionError::Validation`] when parsing fails or the timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, DecisionError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| DecisionError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(DecisionError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`DecisionError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, DecisionError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            DecisionError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_decision() -> Decision {
        Decision {
            id: must_ok(DecisionId::parse("01J0SQQP7M70P6Y3R4T8D8G8M2")),
            matrix_id: "M1".to_string(),
            collaborator_email: "alice@x.com".to_string(),
            uccs_code: 101,
            decision_level: DecisionLevel::Yellow,
            look_back_period: Some(2),
            updated_at: must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z")),
        }
    }

    #[test]
    fn decision_level_text_forms_are_closed() {
        for level in DecisionLevel::ALL {
            assert_eq!(DecisionLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(DecisionLevel::parse("Green"), None);
        assert_eq!(DecisionLevel::parse("blue"), None);
        assert_eq!(DecisionLevel::Red.to_string(), "Red");
    }

    #[test]
    fn decision_json_contract_is_stable() {
        let value = must_ok(serde_json::to_value(fixture_decision()));
        assert_eq!(
            value,
            json!({
                "id": "01J0SQQP7M70P6Y3R4T8D8G8M2",
                "matrix_id": "M1",
                "collaborator_email": "alice@x.com",
                "uccs_code": 101,
                "decision_level": "yellow",
                "look_back_period": 2,
                "updated_at": "2026-02-07T12:00:00Z"
            })
        );
    }

    #[test]
    fn change_event_serializes_kind_in_snake_case() {
        let event = ChangeEvent {
            kind: ChangeKind::Update,
            record: fixture_decision(),
        };
        let value = must_ok(serde_json::to_value(event));
        assert_eq!(value["kind"], json!("update"));
        assert_eq!(value["record"]["uccs_code"], json!(101));

        for kind in [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete] {
            assert_eq!(ChangeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ChangeKind::parse("upsert"), None);
    }

    #[test]
    fn decision_key_is_derived_from_record() {
        let decision = fixture_decision();
        assert_eq!(decision.key().to_string(), "M1/alice@x.com/101");
        assert_eq!(decision.payload().look_back_period, Some(2));
    }

    #[test]
    fn offense_catalog_is_sorted_and_rejects_duplicates() {
        let catalog = must_ok(Offense::catalog_from_json(&json!([
            {"uccs_code": 300, "uccs_desc": "Burglary"},
            {"uccs_code": 101, "uccs_desc": "Homicide"}
        ])));
        assert_eq!(catalog[0].uccs_code, 101);
        assert_eq!(catalog[1].uccs_code, 300);

        let duplicate = Offense::catalog_from_json(&json!([
            {"uccs_code": 101, "uccs_desc": "Homicide"},
            {"uccs_code": 101, "uccs_desc": "Murder"}
        ]));
        assert!(matches!(duplicate, Err(DecisionError::Validation(_))));

        let blank = Offense::catalog_from_json(&json!([{"uccs_code": 7, "uccs_desc": " "}]));
        assert!(blank.is_err());
    }

    #[test]
    fn parse_rfc3339_rejects_non_utc() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        let parsed = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        assert_eq!(must_ok(format_rfc3339(parsed)), "2026-02-07T12:00:00Z");
    }

    #[test]
    fn error_message_strips_category() {
        let err = DecisionError::Backend("connection reset".to_string());
        assert_eq!(err.message(), "connection reset");
        assert_eq!(err.to_string(), "backend error: connection reset");
    }
}
