use std::cell::RefCell;

use time::{Duration, OffsetDateTime};
use ulid::Ulid;

use crate::{
    parse_rfc3339_utc, ChangeEvent, ChangeFeed, ChangeKind, Decision, DecisionError,
    DecisionGateway, DecisionId, DecisionKey, DecisionLevel, DecisionPayload, Offense,
    OffenseCatalog, Subscription,
};

pub(crate) fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

pub(crate) fn fixture_time(offset_seconds: i64) -> OffsetDateTime {
    must(parse_rfc3339_utc("2026-02-07T12:00:00Z")) + Duration::seconds(offset_seconds)
}

pub(crate) fn fixture_decision(uccs_code: i64) -> Decision {
    fixture_record(u128::from(uccs_code.unsigned_abs()), uccs_code, DecisionLevel::Green, 0)
}

pub(crate) fn fixture_record(
    id: u128,
    uccs_code: i64,
    decision_level: DecisionLevel,
    offset_seconds: i64,
) -> Decision {
    Decision {
        id: DecisionId(Ulid(id)),
        matrix_id: "M1".to_string(),
        collaborator_email: "alice@x.com".to_string(),
        uccs_code,
        decision_level,
        look_back_period: None,
        updated_at: fixture_time(offset_seconds),
    }
}

/// Backend double that keeps rows in memory, publishes on a real
/// [`ChangeFeed`] and records which operations were called.
#[derive(Debug, Default)]
pub(crate) struct MemoryGateway {
    pub offenses: Vec<Offense>,
    pub records: Vec<Decision>,
    pub feed: ChangeFeed,
    pub fail_on: Option<&'static str>,
    pub(crate) calls: RefCell<Vec<&'static str>>,
    pub(crate) clock: i64,
}

impl MemoryGateway {
    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.calls.borrow().clone()
    }

    pub(crate) fn records_for(&self, key: &DecisionKey) -> Vec<&Decision> {
        self.records.iter().filter(|record| &record.key() == key).collect()
    }

    fn enter(&self, operation: &'static str) -> Result<(), DecisionError> {
        self.calls.borrow_mut().push(operation);
        if self.fail_on == Some(operation) {
            return Err(DecisionError::Backend(format!("{operation} unavailable")));
        }
        Ok(())
    }

    fn tick(&mut self) -> OffsetDateTime {
        self.clock += 1;
        fixture_time(self.clock)
    }
}

impl OffenseCatalog for MemoryGateway {
    fn list_offenses(&self) -> Result<Vec<Offense>, DecisionError> {
        self.enter("list_offenses")?;
        let mut offenses = self.offenses.clone();
        offenses.sort_by_key(|offense| offense.uccs_code);
        Ok(offenses)
    }
}

impl DecisionGateway for MemoryGateway {
    fn find_decision(&self, key: &DecisionKey) -> Result<Option<Decision>, DecisionError> {
        self.enter("find_decision")?;
        Ok(self.records.iter().find(|record| &record.key() == key).cloned())
    }

    fn insert_decision(
        &mut self,
        key: &DecisionKey,
        payload: &DecisionPayload,
    ) -> Result<Decision, DecisionError> {
        self.enter("insert_decision")?;
        let updated_at = self.tick();
        let record = Decision {
            id: DecisionId(Ulid(u128::try_from(self.records.len()).unwrap_or(u128::MAX) + 1)),
            matrix_id: key.matrix_id.clone(),
            collaborator_email: key.collaborator_email.clone(),
            uccs_code: key.uccs_code,
            decision_level: payload.decision_level,
            look_back_period: payload.look_back_period,
            updated_at,
        };
        self.records.push(record.clone());
        self.feed.publish(&ChangeEvent {
            kind: ChangeKind::Insert,
            record: record.clone(),
        });
        Ok(record)
    }

    fn update_decision(
        &mut self,
        id: DecisionId,
        payload: &DecisionPayload,
    ) -> Result<Decision, DecisionError> {
        self.enter("update_decision")?;
        let updated_at = self.tick();
        let Some(record) = self.records.iter_mut().find(|record| record.id == id) else {
            return Err(DecisionError::Backend(format!("decision not found: {id}")));
        };
        record.decision_level = payload.decision_level;
        record.look_back_period = payload.look_back_period;
        record.updated_at = updated_at;
        let record = record.clone();
        self.feed.publish(&ChangeEvent {
            kind: ChangeKind::Update,
            record: record.clone(),
        });
        Ok(record)
    }

    fn list_decisions(&self, matrix_id: &str) -> Result<Vec<Decision>, DecisionError> {
        self.enter("list_decisions")?;
        Ok(self
            .records
            .iter()
            .filter(|record| record.matrix_id == matrix_id)
            .cloned()
            .collect())
    }

    fn subscribe_decision_changes(&self, matrix_id: &str) -> Result<Subscription, DecisionError> {
        self.enter("subscribe_decision_changes")?;
        Ok(self.feed.subscribe(matrix_id))
    }
}
